//! Mock SSH server implementation using russh

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::Channel;
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Mock sshd configuration.
pub struct MockSshdConfig {
    /// The only user allowed to authenticate.
    pub user: String,
    /// Port to listen on (0 for a random available port).
    pub port: u16,
    /// Host key; generated when absent. Inject the same key to restart a
    /// server on the same identity.
    pub key: Option<KeyPair>,
    /// Refuse every direct-tcpip channel open while keeping the session
    /// itself healthy.
    pub refuse_channels: bool,
}

impl Default for MockSshdConfig {
    fn default() -> Self {
        Self {
            user: "scrape".to_string(),
            port: 0,
            key: None,
            refuse_channels: false,
        }
    }
}

/// Mock SSH server accepting publickey auth and forwarding direct-tcpip
/// channels to local TCP targets.
pub struct MockSshd {
    port: u16,
    server_key: KeyPair,
    handshakes: Arc<AtomicUsize>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
}

impl MockSshd {
    pub async fn start(config: MockSshdConfig) -> Result<Self> {
        let server_key = match config.key {
            Some(key) => key,
            None => KeyPair::generate_ed25519().context("failed to generate server key")?,
        };

        let ssh_config = russh::server::Config {
            keys: vec![server_key.clone()],
            auth_rejection_time: std::time::Duration::from_millis(10),
            auth_rejection_time_initial: Some(std::time::Duration::from_millis(0)),
            ..Default::default()
        };
        let ssh_config = Arc::new(ssh_config);

        let addr: SocketAddr = format!("127.0.0.1:{}", config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();
        debug!(port = actual_port, "mock sshd listening");

        let handshakes = Arc::new(AtomicUsize::new(0));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let user = config.user.clone();
        let refuse_channels = config.refuse_channels;
        let handshakes_acceptor = Arc::clone(&handshakes);
        let tasks_acceptor = Arc::clone(&tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        debug!(%peer_addr, "new ssh connection");
                        let config = Arc::clone(&ssh_config);
                        let handler = SshSessionHandler {
                            user: user.clone(),
                            refuse_channels,
                            handshakes: Arc::clone(&handshakes_acceptor),
                        };
                        let task = tokio::spawn(async move {
                            let session =
                                russh::server::run_stream(config, socket, handler).await;
                            if let Err(e) = session {
                                debug!(err = %e, "ssh session ended with error");
                            }
                        });
                        tasks_acceptor.lock().unwrap().push(task);
                    }
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            port: actual_port,
            server_key,
            handshakes,
            tasks,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_key(&self) -> KeyPair {
        self.server_key.clone()
    }

    /// Number of successful publickey authentications seen.
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// A known-hosts line matching this server for `host`.
    pub fn known_hosts_line(&self, host: &str) -> String {
        let public = self.server_key.clone_public_key().expect("public key");
        format!(
            "[{}]:{} {} {}",
            host,
            self.port,
            public.name(),
            public.public_key_base64()
        )
    }

    /// Tear the server down hard: stop accepting and sever every
    /// established session's socket.
    pub fn abort(&self) {
        self.accept_task.abort();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockSshd {
    fn drop(&mut self) {
        self.abort();
    }
}

struct SshSessionHandler {
    user: String,
    refuse_channels: bool,
    handshakes: Arc<AtomicUsize>,
}

#[async_trait]
impl russh::server::Handler for SshSessionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if user == self.user {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Liveness probes open a plain session channel.
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "direct-tcpip request: {}:{} from {}:{}",
            host_to_connect, port_to_connect, originator_address, originator_port
        );

        if self.refuse_channels {
            return Ok(false);
        }

        let target = format!("{}:{}", host_to_connect, port_to_connect);
        let stream = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%target, err = %e, "target refused connection");
                return Ok(false);
            }
        };

        tokio::spawn(async move {
            let mut channel_stream = channel.into_stream();
            let mut stream = stream;
            if let Err(e) =
                tokio::io::copy_bidirectional(&mut channel_stream, &mut stream).await
            {
                debug!(err = %e, "forwarding bridge ended");
            }
        });

        Ok(true)
    }
}
