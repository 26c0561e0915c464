//! Minimal HTTP/1.1 target server for tunnel tests

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::debug;

/// A loopback HTTP server answering every request with a fixed response.
pub struct HttpTarget {
    port: u16,
    requests: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl HttpTarget {
    /// Serve `body` with the given `Content-Type` and extra headers on a
    /// random loopback port.
    pub async fn start(content_type: &str, extra_headers: &[(&str, &str)], body: Vec<u8>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>()?).await?;
        let port = listener.local_addr()?.port();

        let mut response_head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
            content_type,
            body.len()
        );
        for (name, value) in extra_headers {
            response_head.push_str(&format!("{}: {}\r\n", name, value));
        }
        response_head.push_str("Connection: close\r\n\r\n");

        let mut response = response_head.into_bytes();
        response.extend_from_slice(&body);
        let response = Arc::new(response);

        let requests = Arc::new(AtomicUsize::new(0));
        let requests_acceptor = Arc::clone(&requests);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let response = Arc::clone(&response);
                let requests = Arc::clone(&requests_acceptor);
                tokio::spawn(async move {
                    // Read until the end of the request head.
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) => return,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    requests.fetch_add(1, Ordering::SeqCst);
                    debug!("http target answering request");
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Ok(Self {
            port,
            requests,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for HttpTarget {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
