//! sshified - HTTP forward proxy over SSH
//!
//! Ties the pieces together: flag parsing, logging, the SSH transport
//! with its client pool, the proxy listener, the optional metrics
//! listener and signal handling (SIGHUP credential reload, graceful
//! shutdown on SIGINT/SIGTERM).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sshified_common::logging::{init_logging, LogConfig};
use sshified_common::{ProxyConfig, SshSettings};
use sshified_metrics::{start_metrics_server, Metrics};
use sshified_proxy::{start_proxy_server, ProxyState};
use sshified_transport::SshTransport;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// HTTP forward proxy whose upstream leg runs through SSH tunnels.
#[derive(Parser, Debug)]
#[command(
    name = "sshified",
    version = sshified_common::VERSION,
    about = "Proxies HTTP requests through SSH tunnels to their destination hosts",
    long_about = None
)]
struct Args {
    /// Address the proxy will listen on
    #[arg(long = "proxy.listen-addr")]
    proxy_listen_addr: SocketAddr,

    /// Optional address of another http proxy when cascading usage is
    /// required
    #[arg(long = "next-proxy.addr")]
    next_proxy_addr: Option<String>,

    /// Address the service will listen on for metrics requests about
    /// itself
    #[arg(long = "metrics.listen-addr")]
    metrics_listen_addr: Option<SocketAddr>,

    /// Username used for connecting via ssh
    #[arg(long = "ssh.user")]
    ssh_user: String,

    /// Private key file used for connecting via ssh
    #[arg(long = "ssh.key-file")]
    ssh_key_file: PathBuf,

    /// Known hosts file used for connecting via ssh
    #[arg(long = "ssh.known-hosts-file")]
    ssh_known_hosts_file: PathBuf,

    /// Port used for connecting via ssh
    #[arg(long = "ssh.port", default_value_t = 22)]
    ssh_port: u16,

    /// Full roundtrip request timeout in seconds
    #[arg(long, default_value_t = 50)]
    timeout: u64,

    /// Maximum upstream response bytes to buffer and forward; 0 disables
    /// buffering
    #[arg(long = "response.max-bytes", default_value_t = 0)]
    response_max_bytes: i64,

    /// Reject upstream responses that do not parse as Prometheus metrics
    #[arg(long = "response.reject-non-prometheus")]
    response_reject_non_prometheus: bool,

    /// Log directory (defaults to stdout)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Trace mode
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.trace {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    init_logging(LogConfig {
        log_dir: args.log_dir.clone(),
        level: level.to_string(),
    })?;

    let config = Arc::new(ProxyConfig {
        proxy_listen_addr: args.proxy_listen_addr,
        next_proxy_addr: args.next_proxy_addr.clone(),
        metrics_listen_addr: args.metrics_listen_addr,
        ssh: SshSettings {
            user: args.ssh_user.clone(),
            key_file: args.ssh_key_file.clone(),
            known_hosts_file: args.ssh_known_hosts_file.clone(),
            port: args.ssh_port,
        },
        request_timeout: Duration::from_secs(args.timeout),
        response_max_bytes: args.response_max_bytes,
        reject_non_prometheus: args.response_reject_non_prometheus,
    });

    if let Some(next) = &config.next_proxy_addr {
        info!(
            next_proxy_addr = %next,
            "Running in cascading mode: will ssh to nextProxyAddr and use the http proxy there"
        );
    }

    let metrics = Arc::new(Metrics::new().context("failed to create metrics registry")?);
    let transport = Arc::new(
        SshTransport::new(&config, Arc::clone(&metrics)).context("failed to set up ssh config")?,
    );

    let cancel_token = CancellationToken::new();
    spawn_reload_handler(Arc::clone(&transport))?;
    spawn_shutdown_handler(cancel_token.clone())?;

    if let Some(metrics_addr) = config.metrics_listen_addr {
        info!(addr = %metrics_addr, "Serving metrics");
        let metrics = Arc::clone(&metrics);
        let cancel = cancel_token.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, metrics_addr, cancel).await {
                error!(err = %e, "metrics server failed");
            }
        });
    }

    let state = Arc::new(ProxyState::new(
        Arc::clone(&config),
        Arc::clone(&metrics),
        transport,
    ));
    start_proxy_server(state, config.proxy_listen_addr, cancel_token).await
}

/// SIGHUP re-reads the key and known-hosts files. A failed reload keeps
/// the previous credentials in force; pooled sessions are never touched.
fn spawn_reload_handler(transport: Arc<SshTransport>) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("got SIGHUP, reloading known hosts and key file");
            match transport.reload() {
                Ok(()) => info!("successfully reloaded"),
                Err(e) => error!(err = %e, "reload failed"),
            }
        }
    });
    Ok(())
}

fn spawn_shutdown_handler(cancel_token: CancellationToken) -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("shutting down");
        cancel_token.cancel();
    });
    Ok(())
}
