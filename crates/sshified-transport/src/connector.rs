//! hyper connector dialing through pooled SSH sessions
//!
//! Two pooled HTTP clients are built over the same [`SshTransport`]
//! dialer; they differ only in TLS verification (strict webpki roots vs
//! skip-verify). HTTPS is re-originated here: the TLS handshake runs
//! inside the tunneled channel against the destination's loopback
//! listener.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::error::TransportError;
use crate::session::TunnelStream;
use crate::transport::SshTransport;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A tunneled connection handed to the HTTP client, optionally
/// TLS-wrapped.
pub enum TunnelConn {
    Plain(TokioIo<TunnelStream>),
    Tls(Box<TokioIo<TlsStream<TunnelStream>>>),
}

impl Read for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TunnelConn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl Write for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TunnelConn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_flush(cx),
            TunnelConn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TunnelConn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for TunnelConn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector whose "TCP connect" is an SSH direct-tcpip channel.
#[derive(Clone)]
pub struct SshTunnelConnector {
    transport: Arc<SshTransport>,
    tls: TlsConnector,
}

impl SshTunnelConnector {
    pub fn new(transport: Arc<SshTransport>, insecure_skip_verify: bool) -> Self {
        Self {
            transport,
            tls: TlsConnector::from(build_tls_config(insecure_skip_verify)),
        }
    }
}

impl tower_service::Service<Uri> for SshTunnelConnector {
    type Response = TunnelConn;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let transport = Arc::clone(&self.transport);
        let tls = self.tls.clone();
        Box::pin(async move {
            let scheme = dst.scheme_str().unwrap_or_default().to_string();
            let host = dst
                .host()
                .ok_or_else(|| TransportError::Connect("missing host in target".to_string()))?
                .to_string();
            let bare_host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            let port = dst.port_u16().unwrap_or(match scheme.as_str() {
                "https" => 443,
                _ => 80,
            });
            let addr = if bare_host.contains(':') {
                format!("[{}]:{}", bare_host, port)
            } else {
                format!("{}:{}", bare_host, port)
            };

            match scheme.as_str() {
                "http" => {
                    let stream = transport.dial(&addr).await?;
                    Ok(TunnelConn::Plain(TokioIo::new(stream)))
                }
                "https" => {
                    let stream = transport.dial(&addr).await?;
                    trace!(host = %bare_host, "starting tls handshake inside tunnel");
                    let server_name = ServerName::try_from(bare_host)
                        .map_err(|e| TransportError::Connect(e.to_string()))?;
                    let tls_stream = tls.connect(server_name, stream).await?;
                    Ok(TunnelConn::Tls(Box::new(TokioIo::new(tls_stream))))
                }
                other => Err(TransportError::UnsupportedNetwork(other.to_string()).into()),
            }
        })
    }
}

/// Build the strict and skip-verify round-trippers over one shared
/// dialer. Idle pooling mirrors the proxy's timeout: connections idle for
/// twice the request timeout are discarded.
pub fn build_round_trippers<B>(
    transport: Arc<SshTransport>,
) -> (
    Client<SshTunnelConnector, B>,
    Client<SshTunnelConnector, B>,
)
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
{
    let idle_timeout = transport.request_timeout() * 2;
    let strict = SshTunnelConnector::new(Arc::clone(&transport), false);
    let skip_verify = SshTunnelConnector::new(transport, true);

    let mut builder = Client::builder(TokioExecutor::new());
    builder
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(idle_timeout)
        .pool_timer(TokioTimer::new());

    (builder.build(strict), builder.build(skip_verify))
}

fn build_tls_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.into(),
        };
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
