//! The proxy request handler
//!
//! Each inbound request is rebuilt as an upstream request targeting the
//! inbound `Host` header, sent through one of the two SSH-tunneled
//! round-trippers under the request deadline, and its response forwarded
//! with optional buffering, capping and Prometheus validation.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::BytesMut;
use http::{header, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use prometheus::HistogramTimer;
use sshified_common::ProxyConfig;
use sshified_metrics::{ErrorType, Metrics};
use sshified_transport::{build_round_trippers, SshTransport, SshTunnelConnector};
use std::io::Read;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::body::MeteredBody;
use crate::validate::validate_exposition;

type TunnelClient = Client<SshTunnelConnector, Body>;

/// Shared state behind the proxy listener.
pub struct ProxyState {
    config: Arc<ProxyConfig>,
    metrics: Arc<Metrics>,
    transport_regular: TunnelClient,
    transport_skip_verify: TunnelClient,
}

impl ProxyState {
    pub fn new(
        config: Arc<ProxyConfig>,
        metrics: Arc<Metrics>,
        transport: Arc<SshTransport>,
    ) -> Self {
        let (transport_regular, transport_skip_verify) = build_round_trippers(transport);
        Self {
            config,
            metrics,
            transport_regular,
            transport_skip_verify,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

struct Failure {
    status: StatusCode,
    error_type: Option<ErrorType>,
    reason: &'static str,
}

impl Failure {
    fn request_creation() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_type: Some(ErrorType::RequestCreation),
            reason: "request creation failure",
        }
    }

    fn upstream() -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            error_type: Some(ErrorType::UpstreamRequest),
            reason: "upstream request failed",
        }
    }

    fn internal(reason: &'static str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_type: None,
            reason,
        }
    }

    fn bad_gateway(reason: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            error_type: None,
            reason,
        }
    }
}

/// Entry point wired as the router fallback: every method and path on the
/// proxy listener lands here.
pub async fn handle_proxy_request(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    state.metrics.inc_requests_total();
    let timer = state.metrics.request_timer();

    let method = req.method().clone();
    let uri = req.uri().clone();

    match proxy_one(&state, req, timer).await {
        Ok(response) => response,
        Err(failure) => {
            debug!(%method, %uri, reason = failure.reason, "request failed");
            state.metrics.inc_requests_failed();
            if let Some(error_type) = failure.error_type {
                state.metrics.inc_connection_error(error_type);
            }
            Response::builder()
                .status(failure.status)
                .body(Body::empty())
                .unwrap()
        }
    }
}

async fn proxy_one(
    state: &Arc<ProxyState>,
    req: Request,
    timer: HistogramTimer,
) -> Result<Response, Failure> {
    let deadline = Instant::now() + state.config.request_timeout;
    let (parts, inbound_body) = req.into_parts();

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(Failure::request_creation)?;

    let (upstream_uri, insecure_skip_verify) =
        shape_url(host, &parts.uri, state.config.https_enabled())
            .map_err(|_| Failure::request_creation())?;

    trace!(method = %parts.method, url = %upstream_uri, "handling request");

    let mut builder = http::Request::builder()
        .method(parts.method.clone())
        .uri(upstream_uri);
    if let Some(headers) = builder.headers_mut() {
        copy_request_headers(&parts.headers, headers);
    }
    let upstream_req = builder
        .body(inbound_body)
        .map_err(|_| Failure::request_creation())?;

    let client = if insecure_skip_verify {
        &state.transport_skip_verify
    } else {
        &state.transport_regular
    };

    trace!("beginning http request");
    let upstream_response = match timeout_at(deadline, client.request(upstream_req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            debug!(err = %e, "upstream request failed");
            return Err(Failure::upstream());
        }
        Err(_) => {
            debug!("upstream request timed out");
            return Err(Failure::upstream());
        }
    };
    trace!("finished http request");

    forward_response(state, upstream_response, deadline, timer).await
}

async fn forward_response(
    state: &Arc<ProxyState>,
    upstream: http::Response<Incoming>,
    deadline: Instant,
    timer: HistogramTimer,
) -> Result<Response, Failure> {
    let (parts, upstream_body) = upstream.into_parts();

    let mut builder = Response::builder().status(parts.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            // The forwarded length is redetermined after capping.
            if name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }

    if !state.config.buffering_enabled() {
        trace!("copying response body");
        let body = MeteredBody::new(upstream_body, Arc::clone(&state.metrics), timer, Some(deadline));
        return Ok(builder.body(Body::new(body)).expect("response build"));
    }

    let cap = state.config.response_max_bytes as usize;
    let buffered = read_capped(upstream_body, cap, deadline)
        .await
        .map_err(|_| Failure::internal("failed to copy response to buffer"))?;

    if state.config.reject_non_prometheus {
        trace!("parsing response as prometheus metrics");
        let content_encoding = parts
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let decoded = if content_encoding == "gzip" {
            trace!("decoding gzip response");
            gunzip_capped(&buffered, cap)
                .map_err(|_| Failure::internal("failed to decode gzip response"))?
        } else {
            buffered.to_vec()
        };
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if let Err(e) = validate_exposition(&decoded, content_type) {
            debug!(err = %e, "response failed prometheus validation");
            return Err(Failure::bad_gateway(
                "failed to parse as Prometheus metrics format",
            ));
        }
    }

    let body = MeteredBody::new(
        http_body_util::Full::new(buffered.freeze()),
        Arc::clone(&state.metrics),
        timer,
        None,
    );
    Ok(builder.body(Body::new(body)).expect("response build"))
}

/// Read at most `cap` bytes of the upstream body. Anything beyond the cap
/// is discarded; the buffered prefix is what gets forwarded. Intentional
/// truncation policy for the metrics-scraping use case. The buffer never
/// grows past the cap, even transiently within one frame.
async fn read_capped(
    mut body: Incoming,
    cap: usize,
    deadline: Instant,
) -> Result<BytesMut, Box<dyn std::error::Error + Send + Sync>> {
    let mut buffered = BytesMut::new();
    while buffered.len() < cap {
        match timeout_at(deadline, body.frame()).await {
            Err(_) => return Err("timed out buffering upstream response".into()),
            Ok(None) => break,
            Ok(Some(frame)) => {
                let frame = frame?;
                if let Some(data) = frame.data_ref() {
                    let remaining = cap - buffered.len();
                    buffered.extend_from_slice(&data[..data.len().min(remaining)]);
                }
            }
        }
    }
    Ok(buffered)
}

fn gunzip_capped(compressed: &[u8], cap: usize) -> std::io::Result<Vec<u8>> {
    let decoder = flate2::read::GzDecoder::new(compressed);
    let mut decoded = Vec::new();
    decoder.take(cap as u64).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Rebuild the upstream URL from the inbound request.
///
/// The forwarded request always targets the inbound `Host` header. When
/// HTTPS re-origination is enabled, the `__sshified_use_https` parameter
/// selects the scheme, `__sshified_https_insecure_skip_verify=1` selects
/// the skip-verify round-tripper, and every `__sshified_` control key is
/// stripped from the forwarded query. In cascading mode the query is
/// passed through untouched for the last hop to interpret.
fn shape_url(host: &str, uri: &Uri, https_enabled: bool) -> Result<(Uri, bool), ShapeError> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut url = url::Url::parse(&format!("http://{}{}", host, path_and_query))
        .map_err(|_| ShapeError)?;

    let mut insecure_skip_verify = false;
    if https_enabled {
        let use_https = url
            .query_pairs()
            .any(|(k, v)| k == "__sshified_use_https" && !v.is_empty());
        if use_https {
            url.set_scheme("https").map_err(|_| ShapeError)?;
            insecure_skip_verify = url
                .query_pairs()
                .any(|(k, v)| k == "__sshified_https_insecure_skip_verify" && v == "1");
        }

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !k.starts_with("__sshified_"))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.extend_pairs(kept);
        }
    }

    let uri: Uri = url.as_str().parse().map_err(|_| ShapeError)?;
    Ok((uri, insecure_skip_verify))
}

#[derive(Debug)]
struct ShapeError;

/// Copy request headers, dropping hop-by-hop and proxy-control headers.
/// `Host` is re-derived from the upstream URL.
fn copy_request_headers(src: &http::HeaderMap, dst: &mut http::HeaderMap) {
    for (name, value) in src.iter() {
        if name.as_str().starts_with("proxy-") {
            continue;
        }
        if name == header::CONNECTION || name == header::HOST {
            continue;
        }
        trace!(header = %name, "copying request header");
        dst.append(name.clone(), value.clone());
    }
}
