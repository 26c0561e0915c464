//! Prometheus metrics implementation

use prometheus::{
    proto::MetricFamily, Encoder, Histogram, HistogramOpts, HistogramTimer, IntCounter,
    IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Connection error classification for
/// `sshified_connection_errors_total{type}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    RequestCreation,
    UpstreamRequest,
    ResponseBodyForwarding,
    AddressParsing,
    SshConnection,
    SshKeepaliveFailure,
    SshKeepaliveTimeout,
    SshHostKeyUnknown,
}

impl ErrorType {
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorType::RequestCreation => "request_creation",
            ErrorType::UpstreamRequest => "upstream_request",
            ErrorType::ResponseBodyForwarding => "response_body_forwarding",
            ErrorType::AddressParsing => "address_parsing",
            ErrorType::SshConnection => "ssh_connection",
            ErrorType::SshKeepaliveFailure => "ssh_keepalive_failure",
            ErrorType::SshKeepaliveTimeout => "ssh_keepalive_timeout",
            ErrorType::SshHostKeyUnknown => "ssh_host_key_unknown",
        }
    }
}

/// Metrics registry for the proxy.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    requests_total: IntCounter,
    requests_failed_total: IntCounter,
    connection_errors_total: IntCounterVec,
    request_duration_seconds: Histogram,
    response_payload_bytes: IntCounter,
    sshclient_pool_total: IntGauge,
    ssh_keepalive_failures_total: IntCounter,
}

impl Metrics {
    /// Create a new registry with every sshified metric registered.
    pub fn new() -> Result<Self, anyhow::Error> {
        let registry = Registry::new();

        let requests_total =
            IntCounter::new("sshified_requests_total", "Total of all requests")?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_failed_total = IntCounter::new(
            "sshified_requests_failed_total",
            "Total of failed requests",
        )?;
        registry.register(Box::new(requests_failed_total.clone()))?;

        let connection_errors_total = IntCounterVec::new(
            Opts::new(
                "sshified_connection_errors_total",
                "Total of all error occurences by type",
            ),
            &["type"],
        )?;
        registry.register(Box::new(connection_errors_total.clone()))?;

        let request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sshified_request_duration_seconds",
                "Histogram for all proxy requests",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0]),
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let response_payload_bytes = IntCounter::new(
            "sshified_response_payload_bytes",
            "Total of all payload data transferred",
        )?;
        registry.register(Box::new(response_payload_bytes.clone()))?;

        let sshclient_pool_total = IntGauge::new(
            "sshified_sshclient_pool_total",
            "Number of cached ssh connections",
        )?;
        registry.register(Box::new(sshclient_pool_total.clone()))?;

        let ssh_keepalive_failures_total = IntCounter::new(
            "sshified_ssh_keepalive_failures_total",
            "Total of all SSH keepalive failures (aborts, reconnects)",
        )?;
        registry.register(Box::new(ssh_keepalive_failures_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            requests_total,
            requests_failed_total,
            connection_errors_total,
            request_duration_seconds,
            response_payload_bytes,
            sshclient_pool_total,
            ssh_keepalive_failures_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Encode every registered family in the Prometheus text exposition
    /// format.
    pub fn render_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Count an inbound request. Called exactly once at handler entry.
    pub fn inc_requests_total(&self) {
        self.requests_total.inc();
    }

    pub fn inc_requests_failed(&self) {
        self.requests_failed_total.inc();
    }

    pub fn inc_connection_error(&self, error_type: ErrorType) {
        self.connection_errors_total
            .with_label_values(&[error_type.as_label()])
            .inc();
    }

    /// Start a request duration timer; the observation happens when the
    /// returned timer is dropped, so it can ride along with the response
    /// body until forwarding finishes.
    pub fn request_timer(&self) -> HistogramTimer {
        self.request_duration_seconds.start_timer()
    }

    pub fn add_payload_bytes(&self, bytes: u64) {
        self.response_payload_bytes.inc_by(bytes);
    }

    pub fn inc_pool_entries(&self) {
        self.sshclient_pool_total.inc();
    }

    pub fn dec_pool_entries(&self) {
        self.sshclient_pool_total.dec();
    }

    pub fn pool_entries(&self) -> i64 {
        self.sshclient_pool_total.get()
    }

    pub fn inc_keepalive_failures(&self) {
        self.ssh_keepalive_failures_total.inc();
    }

    pub fn keepalive_failures(&self) -> u64 {
        self.ssh_keepalive_failures_total.get()
    }

    pub fn connection_errors(&self, error_type: ErrorType) -> u64 {
        self.connection_errors_total
            .with_label_values(&[error_type.as_label()])
            .get()
    }
}
