//! Response body instrumentation
//!
//! Forwarded bodies are wrapped so that byte and error accounting (and
//! the request duration timer) follow the body all the way through
//! streaming, which may outlive the handler itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::Frame;
use prometheus::HistogramTimer;
use sshified_metrics::{ErrorType, Metrics};
use tokio::time::{Instant, Sleep};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body wrapper counting forwarded bytes and observing the request
/// duration when the stream finishes. An optional deadline bounds
/// streaming so a stalled upstream cannot hold the inbound response open
/// past the request timeout.
pub(crate) struct MeteredBody<B> {
    inner: B,
    metrics: Arc<Metrics>,
    timer: Option<HistogramTimer>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<B> MeteredBody<B> {
    pub(crate) fn new(
        inner: B,
        metrics: Arc<Metrics>,
        timer: HistogramTimer,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            inner,
            metrics,
            timer: Some(timer),
            deadline: deadline.map(|at| Box::pin(tokio::time::sleep_until(at))),
        }
    }

    fn fail(&mut self, error_type: ErrorType) {
        self.metrics.inc_connection_error(error_type);
        self.metrics.inc_requests_failed();
        // Dropping the timer records the duration.
        self.timer.take();
    }
}

impl<B> http_body::Body for MeteredBody<B>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.fail(ErrorType::ResponseBodyForwarding);
                return Poll::Ready(Some(Err("response body forwarding timed out".into())));
            }
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.timer.take();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.metrics.add_payload_bytes(data.len() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::debug!("failed to forward response body");
                this.fail(ErrorType::ResponseBodyForwarding);
                Poll::Ready(Some(Err(e.into())))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    #[tokio::test]
    async fn counts_bytes_and_observes_duration() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let timer = metrics.request_timer();
        let mut body = MeteredBody::new(
            Full::new(Bytes::from_static(b"0123456789")),
            Arc::clone(&metrics),
            timer,
            None,
        );

        let mut total = 0usize;
        while let Some(frame) = body.frame().await {
            if let Some(data) = frame.unwrap().data_ref() {
                total += data.len();
            }
        }
        assert_eq!(total, 10);

        let families = metrics.gather();
        let payload = families
            .iter()
            .find(|m| m.get_name() == "sshified_response_payload_bytes")
            .unwrap();
        assert_eq!(payload.get_metric()[0].get_counter().get_value(), 10.0);
        let histogram = families
            .iter()
            .find(|m| m.get_name() == "sshified_request_duration_seconds")
            .unwrap();
        assert_eq!(
            histogram.get_metric()[0].get_histogram().get_sample_count(),
            1
        );
    }

    #[tokio::test]
    async fn expired_deadline_fails_the_stream() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let timer = metrics.request_timer();
        let mut body = MeteredBody::new(
            Full::new(Bytes::from_static(b"data")),
            Arc::clone(&metrics),
            timer,
            Some(Instant::now() - std::time::Duration::from_secs(1)),
        );

        let frame = body.frame().await.unwrap();
        assert!(frame.is_err());
        assert_eq!(
            metrics.connection_errors(ErrorType::ResponseBodyForwarding),
            1
        );
    }
}
