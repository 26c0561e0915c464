//! Tracked SSH sessions and tunneled channels
//!
//! A pooled session is referenced by the pool and by every outstanding
//! tunneled channel. Instead of reference-counting the session
//! externally, the session counts its open channels and latches a
//! "close when drained" flag; the last channel to close performs the
//! disconnect. A session is therefore never severed while a channel is
//! still carrying an HTTP exchange.
//!
//! Channel opens on one session are independent of each other: only the
//! counter update takes a (short) lock, never the open itself.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::{ChannelStream, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::handler::ClientHandler;

/// Result of a session liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The session answered; a channel failure was the target's problem.
    Healthy,
    /// The session errored or is already closed.
    Failed,
    /// No answer within the probe bound.
    TimedOut,
}

#[derive(Default)]
struct ChannelCount {
    inflight: u32,
    should_close: bool,
    closed: bool,
}

/// An authenticated SSH session with channel tracking.
pub struct TrackedSession {
    handle: Handle<ClientHandler>,
    state: Mutex<ChannelCount>,
    host: String,
}

impl TrackedSession {
    pub(crate) fn new(handle: Handle<ClientHandler>, host: String) -> Arc<Self> {
        Arc::new(Self {
            handle,
            state: Mutex::new(ChannelCount::default()),
            host,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Open a tunneled TCP channel to `127.0.0.1:port` on the remote
    /// side. The in-flight count is raised before the open and released
    /// again when the open fails; on success the returned stream's drop
    /// releases it exactly once.
    pub async fn open_tunnel(self: &Arc<Self>, port: u16) -> Result<TunnelStream, TransportError> {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if state.should_close {
                return Err(TransportError::SessionClosing);
            }
            state.inflight += 1;
        }

        trace!(host = %self.host, port, "connecting");
        let opened = self
            .handle
            .channel_open_direct_tcpip("127.0.0.1", u32::from(port), "127.0.0.1", 0)
            .await;
        trace!(host = %self.host, port, ok = opened.is_ok(), "done");

        match opened {
            Ok(channel) => Ok(TunnelStream {
                stream: Box::pin(channel.into_stream()),
                _guard: ChannelGuard {
                    session: Arc::clone(self),
                },
            }),
            Err(e) => {
                self.release_channel();
                Err(e.into())
            }
        }
    }

    /// Probe whether the session is still alive, bounded by `within` on
    /// its own timer: a hung session must not stall the probe.
    pub async fn probe_liveness(&self, within: Duration) -> ProbeOutcome {
        if self.handle.is_closed() {
            return ProbeOutcome::Failed;
        }
        match timeout(within, self.handle.channel_open_session()).await {
            // The channel only proves the transport still answers.
            Ok(Ok(channel)) => {
                let _ = channel.close().await;
                ProbeOutcome::Healthy
            }
            Ok(Err(e)) => {
                debug!(host = %self.host, err = %e, "liveness probe failed");
                ProbeOutcome::Failed
            }
            Err(_) => ProbeOutcome::TimedOut,
        }
    }

    /// Latch the close flag. Disconnects immediately when no channel is
    /// in flight; otherwise the last drained channel disconnects.
    pub async fn close_when_finished(&self) -> Result<(), TransportError> {
        let close_now = {
            let mut state = self.state.lock().expect("session state poisoned");
            state.should_close = true;
            if state.inflight == 0 && !state.closed {
                state.closed = true;
                true
            } else {
                false
            }
        };
        if close_now {
            self.disconnect().await?;
        } else {
            debug!(host = %self.host, "deferring session close until channels drain");
        }
        Ok(())
    }

    /// Immediate disconnect. Only valid for sessions that never produced
    /// a channel, such as the loser of a first-use race.
    pub async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.disconnect().await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        debug!(host = %self.host, "closing ssh session");
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }

    fn release_channel(self: &Arc<Self>) {
        let close_now = {
            let mut state = self.state.lock().expect("session state poisoned");
            state.inflight = state.inflight.saturating_sub(1);
            if state.should_close && state.inflight == 0 && !state.closed {
                state.closed = true;
                true
            } else {
                false
            }
        };
        if close_now {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = session.disconnect().await {
                    warn!(host = %session.host, err = %e, "deferred session close failed");
                }
            });
        }
    }
}

struct ChannelGuard {
    session: Arc<TrackedSession>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.session.release_channel();
    }
}

/// A tunneled TCP byte stream tied to its session's channel count.
///
/// Lives for the duration of one HTTP round-trip including body
/// streaming; dropping it releases the channel exactly once.
pub struct TunnelStream {
    stream: Pin<Box<ChannelStream<Msg>>>,
    _guard: ChannelGuard,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.stream.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.stream.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.stream.as_mut().poll_shutdown(cx)
    }
}
