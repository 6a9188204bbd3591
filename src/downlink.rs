//! Downlink worker: poll and backoff loop
//!
//! Repeatedly asks the far end for pending payload and writes whatever
//! arrives to the local output stream. An empty poll is the expected common
//! case, so the backoff ramps fast (×3 per miss) to keep query volume down,
//! and collapses back to 1 the moment data arrives or the uplink worker
//! signals that downstream data is now likely pending.
//!
//! The worker gives up cleanly after a configured run of consecutive
//! failures; an unusable channel is a policy exit, not a crash.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::codec::TransportCodec;
use crate::config::SessionConfig;
use crate::TunnelError;

/// Why the downlink loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkOutcome {
    /// Shutdown was requested by the counterpart or the supervisor
    Shutdown,
    /// Too many consecutive poll failures; the channel is unusable
    PollLimit,
}

/// Mutable per-worker state; nothing here is shared.
#[derive(Debug)]
pub struct DownlinkState {
    /// Poll backoff multiplier, `1..=maxbackoff`
    pub backoff: u32,
    /// Consecutive failed or empty polls
    pub pollfail: u32,
    /// Cumulative payload bytes written locally
    pub bytes_received: u64,
}

/// The downlink half of a tunnel session.
pub struct DownlinkWorker<W> {
    writer: W,
    config: SessionConfig,
    codec: Arc<dyn TransportCodec>,
    escalate: mpsc::Receiver<()>,
    shutdown: watch::Receiver<bool>,
    state: DownlinkState,
}

impl<W: AsyncWrite + Unpin + Send> DownlinkWorker<W> {
    pub fn new(
        writer: W,
        config: SessionConfig,
        codec: Arc<dyn TransportCodec>,
        escalate: mpsc::Receiver<()>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            writer,
            config,
            codec,
            escalate,
            shutdown,
            state: DownlinkState {
                backoff: 1,
                pollfail: 0,
                bytes_received: 0,
            },
        }
    }

    /// Run until shutdown, the poll-failure limit, or a fatal write error.
    pub async fn run(mut self) -> Result<DownlinkOutcome, TunnelError> {
        let mut n: u64 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.drain_escalate();

            // The limit check runs every iteration, polled or not, and
            // fires before another query goes out.
            if self.config.maxpollfail > 0 && self.state.pollfail >= self.config.maxpollfail {
                info!(
                    "exiting from polling: {} consecutive failures",
                    self.state.pollfail
                );
                return Ok(DownlinkOutcome::PollLimit);
            }

            // Backoff skips iterations rather than stretching the sleep
            if n % self.state.backoff as u64 == 0 {
                self.poll_once().await?;
            }

            tokio::select! {
                _ = sleep(Duration::from_micros(self.config.sleep_us)) => {}
                _ = self.shutdown.changed() => break,
            }
            n += 1;
        }

        info!("downlink exiting after {} bytes", self.state.bytes_received);
        Ok(DownlinkOutcome::Shutdown)
    }

    /// Collapse the backoff if the uplink worker signalled activity. The
    /// signal is lossy and coalescing; natural backoff decay covers a
    /// missed one.
    fn drain_escalate(&mut self) {
        if self.escalate.try_recv().is_ok() {
            debug!("rate escalation: polling at full rate");
            self.state.backoff = 1;
        }
    }

    /// One poll of the far end, with the full payload written out before
    /// the loop moves on.
    async fn poll_once(&mut self) -> Result<(), TunnelError> {
        let pending = match self.codec.poll_for_payload().await {
            Ok(payload) if !payload.is_empty() => Some(payload),
            Ok(_) => None,
            Err(e) => {
                debug!("poll failed: {}", e);
                None
            }
        };

        match pending {
            Some(payload) => {
                debug!(
                    "ramping polling ({} bytes, record type = {})",
                    payload.len(),
                    self.config.record_type.as_str()
                );
                self.state.pollfail = 0;
                self.state.backoff = 1;

                self.writer.write_all(&payload).await.map_err(|e| {
                    error!("downlink write: {}", e);
                    TunnelError::from(e)
                })?;
                self.writer.flush().await?;
                self.state.bytes_received += payload.len() as u64;
            }
            None => {
                self.state.backoff = self
                    .state
                    .backoff
                    .saturating_mul(3)
                    .min(self.config.maxbackoff);
                self.state.pollfail += 1;
            }
        }

        Ok(())
    }
}
