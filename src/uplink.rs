//! Uplink worker: adaptive read and send loop
//!
//! Reads the local input stream into a bounded buffer and hands each chunk
//! to the transport codec. Small interactive writes should leave with as
//! little added latency as possible, bulk writes should fill the buffer, so
//! the read loop races the stream against a flush alarm: the first few
//! reads (fast start) skip the alarm entirely and are flushed as they
//! arrive, after that a read returns when the buffer fills or the alarm
//! expires with at least one byte accumulated.
//!
//! Delivery failures are retried forever with a linearly growing backoff
//! that also raises the resolver's retransmit timeout. The backoff never
//! resets on success; only the cap bounds it.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};

use crate::codec::TransportCodec;
use crate::config::SessionConfig;

/// Reads at or below this size count as interactive keystrokes for the
/// fast-start accounting.
pub const KEYSTROKE_LEN: usize = 32;

/// Mutable per-worker state; nothing here is shared.
#[derive(Debug)]
pub struct UplinkState {
    /// Delivery backoff multiplier, `1..=maxbackoff`
    pub backoff: u32,
    /// Remaining fast-start reads
    pub faststart: u32,
    /// Cumulative payload bytes delivered
    pub bytes_sent: u64,
    /// Set once the input stream is done
    pub eof: bool,
}

/// The uplink half of a tunnel session.
pub struct UplinkWorker<R> {
    reader: R,
    config: SessionConfig,
    codec: Arc<dyn TransportCodec>,
    escalate: mpsc::Sender<()>,
    shutdown: watch::Receiver<bool>,
    state: UplinkState,
}

impl<R: AsyncRead + Unpin + Send> UplinkWorker<R> {
    pub fn new(
        reader: R,
        config: SessionConfig,
        codec: Arc<dyn TransportCodec>,
        escalate: mpsc::Sender<()>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let state = UplinkState {
            backoff: 1,
            faststart: config.faststart,
            bytes_sent: 0,
            eof: false,
        };
        Self {
            reader,
            config,
            codec,
            escalate,
            shutdown,
            state,
        }
    }

    /// Run until the input stream ends or shutdown is requested.
    /// Returns the cumulative number of payload bytes delivered.
    pub async fn run(mut self) -> u64 {
        let mut buf = vec![0u8; self.config.bufsz];

        loop {
            let n = self.read_chunk(&mut buf).await;
            if n == 0 {
                break;
            }

            debug!("sending chunk: {} of {} bytes", n, self.config.bufsz);
            self.send_chunk(&buf[..n]).await;

            if self.state.eof || *self.shutdown.borrow() {
                break;
            }
            sleep(Duration::from_micros(self.config.sleep_us)).await;
        }

        info!("uplink exiting after {} bytes", self.state.bytes_sent);
        self.state.bytes_sent
    }

    /// Accumulate one chunk from the input stream.
    ///
    /// Returns 0 only on end-of-stream or shutdown with nothing buffered.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        if *self.shutdown.borrow() {
            return 0;
        }

        let mut filled = 0;

        if self.state.faststart > 0 || self.config.delay_us == 0 {
            // Interactive bypass: ship the first read as-is.
            tokio::select! {
                res = self.reader.read(buf) => match res {
                    Ok(0) => self.state.eof = true,
                    Ok(n) => filled = n,
                    Err(e) => {
                        error!("uplink read: {}", e);
                        self.state.eof = true;
                    }
                },
                _ = self.shutdown.changed() => {}
            }
        } else {
            let delay = Duration::from_micros(self.config.delay_us);
            let mut flush_at = Instant::now() + delay;

            while filled < buf.len() {
                tokio::select! {
                    res = self.reader.read(&mut buf[filled..]) => match res {
                        Ok(0) => {
                            self.state.eof = true;
                            break;
                        }
                        Ok(n) => filled += n,
                        Err(e) => {
                            error!("uplink read: {}", e);
                            self.state.eof = true;
                            break;
                        }
                    },
                    _ = sleep_until(flush_at) => {
                        if filled > 0 {
                            debug!("alarm flush: {}/{} bytes", filled, buf.len());
                            break;
                        }
                        // Nothing buffered yet: re-arm and keep waiting.
                        flush_at = Instant::now() + delay;
                    }
                    _ = self.shutdown.changed() => break,
                }
            }
        }

        if self.state.faststart > 0 && filled <= KEYSTROKE_LEN {
            self.state.faststart -= 1;
        }

        filled
    }

    /// Deliver one chunk, retrying the same bytes until the codec accepts
    /// them. Each failure widens the backoff and the resolver timeout.
    async fn send_chunk(&mut self, chunk: &[u8]) {
        while let Err(e) = self.codec.encode_and_send(chunk).await {
            self.state.backoff = (self.state.backoff + 1).min(self.config.maxbackoff);
            self.codec.set_retransmit_timeout(self.state.backoff);
            warn!(
                "re-sending {} bytes: resolver timeout = {}s ({})",
                chunk.len(),
                self.state.backoff,
                e
            );
        }

        // Tell the downlink worker data may now be pending. Best effort: a
        // full channel already carries an undelivered wakeup.
        let _ = self.escalate.try_send(());
        self.state.bytes_sent += chunk.len() as u64;
    }
}
