//! Session topology
//!
//! Splits a configured session into its two workers, wires the coordination
//! channels between them, and supervises shutdown: whichever side exits
//! first, the counterpart is told to stop and awaited, so no worker ever
//! outlives the session.
//!
//! Coordination is deliberately minimal:
//!
//! - escalate-rate: bounded one-slot channel, sent best-effort. Lossy and
//!   coalescing; the downlink loop tolerates missed signals.
//! - shutdown-request: a watch flag observed at the workers' await points.
//! - counterpart-exited: completion of a worker task, observed here.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::codec::TransportCodec;
use crate::config::SessionConfig;
use crate::downlink::{DownlinkOutcome, DownlinkWorker};
use crate::uplink::UplinkWorker;
use crate::TunnelError;

/// How long the surviving worker gets to notice the shutdown flag before
/// its task is aborted. The uplink worker can be stuck in its unbounded
/// delivery retry; the abort is the backstop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run a tunnel session over the given local stream halves.
///
/// Returns once both workers have stopped. A downlink poll-limit exit is a
/// policy decision, not an error; only fatal I/O surfaces as `Err`.
pub async fn run<R, W>(
    config: SessionConfig,
    codec: Arc<dyn TransportCodec>,
    reader: R,
    writer: W,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(
        "session id = {}, forward session = {}",
        config.session_id, config.forward_session
    );

    let (escalate_tx, escalate_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let uplink = UplinkWorker::new(
        reader,
        config.clone(),
        codec.clone(),
        escalate_tx,
        shutdown_rx.clone(),
    );
    let downlink = DownlinkWorker::new(writer, config, codec, escalate_rx, shutdown_rx);

    let mut uplink_task = tokio::spawn(uplink.run());
    let mut downlink_task = tokio::spawn(downlink.run());

    let result = tokio::select! {
        up = &mut uplink_task => {
            debug!("uplink finished first");
            let _ = shutdown_tx.send(true);
            match up {
                Ok(sent) => debug!("uplink delivered {} bytes", sent),
                Err(e) => warn!("uplink task failed: {}", e),
            }
            await_counterpart(&mut downlink_task).await.map(|_| ())
        }
        down = &mut downlink_task => {
            debug!("downlink finished first");
            let _ = shutdown_tx.send(true);
            let outcome = flatten_downlink(down);
            // Give the uplink worker its grace period either way
            if let Err(e) = tokio::time::timeout(SHUTDOWN_GRACE, &mut uplink_task).await {
                warn!("uplink did not stop in time, aborting: {}", e);
                uplink_task.abort();
            }
            outcome.map(|_| ())
        }
    };

    info!("session finished");
    result
}

/// Await the downlink worker after the uplink side has stopped.
async fn await_counterpart(
    task: &mut tokio::task::JoinHandle<Result<DownlinkOutcome, TunnelError>>,
) -> Result<DownlinkOutcome, TunnelError> {
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut *task).await {
        Ok(joined) => flatten_downlink(joined),
        Err(_) => {
            warn!("downlink did not stop in time, aborting");
            task.abort();
            Ok(DownlinkOutcome::Shutdown)
        }
    }
}

/// Collapse a joined downlink result, treating the poll-limit exit as a
/// clean stop.
fn flatten_downlink(
    joined: Result<Result<DownlinkOutcome, TunnelError>, tokio::task::JoinError>,
) -> Result<DownlinkOutcome, TunnelError> {
    match joined {
        Ok(Ok(DownlinkOutcome::PollLimit)) => {
            warn!("polling gave up: channel appears unusable");
            Ok(DownlinkOutcome::PollLimit)
        }
        Ok(other) => other,
        Err(e) if e.is_cancelled() => Ok(DownlinkOutcome::Shutdown),
        Err(e) => Err(TunnelError::Io(std::io::Error::other(e))),
    }
}
