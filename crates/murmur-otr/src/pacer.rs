//! Timed emission of outgoing pieces.
//!
//! Some transports drop or throttle bursts, so a fragmented message can be
//! spread out over time. The pacer owns that timing; conversations stay
//! synchronous and just hand their outgoing strings over.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{OtrError, Result};

/// Handle for queueing batches on a running pacer task.
#[derive(Debug, Clone)]
pub struct OutboundPacer {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl OutboundPacer {
    /// Spawn the pacer task.
    ///
    /// Pieces are forwarded to `transport` in order, at most one per
    /// `interval`. A zero interval forwards them as soon as they arrive. The
    /// task stops when `shutdown` changes, when every handle is dropped or
    /// when `transport` closes.
    pub fn spawn(
        interval: Duration,
        transport: mpsc::Sender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();

        let handle = tokio::spawn(async move {
            let mut timer = (!interval.is_zero()).then(|| {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                timer
            });

            loop {
                tokio::select! {
                    batch = rx.recv() => {
                        let Some(batch) = batch else {
                            debug!("All pacer handles dropped");
                            return;
                        };
                        if !forward(batch, timer.as_mut(), &transport, &mut shutdown).await {
                            return;
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Outbound pacer shutting down");
                        return;
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Queue one operation's outgoing strings.
    pub fn enqueue(&self, pieces: Vec<String>) -> Result<()> {
        if pieces.is_empty() {
            return Ok(());
        }
        self.tx.send(pieces).map_err(|_| OtrError::PacerClosed)
    }
}

/// Forward one batch. Returns `false` when the task should stop.
async fn forward(
    batch: Vec<String>,
    mut timer: Option<&mut Interval>,
    transport: &mpsc::Sender<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    for piece in batch {
        if let Some(timer) = timer.as_deref_mut() {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => {
                    info!("Outbound pacer shutting down mid-batch");
                    return false;
                }
            }
        }
        if let Err(e) = transport.send(piece).await {
            warn!(error = %e, "Transport closed; stopping pacer");
            return false;
        }
    }
    true
}
