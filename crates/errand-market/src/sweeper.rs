//! Periodic expiry sweep.
//!
//! Expiry is applied lazily by readers and by matching tasks; the sweeper
//! makes sure stale offers and overdue errands are expired (and escrows
//! refunded) even when nobody is looking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::market::Marketplace;

/// Handle for controlling the sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    running: Arc<AtomicBool>,
    sweeps: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Check if the sweep task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of sweeps completed.
    #[must_use]
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Stops the task and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "sweeper task ended abnormally");
        }
    }
}

/// Starts a task that calls [`Marketplace::sweep`] every `interval`.
pub fn start_sweeper(market: Arc<Marketplace>, interval: Duration) -> SweeperHandle {
    let running = Arc::new(AtomicBool::new(true));
    let sweeps = Arc::new(AtomicU64::new(0));
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = {
        let running = Arc::clone(&running);
        let sweeps = Arc::clone(&sweeps);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis(), "sweeper started");

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let outcome = market.sweep();
                        sweeps.fetch_add(1, Ordering::SeqCst);
                        if outcome.failures().next().is_some() {
                            debug!(failures = outcome.failures().count(), "sweep side effects failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
            info!("sweeper stopped");
        })
    };

    SweeperHandle {
        running,
        sweeps,
        shutdown,
        task,
    }
}
