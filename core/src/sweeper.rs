//! Expiry sweeper
//!
//! Periodic background pass over the store: expires requests whose waiter
//! went away and prunes settled ones past the retention window.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::{PendingRequestStore, SweepReport};

pub struct ExpirySweeper {
    store: Arc<PendingRequestStore>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<PendingRequestStore>) -> Self {
        let interval = store.policy().sweep_interval();
        Self { store, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn sweep_once(&self) -> SweepReport {
        let report = self.store.sweep(Utc::now());
        if !report.expired.is_empty() {
            info!(expired = report.expired.len(), "sweeper expired requests");
        }
        if report.pruned > 0 {
            debug!(pruned = report.pruned, "sweeper pruned settled requests");
        }
        report
    }

    /// Run until cancelled or the store shuts down
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if self.store.is_closed() {
                            break;
                        }
                        self.sweep_once();
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }
}
