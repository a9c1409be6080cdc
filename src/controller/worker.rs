//! Periodic reconciliation loop.
//!
//! Runs one reconcile immediately, then one per poll interval. Ticks never
//! overlap: a slow tick delays the next one.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::reconciler::Controller;

/// Drives the controller on a fixed interval until shutdown is signaled.
pub struct ReconcileWorker {
    controller: Controller,
    interval: Duration,
}

impl ReconcileWorker {
    pub fn new(controller: Controller, interval: Duration) -> Self {
        Self { controller, interval }
    }

    /// Runs the loop until the shutdown channel flips to true. The first
    /// interval tick completes immediately, so startup reconciles at once.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Controller started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.controller.reconcile().await {
                        error!(error = %err, "Reconcile tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }
            }
        }
    }
}
