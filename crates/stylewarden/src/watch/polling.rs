//! Aggressive reconciliation: poll for the artifact on a fixed interval,
//! up to a bounded number of checks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{Reconcile, WatchShared, Watcher};
use crate::events::{EngineEvent, EventBus, ReapplyReason};
use crate::types::WatchMode;

pub struct PollingWatcher {
    descriptor_id: String,
    interval: Duration,
    max_checks: u32,
    events: EventBus,
}

impl PollingWatcher {
    pub fn new(
        descriptor_id: impl Into<String>,
        interval: Duration,
        max_checks: u32,
        events: EventBus,
    ) -> Self {
        Self {
            descriptor_id: descriptor_id.into(),
            interval,
            max_checks,
            events,
        }
    }
}

impl Watcher for PollingWatcher {
    fn mode(&self) -> WatchMode {
        WatchMode::Aggressive
    }

    fn spawn(self: Box<Self>, target: Weak<dyn Reconcile>, shared: Arc<WatchShared>) -> JoinHandle<()> {
        tokio::spawn(run(*self, target, shared))
    }
}

async fn run(watcher: PollingWatcher, target: Weak<dyn Reconcile>, shared: Arc<WatchShared>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + watcher.interval, watcher.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !shared.is_active() {
            break;
        }
        let Some(target) = target.upgrade() else {
            break;
        };

        let checks = shared.count_check();
        if target.is_enabled() && !target.check().await {
            target.reconcile(ReapplyReason::PollMissing).await;
        }

        if checks >= watcher.max_checks {
            tracing::info!(
                "Stopped polling {} after {checks} checks",
                watcher.descriptor_id
            );
            watcher.events.emit(EngineEvent::ReconciliationBoundExceeded {
                descriptor_id: watcher.descriptor_id.clone(),
                checks,
            });
            break;
        }
    }

    shared.deactivate();
}
