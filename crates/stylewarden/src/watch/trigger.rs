//! Re-assert triggers: navigation, focus, visibility, and an artifact found
//! missing outside the watchers.
//!
//! Each trigger restarts a short settle timer. When it expires the request
//! goes through a throttle and, if due, the target re-applies.

use std::sync::Weak;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Reconcile, Throttle};
use crate::events::ReapplyReason;

/// A host-environment event after which the artifact may have been lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Navigation,
    VisibilityRegained,
    Focus,
    /// A presence check found the artifact gone.
    ArtifactMissing,
}

impl Trigger {
    pub fn reason(&self) -> ReapplyReason {
        match self {
            Trigger::ArtifactMissing => ReapplyReason::ArtifactRemoved,
            Trigger::Navigation | Trigger::VisibilityRegained | Trigger::Focus => {
                ReapplyReason::ExternalTrigger
            }
        }
    }
}

/// Background task turning triggers into throttled re-applies.
#[derive(Debug)]
pub struct TriggerLoop {
    tx: mpsc::UnboundedSender<Trigger>,
    handle: JoinHandle<()>,
}

impl TriggerLoop {
    pub fn spawn(target: Weak<dyn Reconcile>, settle: Duration, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, target, settle, window));
        Self { tx, handle }
    }

    /// Queue `trigger`. Returns false once the loop has exited.
    pub fn notify(&self, trigger: Trigger) -> bool {
        self.tx.send(trigger).is_ok()
    }
}

impl Drop for TriggerLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Trigger>,
    target: Weak<dyn Reconcile>,
    settle: Duration,
    window: Duration,
) {
    let mut throttle: Throttle<Trigger> = Throttle::new(window);
    let mut settling: Option<(Instant, Trigger)> = None;

    loop {
        let settle_at = settling.map(|(at, _)| at);
        let throttle_at = throttle.deadline();

        let due = tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(trigger) => {
                        tracing::debug!("Trigger {trigger:?}");
                        settling = Some((Instant::now() + settle, trigger));
                        None
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                match settling.take() {
                    Some((_, trigger)) => throttle.offer(Instant::now(), trigger),
                    None => None,
                }
            }
            _ = tokio::time::sleep_until(throttle_at.unwrap_or_else(Instant::now)), if throttle_at.is_some() => {
                throttle.take_due(Instant::now())
            }
        };

        let Some(trigger) = due else {
            continue;
        };
        let Some(target) = target.upgrade() else {
            break;
        };
        target.reconcile(trigger.reason()).await;
    }
}
