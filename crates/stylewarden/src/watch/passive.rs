//! Passive reconciliation: react to structural mutations of the artifact
//! container, throttled.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Reconcile, WatchShared, Watcher, Throttle};
use crate::document::{HostDocument, Mutation};
use crate::events::ReapplyReason;
use crate::types::WatchMode;

pub struct MutationWatcher {
    artifact_id: String,
    rx: broadcast::Receiver<Mutation>,
    window: Duration,
}

impl MutationWatcher {
    /// Subscribes immediately so no mutation between construction and spawn is lost.
    pub fn new(doc: &dyn HostDocument, artifact_id: impl Into<String>, window: Duration) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            rx: doc.subscribe(),
            window,
        }
    }
}

impl Watcher for MutationWatcher {
    fn mode(&self) -> WatchMode {
        WatchMode::Passive
    }

    fn spawn(self: Box<Self>, target: Weak<dyn Reconcile>, shared: Arc<WatchShared>) -> JoinHandle<()> {
        tokio::spawn(run(*self, target, shared))
    }
}

async fn run(mut watcher: MutationWatcher, target: Weak<dyn Reconcile>, shared: Arc<WatchShared>) {
    let mut throttle: Throttle<()> = Throttle::new(watcher.window);

    loop {
        let deadline = throttle.deadline();
        let due = tokio::select! {
            received = watcher.rx.recv() => {
                let removed = match received {
                    Ok(Mutation::Removed(id)) => id == watcher.artifact_id,
                    Ok(Mutation::Added(_)) => false,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Mutation watcher lagged by {skipped}, assuming removal");
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                if removed {
                    throttle.offer(Instant::now(), ())
                } else {
                    None
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                throttle.take_due(Instant::now())
            }
        };

        if due.is_none() {
            continue;
        }
        if !shared.is_active() {
            break;
        }
        let Some(target) = target.upgrade() else {
            break;
        };
        if !target.is_enabled() {
            continue;
        }
        shared.count_check();
        target.reconcile(ReapplyReason::ArtifactRemoved).await;
    }

    shared.deactivate();
}
