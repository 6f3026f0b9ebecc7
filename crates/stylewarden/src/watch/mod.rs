//! Reconciliation loop: keeps the artifact applied while enabled.
//!
//! A [`Watcher`] notices that the artifact is gone and asks its [`Reconcile`]
//! target to re-apply. The target is held weakly so a watcher never keeps
//! its engine alive. [`ReconciliationLoop`] owns at most one running watcher.

pub mod passive;
pub mod polling;
pub mod throttle;
pub mod trigger;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::events::ReapplyReason;
use crate::types::{WatchMode, WatchState};

pub use passive::MutationWatcher;
pub use polling::PollingWatcher;
pub use throttle::Throttle;
pub use trigger::{Trigger, TriggerLoop};

/// The side of the engine a watcher drives.
#[async_trait]
pub trait Reconcile: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Whether the artifact is currently present and live.
    async fn check(&self) -> bool;

    /// Re-apply if enabled and not applied.
    async fn reconcile(&self, reason: ReapplyReason);
}

/// State shared between a running watcher and its ticket.
#[derive(Debug)]
pub struct WatchShared {
    active: AtomicBool,
    checks: AtomicU32,
}

impl WatchShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            checks: AtomicU32::new(0),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Count one check and return the new total.
    pub fn count_check(&self) -> u32 {
        self.checks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

/// A way of detecting that the artifact is gone.
pub trait Watcher: Send {
    fn mode(&self) -> WatchMode;

    /// Start watching on behalf of `target`. The task must stop firing as soon
    /// as `shared` is deactivated or `target` is gone.
    fn spawn(self: Box<Self>, target: Weak<dyn Reconcile>, shared: Arc<WatchShared>) -> JoinHandle<()>;
}

/// Proof that a watcher is running. Dropping it stops the watcher.
#[derive(Debug)]
pub struct ReconciliationTicket {
    mode: WatchMode,
    handle: JoinHandle<()>,
    shared: Arc<WatchShared>,
}

impl ReconciliationTicket {
    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    pub fn checks(&self) -> u32 {
        self.shared.checks()
    }

    fn is_running(&self) -> bool {
        self.shared.is_active() && !self.handle.is_finished()
    }

    fn stop(&self) {
        self.shared.deactivate();
        self.handle.abort();
    }
}

impl Drop for ReconciliationTicket {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `Idle → Watching → Idle`.
#[derive(Debug, Default)]
pub struct ReconciliationLoop {
    ticket: Mutex<Option<ReconciliationTicket>>,
}

impl ReconciliationLoop {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ReconciliationTicket>> {
        self.ticket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start watching with the watcher built by `make`. No-op while already
    /// watching. Returns whether a new watcher was started.
    pub fn start<F>(&self, make: F, target: Weak<dyn Reconcile>) -> bool
    where
        F: FnOnce() -> Box<dyn Watcher>,
    {
        let mut ticket = self.lock();
        if ticket.as_ref().is_some_and(ReconciliationTicket::is_running) {
            return false;
        }
        let watcher = make();
        let mode = watcher.mode();
        let shared = WatchShared::new();
        let handle = watcher.spawn(target, shared.clone());
        *ticket = Some(ReconciliationTicket {
            mode,
            handle,
            shared,
        });
        true
    }

    /// Stop watching. After this returns no re-apply from this loop starts.
    /// Returns whether a watcher was running.
    pub fn stop(&self) -> bool {
        match self.lock().take() {
            Some(ticket) => {
                let was_running = ticket.is_running();
                ticket.stop();
                was_running
            }
            None => false,
        }
    }

    pub fn state(&self) -> WatchState {
        match self.lock().as_ref() {
            Some(ticket) if ticket.is_running() => WatchState::Watching,
            _ => WatchState::Idle,
        }
    }

    /// Checks performed by the current (or last finished) watcher.
    pub fn checks(&self) -> u32 {
        self.lock().as_ref().map(ReconciliationTicket::checks).unwrap_or(0)
    }

    pub fn mode(&self) -> Option<WatchMode> {
        self.lock().as_ref().map(ReconciliationTicket::mode)
    }
}
