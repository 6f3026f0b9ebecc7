//! Per-descriptor mutable state and the in-flight apply claim.
//!
//! All state transitions go through [`EngineContext`]. The lock is a plain
//! `std::sync::Mutex` and is never held across an await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::types::{
    ApplicationState, FetchAttempt, Payload, ResourceDescriptor, Technique, TechniqueFailure,
};

#[derive(Debug, Default)]
struct ContextState {
    state: ApplicationState,
    /// Bumped by every remove; an apply that started under an older epoch is stale.
    epoch: u64,
    technique: Option<Technique>,
    weak: bool,
    payload: Option<Payload>,
    object_url: Option<String>,
    last_attempts: Vec<FetchAttempt>,
    last_apply_failures: Vec<TechniqueFailure>,
    last_applied_at: Option<DateTime<Utc>>,
}

/// Everything the engine knows about one descriptor.
#[derive(Debug)]
pub struct EngineContext {
    descriptor: ResourceDescriptor,
    enabled: AtomicBool,
    state: Mutex<ContextState>,
}

/// Read-only copy of the context state.
#[derive(Debug, Clone)]
pub struct ContextView {
    pub state: ApplicationState,
    pub technique: Option<Technique>,
    pub weak: bool,
    pub payload: Option<Payload>,
    pub last_attempts: Vec<FetchAttempt>,
    pub last_apply_failures: Vec<TechniqueFailure>,
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl EngineContext {
    pub fn new(descriptor: ResourceDescriptor, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            enabled: AtomicBool::new(enabled),
            state: Mutex::new(ContextState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> ApplicationState {
        self.lock().state
    }

    pub fn applied_technique(&self) -> Option<Technique> {
        self.lock().technique
    }

    pub fn view(&self) -> ContextView {
        let st = self.lock();
        ContextView {
            state: st.state,
            technique: st.technique,
            weak: st.weak,
            payload: st.payload.clone(),
            last_attempts: st.last_attempts.clone(),
            last_apply_failures: st.last_apply_failures.clone(),
            last_applied_at: st.last_applied_at,
        }
    }

    /// Enter `Applying` unless an apply is already in flight.
    pub fn try_claim(self: &Arc<Self>) -> Option<ApplyClaim> {
        let mut st = self.lock();
        if st.state == ApplicationState::Applying {
            return None;
        }
        st.state = ApplicationState::Applying;
        Some(ApplyClaim {
            ctx: Arc::clone(self),
            epoch: st.epoch,
            settled: false,
        })
    }

    pub fn record_attempts(&self, attempts: Vec<FetchAttempt>) {
        self.lock().last_attempts = attempts;
    }

    /// The artifact was deliberately removed. Any in-flight apply becomes stale
    /// and will settle to `Unapplied`. Returns the object URL to release.
    pub fn mark_removed(&self) -> Option<String> {
        let mut st = self.lock();
        st.epoch += 1;
        if st.state != ApplicationState::Applying {
            st.state = ApplicationState::Unapplied;
        }
        st.technique = None;
        st.weak = false;
        st.object_url.take()
    }

    /// Verification found the artifact gone. Returns whether state changed.
    pub fn mark_missing(&self) -> bool {
        let mut st = self.lock();
        if st.state != ApplicationState::Applied {
            return false;
        }
        st.state = ApplicationState::Unapplied;
        st.technique = None;
        st.weak = false;
        true
    }

    /// Object URL recorded by the last successful apply.
    pub fn take_object_url(&self) -> Option<String> {
        self.lock().object_url.take()
    }
}

/// Exclusive right to apply. Dropping an unsettled claim restores `Unapplied`.
#[derive(Debug)]
pub struct ApplyClaim {
    ctx: Arc<EngineContext>,
    epoch: u64,
    settled: bool,
}

impl ApplyClaim {
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Whether no remove happened since the claim was taken.
    pub fn is_current(&self) -> bool {
        self.ctx.lock().epoch == self.epoch
    }

    /// Settle as `Applied`. Returns false if the claim went stale, in which
    /// case the state is `Unapplied` and the caller must clean up its node.
    pub fn applied(
        mut self,
        technique: Technique,
        payload: Payload,
        weak: bool,
        object_url: Option<String>,
    ) -> bool {
        self.settled = true;
        let mut st = self.ctx.lock();
        if st.epoch != self.epoch {
            st.state = ApplicationState::Unapplied;
            return false;
        }
        st.state = ApplicationState::Applied;
        st.technique = Some(technique);
        st.weak = weak;
        st.payload = Some(payload);
        st.object_url = object_url;
        st.last_apply_failures.clear();
        st.last_applied_at = Some(Utc::now());
        true
    }

    /// Settle as `Failed` (or `Unapplied` if the claim went stale).
    pub fn failed(mut self, failures: Vec<TechniqueFailure>) {
        self.settled = true;
        let mut st = self.ctx.lock();
        st.state = if st.epoch == self.epoch {
            ApplicationState::Failed
        } else {
            ApplicationState::Unapplied
        };
        st.last_apply_failures = failures;
    }
}

impl Drop for ApplyClaim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = self.ctx.lock();
        if st.state == ApplicationState::Applying {
            st.state = ApplicationState::Unapplied;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn ctx() -> Arc<EngineContext> {
        EngineContext::new(ResourceDescriptor::new("site", vec![], "#site"), true)
    }

    fn payload() -> Payload {
        Payload::new("a{}", Url::parse("https://a.test/s.css").unwrap())
    }

    #[test]
    fn test_claim_is_exclusive() {
        let ctx = ctx();
        let claim = ctx.try_claim().unwrap();
        assert_eq!(ctx.state(), ApplicationState::Applying);
        assert!(ctx.try_claim().is_none());

        assert!(claim.applied(Technique::InlineStyle, payload(), false, None));
        assert_eq!(ctx.state(), ApplicationState::Applied);
        assert_eq!(ctx.applied_technique(), Some(Technique::InlineStyle));
    }

    #[test]
    fn test_dropped_claim_restores_unapplied() {
        let ctx = ctx();
        let claim = ctx.try_claim().unwrap();
        drop(claim);
        assert_eq!(ctx.state(), ApplicationState::Unapplied);
        assert!(ctx.try_claim().is_some());
    }

    #[test]
    fn test_remove_during_apply_makes_claim_stale() {
        let ctx = ctx();
        let claim = ctx.try_claim().unwrap();

        assert!(ctx.mark_removed().is_none());
        assert_eq!(ctx.state(), ApplicationState::Applying);
        assert!(!claim.is_current());

        assert!(!claim.applied(Technique::InlineStyle, payload(), false, None));
        assert_eq!(ctx.state(), ApplicationState::Unapplied);
        assert!(ctx.applied_technique().is_none());
    }

    #[test]
    fn test_failed_and_stale_failure() {
        let ctx = ctx();
        ctx.try_claim().unwrap().failed(vec![]);
        assert_eq!(ctx.state(), ApplicationState::Failed);

        let claim = ctx.try_claim().unwrap();
        ctx.mark_removed();
        claim.failed(vec![]);
        assert_eq!(ctx.state(), ApplicationState::Unapplied);
    }

    #[test]
    fn test_mark_missing_only_from_applied() {
        let ctx = ctx();
        assert!(!ctx.mark_missing());

        let url = Some("blob:memory/1".to_string());
        ctx.try_claim()
            .unwrap()
            .applied(Technique::ObjectUrlLink, payload(), false, url);
        assert!(ctx.mark_missing());
        assert_eq!(ctx.state(), ApplicationState::Unapplied);
        assert_eq!(ctx.take_object_url().as_deref(), Some("blob:memory/1"));
    }
}
