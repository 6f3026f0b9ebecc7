//! Engine controller: composes cache, fetch, apply and reconciliation for
//! one descriptor.
//!
//! Every public entry point returns a `bool` or a snapshot. Failures are
//! retried with backoff, logged, and reported on the event bus.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use tokio::time::Instant;

use crate::apply::{ApplyEngine, ApplyOutcome, Presence};
use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::document::{wait_for_selector, HostDocument};
use crate::events::{EngineEvent, EventBus, ReapplyReason};
use crate::fetch::FetchPipeline;
use crate::settings::Settings;
use crate::store::{KeyValueStore, MemoryStore};
use crate::types::{
    ApplicationState, EngineError, EngineResult, EngineSnapshot, ResourceDescriptor, WatchMode,
    WatchState,
};
use crate::watch::{
    MutationWatcher, PollingWatcher, ReconciliationLoop, Reconcile, Trigger, TriggerLoop, Watcher,
};

/// Builder for [`EngineController`].
pub struct EngineBuilder {
    descriptor: ResourceDescriptor,
    document: Arc<dyn HostDocument>,
    config: EngineConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    pipeline: Option<FetchPipeline>,
    apply: Option<ApplyEngine>,
    events: Option<EventBus>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn pipeline(mut self, pipeline: FetchPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn apply_engine(mut self, apply: ApplyEngine) -> Self {
        self.apply = Some(apply);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> EngineController {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let settings = Settings::new(store.clone());
        let enabled = settings.is_enabled(&self.descriptor);
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| FetchPipeline::standard(&self.config, None));
        let apply = self
            .apply
            .unwrap_or_else(|| ApplyEngine::standard(self.document.clone(), &self.config));

        EngineController {
            inner: Arc::new(EngineInner {
                ctx: EngineContext::new(self.descriptor, enabled),
                cache: CacheStore::new(store),
                settings,
                pipeline,
                apply,
                document: self.document,
                events: self.events.unwrap_or_default(),
                watch: ReconciliationLoop::new(),
                triggers: Mutex::new(None),
                last_apply: Mutex::new(None),
                config: self.config,
            }),
        }
    }
}

/// Keeps one resource applied to one document.
#[derive(Clone)]
pub struct EngineController {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    config: EngineConfig,
    cache: CacheStore,
    settings: Settings,
    pipeline: FetchPipeline,
    apply: ApplyEngine,
    document: Arc<dyn HostDocument>,
    events: EventBus,
    watch: ReconciliationLoop,
    triggers: Mutex<Option<TriggerLoop>>,
    last_apply: Mutex<Option<Instant>>,
}

impl EngineController {
    pub fn builder(descriptor: ResourceDescriptor, document: Arc<dyn HostDocument>) -> EngineBuilder {
        EngineBuilder {
            descriptor,
            document,
            config: EngineConfig::default(),
            store: None,
            pipeline: None,
            apply: None,
            events: None,
        }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        self.inner.ctx.descriptor()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.ctx.is_enabled()
    }

    pub fn state(&self) -> ApplicationState {
        self.inner.ctx.state()
    }

    pub fn watch_state(&self) -> WatchState {
        self.inner.watch.state()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Bring the document in line with the persisted enabled flag.
    pub async fn initialize(&self) -> bool {
        if !self.inner.ctx.is_enabled() {
            tracing::info!("{} is disabled", self.descriptor().id);
            return false;
        }
        let applied = self.inner.apply_with_retry().await;
        self.start_watching();
        applied
    }

    /// Persist and act on the desired state. Enabling applies and starts
    /// reconciliation (even if the apply failed); disabling stops
    /// reconciliation and removes the artifact.
    pub async fn set_enabled(&self, enabled: bool) -> bool {
        let inner = &self.inner;
        let descriptor = inner.ctx.descriptor();
        inner.ctx.set_enabled(enabled);
        if let Err(e) = inner.settings.set_enabled(descriptor, enabled) {
            tracing::warn!("Failed to persist enabled={enabled} for {}: {e}", descriptor.id);
        }
        inner.events.emit(EngineEvent::EnabledChanged {
            descriptor_id: descriptor.id.clone(),
            enabled,
        });
        tracing::info!("{} {}", descriptor.id, if enabled { "enabled" } else { "disabled" });

        if enabled {
            let applied = inner.apply_with_retry().await;
            self.start_watching();
            applied
        } else {
            self.stop_watching();
            inner.apply.remove(&inner.ctx).await;
            inner.events.emit(EngineEvent::Removed {
                descriptor_id: descriptor.id.clone(),
            });
            true
        }
    }

    /// Bounded retry around the enable path.
    pub async fn apply_with_retry(&self) -> bool {
        self.inner.apply_with_retry().await
    }

    /// Re-apply only if enabled and not currently applied.
    pub async fn force_reapply(&self) -> bool {
        self.inner.force_reapply(ReapplyReason::ExternalTrigger).await
    }

    /// Check the document. Finding the artifact gone while enabled schedules
    /// a throttled re-apply.
    pub async fn is_applied(&self) -> bool {
        let inner = &self.inner;
        match inner.apply.presence(&inner.ctx).await {
            Presence::Present => true,
            Presence::Lost => {
                if inner.ctx.is_enabled() {
                    self.notify(Trigger::ArtifactMissing);
                }
                false
            }
            Presence::Absent => false,
        }
    }

    /// Report a host-environment event after which the artifact may be gone.
    pub fn notify(&self, trigger: Trigger) {
        let inner = &self.inner;
        let mut triggers = inner.triggers.lock().unwrap_or_else(|p| p.into_inner());
        let trigger_loop = triggers.get_or_insert_with(|| {
            TriggerLoop::spawn(
                self.reconcile_target(),
                inner.config.trigger_settle(),
                inner.config.reapply_throttle(),
            )
        });
        if !trigger_loop.notify(trigger) {
            tracing::debug!("Trigger loop for {} has exited", inner.ctx.descriptor().id);
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let inner = &self.inner;
        let view = inner.ctx.view();
        EngineSnapshot {
            descriptor_id: inner.ctx.descriptor().id.clone(),
            enabled: inner.ctx.is_enabled(),
            state: view.state,
            watch_state: inner.watch.state(),
            watch_mode: inner.watch_mode(),
            reconciliation_checks: inner.watch.checks(),
            applied_technique: view.technique,
            payload_bytes: view.payload.as_ref().map(|p| p.content.len()),
            payload_source: view.payload.map(|p| p.source_url),
            last_applied_at: view.last_applied_at,
            last_attempts: view.last_attempts,
            last_apply_failures: view.last_apply_failures,
        }
    }

    /// Stop all background work. The artifact is left in place.
    pub fn shutdown(&self) {
        self.stop_watching();
        let mut triggers = self.inner.triggers.lock().unwrap_or_else(|p| p.into_inner());
        triggers.take();
    }

    fn reconcile_target(&self) -> Weak<dyn Reconcile> {
        let target: Arc<dyn Reconcile> = self.inner.clone();
        Arc::downgrade(&target)
    }

    fn start_watching(&self) {
        let inner = &self.inner;
        if inner.watch.start(|| inner.make_watcher(), self.reconcile_target()) {
            tracing::debug!("Watching {} ({:?})", inner.ctx.descriptor().id, inner.watch_mode());
            inner.events.emit(EngineEvent::WatchStarted {
                descriptor_id: inner.ctx.descriptor().id.clone(),
                mode: inner.watch_mode(),
            });
        }
    }

    fn stop_watching(&self) {
        let inner = &self.inner;
        if inner.watch.stop() {
            inner.events.emit(EngineEvent::WatchStopped {
                descriptor_id: inner.ctx.descriptor().id.clone(),
            });
        }
    }
}

impl EngineInner {
    fn watch_mode(&self) -> WatchMode {
        if self.ctx.descriptor().aggressive_reconciliation {
            WatchMode::Aggressive
        } else {
            WatchMode::Passive
        }
    }

    fn make_watcher(&self) -> Box<dyn Watcher> {
        let descriptor = self.ctx.descriptor();
        match self.watch_mode() {
            WatchMode::Aggressive => Box::new(PollingWatcher::new(
                descriptor.id.clone(),
                self.config.poll_interval(),
                self.config.max_checks,
                self.events.clone(),
            )),
            WatchMode::Passive => Box::new(MutationWatcher::new(
                self.document.as_ref(),
                descriptor.artifact_id(),
                self.config.reapply_throttle(),
            )),
        }
    }

    async fn apply_with_retry(&self) -> bool {
        let descriptor = self.ctx.descriptor();
        let ceiling = self.config.retry_ceiling.max(1);
        let mut last_error = String::new();

        for attempt in 1..=ceiling {
            if !self.ctx.is_enabled() {
                return false;
            }
            match self.apply_once().await {
                Ok(applied) => return applied,
                Err(EngineError::InFlight(_)) | Err(EngineError::Disabled(_)) => return false,
                Err(e) => {
                    tracing::debug!("Apply attempt {attempt}/{ceiling} for {} failed: {e}", descriptor.id);
                    last_error = e.to_string();
                }
            }
            if attempt < ceiling {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }

        tracing::warn!(
            "Giving up on {} after {ceiling} attempts: {last_error}",
            descriptor.id
        );
        self.events.emit(EngineEvent::RetryExhausted {
            descriptor_id: descriptor.id.clone(),
            attempts: ceiling,
            last_error,
        });
        false
    }

    /// One pass of cache-or-fetch then apply. `Ok(false)` means a remove
    /// superseded the apply.
    async fn apply_once(&self) -> EngineResult<bool> {
        let descriptor = self.ctx.descriptor();
        if self.applied_recently() && self.apply.is_applied(&self.ctx).await {
            tracing::debug!("{} was applied moments ago, skipping", descriptor.id);
            return Ok(true);
        }
        let claim = self
            .ctx
            .try_claim()
            .ok_or_else(|| EngineError::InFlight(descriptor.id.clone()))?;
        if !self.ctx.is_enabled() {
            return Err(EngineError::Disabled(descriptor.id.clone()));
        }

        if let Some(selector) = &descriptor.ready_selector {
            let ready = wait_for_selector(
                self.document.as_ref(),
                selector,
                self.config.ready_timeout(),
                self.config.ready_poll(),
            )
            .await;
            if !ready {
                tracing::info!("{selector} never appeared for {}, applying anyway", descriptor.id);
            }
        }

        let (payload, from_cache) = match self.cache.get(descriptor) {
            Some(entry) => {
                tracing::debug!("Using cached payload for {}", descriptor.id);
                (entry.to_payload(), true)
            }
            None => match self.pipeline.fetch(descriptor).await {
                Ok(fetched) => {
                    self.events.emit(EngineEvent::FetchSucceeded {
                        descriptor_id: descriptor.id.clone(),
                        strategy: fetched.strategy.clone(),
                        source: fetched.payload.source_url.clone(),
                        bytes: fetched.payload.content.len(),
                        attempts: fetched.attempts.len(),
                    });
                    self.ctx.record_attempts(fetched.attempts);
                    if let Err(e) =
                        self.cache
                            .put(descriptor, &fetched.payload.content, &fetched.payload.source_url)
                    {
                        tracing::warn!("Failed to cache payload for {}: {e}", descriptor.id);
                    }
                    (fetched.payload, false)
                }
                Err(e) => {
                    self.events.emit(EngineEvent::FetchFailed {
                        descriptor_id: descriptor.id.clone(),
                        attempts: e.attempts.len(),
                        reason: e.to_string(),
                    });
                    self.ctx.record_attempts(e.attempts.clone());
                    claim.failed(Vec::new());
                    return Err(e.into());
                }
            },
        };

        match self.apply.apply_claimed(claim, &payload).await {
            Ok(ApplyOutcome::Applied { technique, weak }) => {
                *lock(&self.last_apply) = Some(Instant::now());
                self.events.emit(EngineEvent::Applied {
                    descriptor_id: descriptor.id.clone(),
                    technique,
                    from_cache,
                    weak,
                });
                Ok(true)
            }
            Ok(ApplyOutcome::Superseded) => Ok(false),
            Err(e) => {
                self.events.emit(EngineEvent::ApplyFailed {
                    descriptor_id: descriptor.id.clone(),
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    fn applied_recently(&self) -> bool {
        lock(&self.last_apply)
            .is_some_and(|at| at.elapsed() < self.config.min_apply_interval())
    }

    async fn force_reapply(&self, reason: ReapplyReason) -> bool {
        if !self.ctx.is_enabled() || self.ctx.state() == ApplicationState::Applying {
            return false;
        }
        if self.apply.is_applied(&self.ctx).await {
            return false;
        }
        tracing::info!("Re-applying {} ({reason:?})", self.ctx.descriptor().id);
        self.events.emit(EngineEvent::ReapplyTriggered {
            descriptor_id: self.ctx.descriptor().id.clone(),
            reason,
        });
        self.apply_with_retry().await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Reconcile for EngineInner {
    fn is_enabled(&self) -> bool {
        self.ctx.is_enabled()
    }

    async fn check(&self) -> bool {
        self.apply.is_applied(&self.ctx).await
    }

    async fn reconcile(&self, reason: ReapplyReason) {
        self.force_reapply(reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use crate::fetch::FetchStrategy;
    use crate::types::Technique;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    struct Fixed {
        body: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FetchStrategy for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self, _source: &Url) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.body {
                Some(body) => Ok(body.clone()),
                None => anyhow::bail!("HTTP 503"),
            }
        }
    }

    fn setup(body: Option<&str>) -> (Arc<MemoryDocument>, Arc<Fixed>, Arc<MemoryStore>, EngineController) {
        let config = EngineConfig {
            retry_ceiling: 3,
            ..Default::default()
        };
        let doc = Arc::new(MemoryDocument::new());
        let fixed = Arc::new(Fixed {
            body: body.map(str::to_string),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let descriptor = ResourceDescriptor::new(
            "site",
            vec![Url::parse("https://cdn.test/s.css").unwrap()],
            "#site-styles",
        );
        let controller = EngineController::builder(descriptor, doc.clone())
            .pipeline(FetchPipeline::new(vec![fixed.clone() as Arc<dyn FetchStrategy>], &config))
            .store(store.clone())
            .config(config)
            .build();
        (doc, fixed, store, controller)
    }

    const CSS: &str = "body { background: #111 } main { color: #eee }";

    #[tokio::test(start_paused = true)]
    async fn test_enable_fetches_caches_applies_and_watches() {
        let (doc, fixed, store, controller) = setup(Some(CSS));
        let mut events = controller.subscribe();

        assert!(controller.set_enabled(true).await);
        assert_eq!(controller.state(), ApplicationState::Applied);
        assert_eq!(controller.watch_state(), WatchState::Watching);
        assert_eq!(doc.count("site-styles"), 1);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("enabled_site").as_deref(), Some("true"));
        assert!(controller.cache().get(controller.descriptor()).is_some());

        assert!(matches!(events.try_recv().unwrap(), EngineEvent::EnabledChanged { enabled: true, .. }));
        assert!(matches!(events.try_recv().unwrap(), EngineEvent::FetchSucceeded { .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            EngineEvent::Applied { technique: Technique::InlineStyle, from_cache: false, .. }
        ));
        assert!(matches!(events.try_recv().unwrap(), EngineEvent::WatchStarted { mode: WatchMode::Passive, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_apply_uses_cache() {
        let (doc, fixed, _, controller) = setup(Some(CSS));
        assert!(controller.set_enabled(true).await);
        let inserts = doc.insert_count();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(controller.apply_with_retry().await);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 1);
        assert_eq!(doc.insert_count(), inserts + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_applies_keep_the_node() {
        let (doc, _, _, controller) = setup(Some(CSS));
        assert!(controller.set_enabled(true).await);
        let inserts = doc.insert_count();

        assert!(controller.apply_with_retry().await);
        assert_eq!(doc.insert_count(), inserts);
        assert_eq!(doc.count("site-styles"), 1);

        // Inside the window, a missing node is still re-applied.
        controller.shutdown();
        doc.external_remove("site-styles");
        assert!(controller.apply_with_retry().await);
        assert_eq!(doc.insert_count(), inserts + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detected_loss_schedules_reapply() {
        let (doc, _, _, controller) = setup(Some(CSS));
        controller.set_enabled(true).await;
        controller.shutdown();

        doc.external_remove("site-styles");
        assert!(!controller.is_applied().await);
        assert_eq!(controller.state(), ApplicationState::Unapplied);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(doc.count("site-styles"), 1);
        assert_eq!(controller.state(), ApplicationState::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detected_loss_while_disabled_stays_put() {
        let (doc, _, _, controller) = setup(Some(CSS));
        controller.set_enabled(true).await;
        controller.set_enabled(false).await;

        assert!(!controller.is_applied().await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(doc.count("site-styles"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_stops_and_removes() {
        let (doc, _, store, controller) = setup(Some(CSS));
        controller.set_enabled(true).await;

        assert!(controller.set_enabled(false).await);
        assert_eq!(controller.state(), ApplicationState::Unapplied);
        assert_eq!(controller.watch_state(), WatchState::Idle);
        assert_eq!(doc.count("site-styles"), 0);
        assert_eq!(store.get("enabled_site").as_deref(), Some("false"));
        assert!(!controller.is_applied().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_leaves_failed() {
        let (doc, fixed, _, controller) = setup(None);
        let mut events = controller.subscribe();

        assert!(!controller.set_enabled(true).await);
        assert_eq!(controller.state(), ApplicationState::Failed);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 3);
        assert_eq!(doc.count("site-styles"), 0);

        let mut exhausted = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::RetryExhausted { attempts: 3, .. }) {
                exhausted += 1;
            }
        }
        assert_eq!(exhausted, 1);
        assert_eq!(controller.snapshot().last_attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reapply_only_when_missing() {
        let (doc, _, _, controller) = setup(Some(CSS));
        controller.set_enabled(true).await;
        assert!(!controller.force_reapply().await);

        controller.shutdown();
        doc.external_remove("site-styles");
        assert!(controller.force_reapply().await);
        assert_eq!(doc.count("site-styles"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_respects_persisted_flag() {
        let (doc, _, store, controller) = setup(Some(CSS));
        store.set("enabled_site", "false".to_string()).unwrap();
        let descriptor = controller.descriptor().clone();
        let reopened = EngineController::builder(descriptor, doc.clone())
            .store(store.clone())
            .pipeline(FetchPipeline::new(Vec::new(), &EngineConfig::default()))
            .build();

        assert!(!reopened.is_enabled());
        assert!(!reopened.initialize().await);
        assert_eq!(doc.count("site-styles"), 0);
        assert_eq!(reopened.watch_state(), WatchState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_reapplies_after_settle() {
        let (doc, _, _, controller) = setup(Some(CSS));
        controller.set_enabled(true).await;
        controller.shutdown();

        doc.external_remove("site-styles");
        controller.notify(Trigger::Navigation);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(doc.count("site-styles"), 1);
        assert_eq!(controller.state(), ApplicationState::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_state() {
        let (_, _, _, controller) = setup(Some(CSS));
        controller.set_enabled(true).await;
        let snap = controller.snapshot();
        assert!(snap.enabled);
        assert_eq!(snap.state, ApplicationState::Applied);
        assert_eq!(snap.applied_technique, Some(Technique::InlineStyle));
        assert_eq!(snap.payload_bytes, Some(CSS.len()));
        assert_eq!(snap.watch_state, WatchState::Watching);
        assert!(snap.last_applied_at.is_some());
    }
}
