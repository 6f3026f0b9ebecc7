//! Apply engine: idempotent, verified injection of a payload into the host
//! document, and its removal.

pub mod techniques;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::context::{ApplyClaim, EngineContext};
use crate::document::HostDocument;
use crate::types::{ApplicationState, ApplyError, Payload, ResourceDescriptor, Technique, TechniqueFailure};

pub use techniques::{ExternalLink, InlineStyle, ObjectUrlLink};

/// What a successful injection left behind besides the node.
#[derive(Debug, Clone, Default)]
pub struct Injected {
    pub object_url: Option<String>,
}

/// One way of attaching a payload to the document.
#[async_trait]
pub trait ApplyStrategy: Send + Sync {
    fn technique(&self) -> Technique;

    /// Insert a node with element id `id`. On error the strategy must leave
    /// nothing behind.
    async fn inject(
        &self,
        doc: &dyn HostDocument,
        id: &str,
        payload: &Payload,
    ) -> anyhow::Result<Injected>;
}

/// Outcome of a presence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Applied and the node is live.
    Present,
    /// Not applied, and nothing changed.
    Absent,
    /// Was applied but the node is gone. The context is now `Unapplied`.
    Lost,
}

/// How a claimed apply ended, short of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { technique: Technique, weak: bool },
    /// A remove happened mid-apply; the new node was taken back out.
    Superseded,
}

enum Verdict {
    Verified,
    Weak,
    Missing,
    Empty,
}

#[derive(Clone)]
pub struct ApplyEngine {
    doc: Arc<dyn HostDocument>,
    techniques: Vec<Arc<dyn ApplyStrategy>>,
}

impl ApplyEngine {
    pub fn new(doc: Arc<dyn HostDocument>, techniques: Vec<Arc<dyn ApplyStrategy>>) -> Self {
        Self { doc, techniques }
    }

    /// Inline style → object-URL link → external link.
    pub fn standard(doc: Arc<dyn HostDocument>, config: &EngineConfig) -> Self {
        let load_timeout = config.link_load_timeout();
        Self::new(
            doc,
            vec![
                Arc::new(InlineStyle),
                Arc::new(ObjectUrlLink { load_timeout }),
                Arc::new(ExternalLink { load_timeout }),
            ],
        )
    }

    pub fn document(&self) -> &Arc<dyn HostDocument> {
        &self.doc
    }

    /// Techniques in the order used for `descriptor`: its override first,
    /// then any remaining techniques in default order.
    pub fn ordered_for(&self, descriptor: &ResourceDescriptor) -> Vec<Arc<dyn ApplyStrategy>> {
        let Some(order) = &descriptor.technique_order else {
            return self.techniques.clone();
        };
        let mut ordered: Vec<Arc<dyn ApplyStrategy>> = order
            .iter()
            .filter_map(|t| self.techniques.iter().find(|s| s.technique() == *t).cloned())
            .collect();
        for strategy in &self.techniques {
            if !order.contains(&strategy.technique()) {
                ordered.push(strategy.clone());
            }
        }
        ordered
    }

    /// Apply `payload`. Returns false if an apply is already in flight or
    /// every technique failed.
    pub async fn apply(&self, ctx: &Arc<EngineContext>, payload: &Payload) -> bool {
        let Some(claim) = ctx.try_claim() else {
            tracing::debug!("Apply for {} already in flight", ctx.descriptor().id);
            return false;
        };
        matches!(
            self.apply_claimed(claim, payload).await,
            Ok(ApplyOutcome::Applied { .. })
        )
    }

    /// Apply under an already-held claim.
    pub async fn apply_claimed(
        &self,
        claim: ApplyClaim,
        payload: &Payload,
    ) -> Result<ApplyOutcome, ApplyError> {
        let ctx = Arc::clone(claim.context());
        let descriptor = ctx.descriptor();
        let id = descriptor.artifact_id();

        self.clear_node(&ctx).await;

        let mut failures = Vec::new();
        for strategy in self.ordered_for(descriptor) {
            if !claim.is_current() {
                return Ok(ApplyOutcome::Superseded);
            }
            let technique = strategy.technique();

            let injected = match strategy.inject(self.doc.as_ref(), id, payload).await {
                Ok(injected) => injected,
                Err(e) => {
                    tracing::debug!("{technique} failed for {}: {e:#}", descriptor.id);
                    failures.push(TechniqueFailure {
                        technique,
                        reason: format!("{e:#}"),
                    });
                    continue;
                }
            };

            let weak = match self.verify(id).await {
                Verdict::Verified => false,
                Verdict::Weak => true,
                verdict => {
                    let reason = match verdict {
                        Verdict::Missing => "node missing after injection",
                        _ => "node has no rules",
                    };
                    tracing::debug!("{technique} unverified for {}: {reason}", descriptor.id);
                    self.discard(id, injected.object_url.as_deref()).await;
                    failures.push(TechniqueFailure {
                        technique,
                        reason: reason.to_string(),
                    });
                    continue;
                }
            };

            let object_url = injected.object_url.clone();
            if claim.applied(technique, payload.clone(), weak, injected.object_url) {
                tracing::info!(
                    "Applied {} via {technique}{}",
                    descriptor.id,
                    if weak { " (unverified rules)" } else { "" }
                );
                return Ok(ApplyOutcome::Applied { technique, weak });
            }
            tracing::debug!("Apply for {} superseded by a remove", descriptor.id);
            self.discard(id, object_url.as_deref()).await;
            return Ok(ApplyOutcome::Superseded);
        }

        if !claim.is_current() {
            return Ok(ApplyOutcome::Superseded);
        }
        let err = ApplyError {
            descriptor_id: descriptor.id.clone(),
            failures: failures.clone(),
        };
        claim.failed(failures);
        Err(err)
    }

    /// Remove the artifact, release its object URL and reset to `Unapplied`.
    /// Safe to call in any state.
    pub async fn remove(&self, ctx: &EngineContext) {
        let tracked = ctx.mark_removed();
        let id = ctx.descriptor().artifact_id();
        let node_url = match self.doc.remove(id).await {
            Ok(node) => node.and_then(|n| n.object_url().map(str::to_string)),
            Err(e) => {
                tracing::warn!("Failed to remove {} from document: {e:#}", ctx.descriptor().id);
                None
            }
        };
        self.release(tracked, node_url).await;
        tracing::debug!("Removed {}", ctx.descriptor().id);
    }

    /// Whether the artifact is present and live. A missing artifact moves an
    /// `Applied` context back to `Unapplied`.
    pub async fn is_applied(&self, ctx: &EngineContext) -> bool {
        self.presence(ctx).await == Presence::Present
    }

    /// Like [`is_applied`](Self::is_applied), but distinguishes an artifact
    /// that was just found missing from one that was never there.
    pub async fn presence(&self, ctx: &EngineContext) -> Presence {
        match self.doc.find(ctx.descriptor().artifact_id()).await {
            Ok(Some(node)) if node.is_live() => {
                if ctx.state() == ApplicationState::Applied {
                    Presence::Present
                } else {
                    Presence::Absent
                }
            }
            Ok(_) => {
                if ctx.mark_missing() {
                    tracing::info!("{} artifact disappeared", ctx.descriptor().id);
                    Presence::Lost
                } else {
                    Presence::Absent
                }
            }
            Err(e) => {
                tracing::debug!("Presence check for {} failed: {e:#}", ctx.descriptor().id);
                Presence::Absent
            }
        }
    }

    async fn verify(&self, id: &str) -> Verdict {
        match self.doc.find(id).await {
            Ok(Some(node)) => match node.rule_count {
                Some(0) => Verdict::Empty,
                Some(_) => Verdict::Verified,
                None => Verdict::Weak,
            },
            Ok(None) => Verdict::Missing,
            Err(e) => {
                tracing::debug!("Verification of {id} failed: {e:#}");
                Verdict::Missing
            }
        }
    }

    /// Remove any previous node and object URL without touching the epoch.
    async fn clear_node(&self, ctx: &EngineContext) {
        let tracked = ctx.take_object_url();
        let node_url = match self.doc.remove(ctx.descriptor().artifact_id()).await {
            Ok(node) => node.and_then(|n| n.object_url().map(str::to_string)),
            Err(_) => None,
        };
        self.release(tracked, node_url).await;
    }

    async fn discard(&self, id: &str, object_url: Option<&str>) {
        let _ = self.doc.remove(id).await;
        if let Some(url) = object_url {
            let _ = self.doc.revoke_object_url(url).await;
        }
    }

    async fn release(&self, tracked: Option<String>, node_url: Option<String>) {
        if let Some(url) = &tracked {
            let _ = self.doc.revoke_object_url(url).await;
        }
        if let Some(url) = node_url.filter(|u| Some(u) != tracked.as_ref()) {
            let _ = self.doc.revoke_object_url(&url).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{LinkLoad, MemoryDocument};
    use crate::types::ApplicationState;
    use url::Url;

    fn setup() -> (Arc<MemoryDocument>, ApplyEngine, Arc<EngineContext>) {
        let doc = Arc::new(MemoryDocument::new());
        let engine = ApplyEngine::standard(doc.clone(), &EngineConfig::default());
        let ctx = EngineContext::new(
            ResourceDescriptor::new(
                "site",
                vec![Url::parse("https://cdn.test/s.css").unwrap()],
                "#site-styles",
            ),
            true,
        );
        (doc, engine, ctx)
    }

    fn payload() -> Payload {
        Payload::new(
            "body { color: red } main { margin: 0 }",
            Url::parse("https://cdn.test/s.css").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_apply_uses_first_technique() {
        let (doc, engine, ctx) = setup();
        assert!(engine.apply(&ctx, &payload()).await);
        assert_eq!(ctx.state(), ApplicationState::Applied);
        assert_eq!(ctx.applied_technique(), Some(Technique::InlineStyle));
        assert_eq!(doc.count("site-styles"), 1);
        assert!(engine.is_applied(&ctx).await);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (doc, engine, ctx) = setup();
        assert!(engine.apply(&ctx, &payload()).await);
        assert!(engine.apply(&ctx, &payload()).await);
        assert_eq!(doc.count("site-styles"), 1);
    }

    #[tokio::test]
    async fn test_apply_refused_while_in_flight() {
        let (_, engine, ctx) = setup();
        let _claim = ctx.try_claim().unwrap();
        assert!(!engine.apply(&ctx, &payload()).await);
    }

    #[tokio::test]
    async fn test_blocked_inline_falls_back_to_object_url() {
        let (doc, engine, ctx) = setup();
        doc.block_inline_styles(true);

        assert!(engine.apply(&ctx, &payload()).await);
        assert_eq!(ctx.applied_technique(), Some(Technique::ObjectUrlLink));
        assert_eq!(doc.count("site-styles"), 1);
        assert_eq!(doc.live_object_urls(), 1);
    }

    #[tokio::test]
    async fn test_external_link_is_weak_success() {
        let (doc, engine, ctx) = setup();
        doc.block_inline_styles(true);
        doc.set_object_urls_supported(false);

        let claim = ctx.try_claim().unwrap();
        let outcome = engine.apply_claimed(claim, &payload()).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                technique: Technique::ExternalLink,
                weak: true
            }
        );
        assert!(ctx.view().weak);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_with_every_reason() {
        let (doc, engine, ctx) = setup();
        doc.block_inline_styles(true);
        doc.set_link_outcome(LinkLoad::Errored);

        let claim = ctx.try_claim().unwrap();
        let err = engine.apply_claimed(claim, &payload()).await.unwrap_err();
        assert_eq!(err.failures.len(), 3);
        assert_eq!(err.failures[0].technique, Technique::InlineStyle);
        assert_eq!(ctx.state(), ApplicationState::Failed);
        assert_eq!(doc.count("site-styles"), 0);
        assert_eq!(doc.live_object_urls(), 0);
    }

    #[tokio::test]
    async fn test_technique_order_override() {
        let (doc, engine, _) = setup();
        let descriptor = ResourceDescriptor::new(
            "grok",
            vec![Url::parse("https://cdn.test/s.css").unwrap()],
            "#grok-styles",
        )
        .with_technique_order(vec![Technique::ObjectUrlLink]);
        let order: Vec<_> = engine
            .ordered_for(&descriptor)
            .iter()
            .map(|s| s.technique())
            .collect();
        assert_eq!(
            order,
            vec![
                Technique::ObjectUrlLink,
                Technique::InlineStyle,
                Technique::ExternalLink
            ]
        );

        let ctx = EngineContext::new(descriptor, true);
        assert!(engine.apply(&ctx, &payload()).await);
        assert_eq!(ctx.applied_technique(), Some(Technique::ObjectUrlLink));
        assert_eq!(doc.count("grok-styles"), 1);
    }

    #[tokio::test]
    async fn test_remove_releases_object_url() {
        let (doc, engine, ctx) = setup();
        doc.block_inline_styles(true);
        assert!(engine.apply(&ctx, &payload()).await);
        assert_eq!(doc.live_object_urls(), 1);

        engine.remove(&ctx).await;
        assert!(!engine.is_applied(&ctx).await);
        assert_eq!(ctx.state(), ApplicationState::Unapplied);
        assert_eq!(doc.count("site-styles"), 0);
        assert_eq!(doc.live_object_urls(), 0);

        engine.remove(&ctx).await;
        assert_eq!(ctx.state(), ApplicationState::Unapplied);
    }

    #[tokio::test]
    async fn test_presence_reports_loss_once() {
        let (doc, engine, ctx) = setup();
        assert_eq!(engine.presence(&ctx).await, Presence::Absent);
        assert!(engine.apply(&ctx, &payload()).await);
        assert_eq!(engine.presence(&ctx).await, Presence::Present);

        doc.external_remove("site-styles");
        assert_eq!(engine.presence(&ctx).await, Presence::Lost);
        assert_eq!(engine.presence(&ctx).await, Presence::Absent);
        assert_eq!(ctx.state(), ApplicationState::Unapplied);
    }

    #[tokio::test]
    async fn test_reapply_after_external_removal_releases_stale_url() {
        let (doc, engine, ctx) = setup();
        doc.block_inline_styles(true);
        assert!(engine.apply(&ctx, &payload()).await);
        doc.external_remove("site-styles");

        assert!(!engine.is_applied(&ctx).await);
        assert_eq!(ctx.state(), ApplicationState::Unapplied);

        assert!(engine.apply(&ctx, &payload()).await);
        assert_eq!(doc.count("site-styles"), 1);
        assert_eq!(doc.live_object_urls(), 1);
    }
}
