//! Subcommand implementations. Each returns data; rendering lives in `output`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use url::Url;

use stylewarden::document::chromium::{launch_browser, PageFetch};
use stylewarden::document::ChromiumDocument;
use stylewarden::{
    CacheStore, EngineController, EngineEvent, EngineSnapshot, FetchAttempt,
    FetchPipeline, FetchStrategy, MemoryDocument, Settings, Trigger,
};

use crate::output;
use crate::workspace::{site, site_for_page, Workspace};

/// Persisted view of one configured site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub sources: Vec<Url>,
    pub mode: &'static str,
    pub cache: Option<CacheStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub bytes: usize,
    pub source: Url,
    pub age_secs: u64,
    pub fresh: bool,
}

/// Outcome of a one-shot pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub site: String,
    pub strategy: Option<String>,
    pub source: Option<Url>,
    pub bytes: Option<usize>,
    pub attempts: Vec<FetchAttempt>,
}

impl FetchReport {
    pub fn succeeded(&self) -> bool {
        self.strategy.is_some()
    }
}

pub fn status(ws: &Workspace) -> Result<Vec<SiteStatus>> {
    let registry = ws.registry()?;
    let store = ws.store()?;
    let settings = Settings::new(store.clone());
    let cache = CacheStore::new(store);

    Ok(registry
        .iter()
        .map(|descriptor| {
            let cache = cache.peek(descriptor).map(|entry| CacheStatus {
                bytes: entry.payload.len(),
                age_secs: cache.age(descriptor).unwrap_or_default().as_secs(),
                fresh: cache.get(descriptor).is_some(),
                source: entry.source_url,
            });
            SiteStatus {
                id: descriptor.id.clone(),
                name: descriptor.display_name().to_string(),
                enabled: settings.is_enabled(descriptor),
                sources: descriptor.sources.clone(),
                mode: if descriptor.aggressive_reconciliation {
                    "aggressive"
                } else {
                    "passive"
                },
                cache,
            }
        })
        .collect())
}

/// Persist the enabled flag for `id`. A running `run` picks it up on restart.
pub fn set_enabled(ws: &Workspace, id: &str, enabled: bool) -> Result<()> {
    let registry = ws.registry()?;
    let descriptor = site(&registry, id)?;
    Settings::new(ws.store()?).set_enabled(descriptor, enabled)?;
    tracing::info!("{id} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

/// Drop one site's cache entry, or every entry when `id` is `None`.
pub fn clear_cache(ws: &Workspace, id: Option<&str>) -> Result<usize> {
    let cache = CacheStore::new(ws.store()?);
    let removed = match id {
        Some(id) => {
            let registry = ws.registry()?;
            usize::from(cache.invalidate(site(&registry, id)?)?)
        }
        None => cache.clear_all()?,
    };
    tracing::info!("Removed {removed} cache entries");
    Ok(removed)
}

/// Run the out-of-page pipeline once and cache the result.
pub async fn fetch(ws: &Workspace, id: &str) -> Result<FetchReport> {
    let config = ws.config()?;
    let registry = ws.registry()?;
    let descriptor = site(&registry, id)?;
    let pipeline = FetchPipeline::standard(&config, None);
    tracing::debug!("Strategies: {}", pipeline.strategy_names().join(", "));

    match pipeline.fetch(descriptor).await {
        Ok(fetched) => {
            CacheStore::new(ws.store()?).put(
                descriptor,
                &fetched.payload.content,
                &fetched.payload.source_url,
            )?;
            Ok(FetchReport {
                site: id.to_string(),
                strategy: Some(fetched.strategy),
                bytes: Some(fetched.payload.content.len()),
                source: Some(fetched.payload.source_url),
                attempts: fetched.attempts,
            })
        }
        Err(e) => {
            tracing::warn!("{e}");
            Ok(FetchReport {
                site: id.to_string(),
                strategy: None,
                source: None,
                bytes: None,
                attempts: e.attempts,
            })
        }
    }
}

/// Apply once against an in-memory document and report the result.
pub async fn dry_run(ws: &Workspace, page: &Url, explicit: Option<&str>) -> Result<EngineSnapshot> {
    let config = ws.config()?;
    let registry = ws.registry()?;
    let descriptor = site_for_page(&registry, page, explicit)?.clone();

    let controller = EngineController::builder(descriptor, Arc::new(MemoryDocument::new()))
        .pipeline(FetchPipeline::standard(&config, None))
        .store(ws.store()?)
        .config(config)
        .build();
    controller.apply_with_retry().await;
    Ok(controller.snapshot())
}

/// Open `page` in Chromium and keep the stylesheet applied until Ctrl-C.
pub async fn run(
    ws: &Workspace,
    page_url: &Url,
    explicit: Option<&str>,
    headless: bool,
    json: bool,
) -> Result<EngineSnapshot> {
    let config = ws.config()?;
    let registry = ws.registry()?;
    let descriptor = site_for_page(&registry, page_url, explicit)?.clone();
    tracing::info!("Site: {} ({})", descriptor.display_name(), descriptor.id);

    let (mut browser, handler) = launch_browser(headless, config.chromium_path.as_deref()).await?;
    let page = browser
        .new_page(page_url.as_str())
        .await
        .with_context(|| format!("failed to open {page_url}"))?;

    let document = Arc::new(ChromiumDocument::attach(page.clone(), config.ready_poll()).await?);
    let in_page: Arc<dyn FetchStrategy> = Arc::new(PageFetch::new(page));
    let controller = EngineController::builder(descriptor, document.clone())
        .pipeline(FetchPipeline::standard(&config, Some(in_page)))
        .store(ws.store()?)
        .config(config)
        .build();
    let mut events = controller.subscribe();

    controller.initialize().await;

    let mut last_url = document.url().await.ok().flatten();
    let mut nav = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => output::print_event(&event, json)?,
                Err(RecvError::Lagged(n)) => tracing::debug!("Skipped {n} events"),
                Err(RecvError::Closed) => break,
            },
            _ = nav.tick() => {
                let url = document.url().await.ok().flatten();
                if url != last_url {
                    tracing::debug!("Navigated to {}", url.as_deref().unwrap_or("?"));
                    last_url = url;
                    controller.notify(Trigger::Navigation);
                } else if controller.is_enabled() {
                    // A replaced <head> takes the observer with it; presence is checked directly.
                    controller.is_applied().await;
                }
            }
        }
    }

    let snapshot = controller.snapshot();
    controller.shutdown();
    if let Err(e) = browser.close().await {
        tracing::debug!("Browser close failed: {e}");
    }
    handler.abort();
    Ok(snapshot)
}

/// Whether an event should surface at info level during `run`.
pub fn is_notable(event: &EngineEvent) -> bool {
    !matches!(
        event,
        EngineEvent::WatchStarted { .. } | EngineEvent::WatchStopped { .. }
    )
}
