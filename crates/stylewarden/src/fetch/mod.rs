//! Fetch pipeline: ranked strategies tried against every source until one
//! yields a plausible payload.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use url::Url;

use crate::config::EngineConfig;
use crate::types::{AttemptOutcome, FetchAttempt, FetchError, Payload, ResourceDescriptor};

pub use http::{NativeHttp, OpaqueFetch, RelayHttp};

/// One way of turning a source URL into a body.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Short label used in attempts and logs.
    fn name(&self) -> &str;

    /// Fetch the body at `source`. Timeouts are enforced by the pipeline.
    async fn fetch(&self, source: &Url) -> anyhow::Result<String>;
}

/// The winning payload plus every attempt made to obtain it.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub payload: Payload,
    pub strategy: String,
    pub attempts: Vec<FetchAttempt>,
}

/// Ordered, fault-tolerant fetch.
#[derive(Clone)]
pub struct FetchPipeline {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    timeout: Duration,
    min_payload_len: usize,
    error_markers: Vec<String>,
}

impl FetchPipeline {
    /// Pipeline over `strategies`, tried in the given order.
    pub fn new(strategies: Vec<Arc<dyn FetchStrategy>>, config: &EngineConfig) -> Self {
        Self {
            strategies,
            timeout: config.fetch_timeout(),
            min_payload_len: config.min_payload_len,
            error_markers: config
                .error_markers
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Native request → in-page request (if given) → relays → opaque fetch.
    pub fn standard(config: &EngineConfig, in_page: Option<Arc<dyn FetchStrategy>>) -> Self {
        let mut strategies: Vec<Arc<dyn FetchStrategy>> =
            vec![Arc::new(NativeHttp::new(config.fetch_timeout_ms))];
        if let Some(page) = in_page {
            strategies.push(page);
        }
        for template in &config.relays {
            strategies.push(Arc::new(RelayHttp::new(template, config.fetch_timeout_ms)));
        }
        strategies.push(Arc::new(OpaqueFetch::new(config.fetch_timeout_ms)));
        Self::new(strategies, config)
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Try each strategy against each source, strategy-major, stopping at the
    /// first plausible payload.
    pub async fn fetch(&self, descriptor: &ResourceDescriptor) -> Result<FetchedPayload, FetchError> {
        let mut attempts = Vec::new();

        for strategy in &self.strategies {
            for source in &descriptor.sources {
                let started_at = Utc::now();
                let clock = tokio::time::Instant::now();

                let result = match tokio::time::timeout(self.timeout, strategy.fetch(source)).await {
                    Ok(Ok(body)) => self.check_plausible(body),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(_) => Err(format!("timed out after {}ms", self.timeout.as_millis())),
                };

                let elapsed_ms = clock.elapsed().as_millis() as u64;
                match result {
                    Ok(body) => {
                        tracing::debug!(
                            "{} fetched {} bytes for {} via {}",
                            descriptor.id,
                            body.len(),
                            source,
                            strategy.name()
                        );
                        attempts.push(FetchAttempt {
                            strategy: strategy.name().to_string(),
                            source: source.clone(),
                            started_at,
                            elapsed_ms,
                            outcome: AttemptOutcome::Success { bytes: body.len() },
                        });
                        return Ok(FetchedPayload {
                            payload: Payload::new(body, source.clone()),
                            strategy: strategy.name().to_string(),
                            attempts,
                        });
                    }
                    Err(reason) => {
                        tracing::debug!(
                            "{} via {} failed for {}: {reason}",
                            source,
                            strategy.name(),
                            descriptor.id
                        );
                        attempts.push(FetchAttempt {
                            strategy: strategy.name().to_string(),
                            source: source.clone(),
                            started_at,
                            elapsed_ms,
                            outcome: AttemptOutcome::Failure { reason },
                        });
                    }
                }
            }
        }

        Err(FetchError {
            descriptor_id: descriptor.id.clone(),
            attempts,
        })
    }

    /// Accept a body only if it is long enough and not an error page.
    fn check_plausible(&self, body: String) -> Result<String, String> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err("empty body".to_string());
        }
        if trimmed.len() < self.min_payload_len {
            return Err(format!(
                "implausibly short body ({} bytes, need {})",
                trimmed.len(),
                self.min_payload_len
            ));
        }
        let head: String = trimmed.chars().take(256).collect::<String>().to_ascii_lowercase();
        if let Some(marker) = self.error_markers.iter().find(|m| head.starts_with(m.as_str())) {
            return Err(format!("error page (starts with `{marker}`)"));
        }
        Ok(body)
    }
}
