//! Core data types for descriptors, cache entries, fetch attempts and engine state.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Default time-to-live for cached payloads (6 hours).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Immutable per-target configuration supplied by the site registry.
///
/// The engine only ever reads a descriptor. Changing a source list or TTL means
/// building a new descriptor, which also invalidates cache entries whose
/// `source_url` is no longer listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Stable identifier, used for storage keys.
    pub id: String,
    /// Human-readable name for status output.
    #[serde(default)]
    pub name: String,
    /// Candidate sources in preference order.
    pub sources: Vec<Url>,
    /// Id selector of the single node the engine owns (e.g. `#chatgpt-enhanced-styles`).
    pub target_selector: String,
    /// Maximum age of a cached payload.
    #[serde(
        rename = "cache_ttl_secs",
        with = "duration_secs",
        default = "default_cache_ttl"
    )]
    pub cache_ttl: Duration,
    /// Poll for the artifact instead of watching mutations.
    #[serde(default)]
    pub aggressive_reconciliation: bool,
    /// Hosts this descriptor applies to (exact or parent domain).
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Desired state when nothing has been persisted yet.
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,
    /// Element that must exist before the first injection.
    #[serde(default)]
    pub ready_selector: Option<String>,
    /// Overrides the default injection technique ranking.
    #[serde(default)]
    pub technique_order: Option<Vec<Technique>>,
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_true() -> bool {
    true
}

impl ResourceDescriptor {
    /// Create a descriptor with default TTL and passive reconciliation.
    pub fn new(id: impl Into<String>, sources: Vec<Url>, target_selector: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            sources,
            target_selector: target_selector.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            aggressive_reconciliation: false,
            hosts: Vec::new(),
            enabled_by_default: true,
            ready_selector: None,
            technique_order: None,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_aggressive_reconciliation(mut self, aggressive: bool) -> Self {
        self.aggressive_reconciliation = aggressive;
        self
    }

    pub fn with_technique_order(mut self, order: Vec<Technique>) -> Self {
        self.technique_order = Some(order);
        self
    }

    pub fn with_ready_selector(mut self, selector: impl Into<String>) -> Self {
        self.ready_selector = Some(selector.into());
        self
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Element id of the artifact node, i.e. the selector without its leading `#`.
    pub fn artifact_id(&self) -> &str {
        self.target_selector
            .strip_prefix('#')
            .unwrap_or(&self.target_selector)
    }

    /// Whether `url` is one of the current sources.
    pub fn has_source(&self, url: &Url) -> bool {
        self.sources.iter().any(|s| s == url)
    }

    /// Name for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Whether this descriptor targets `host` (exact match or subdomain).
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.hosts.iter().any(|h| {
            let h = h.to_ascii_lowercase();
            host == h || host.ends_with(&format!(".{h}"))
        })
    }
}

/// Serde helper storing a `Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// One injection technique, ranked among alternatives by the apply engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    /// A `<style>` node carrying the payload inline.
    InlineStyle,
    /// A `<link>` pointing at an object URL that holds the payload.
    ObjectUrlLink,
    /// A `<link>` pointing at the payload's source URL.
    ExternalLink,
}

impl Technique {
    /// Default reliability ranking.
    pub const DEFAULT_ORDER: [Technique; 3] = [
        Technique::InlineStyle,
        Technique::ObjectUrlLink,
        Technique::ExternalLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::InlineStyle => "inline-style",
            Technique::ObjectUrlLink => "object-url-link",
            Technique::ExternalLink => "external-link",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetched payload together with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub content: String,
    pub source_url: Url,
}

impl Payload {
    pub fn new(content: impl Into<String>, source_url: Url) -> Self {
        Self {
            content: content.into(),
            source_url,
        }
    }
}

/// The last successfully fetched payload for a descriptor, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub payload: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub fetched_at: DateTime<Utc>,
    #[serde(rename = "sourceURL")]
    pub source_url: Url,
    pub descriptor_id: String,
}

impl CacheEntry {
    /// Age of the entry at `now`. Entries stamped in the future have age zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or_default()
    }

    /// Whether the entry is older than `ttl` at `now`.
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age_at(now) > ttl
    }

    pub fn to_payload(&self) -> Payload {
        Payload::new(self.payload.clone(), self.source_url.clone())
    }
}

/// Result of a single strategy/source attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success { bytes: usize },
    Failure { reason: String },
}

/// One strategy applied to one source, recorded for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAttempt {
    pub strategy: String,
    pub source: Url,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: AttemptOutcome,
}

impl FetchAttempt {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            AttemptOutcome::Failure { reason } => Some(reason),
            AttemptOutcome::Success { .. } => None,
        }
    }
}

/// Per-descriptor application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    #[default]
    Unapplied,
    Applying,
    Applied,
    Failed,
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplicationState::Unapplied => "unapplied",
            ApplicationState::Applying => "applying",
            ApplicationState::Applied => "applied",
            ApplicationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Reconciliation loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    #[default]
    Idle,
    Watching,
}

/// How the reconciliation loop notices a missing artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Structural-mutation notifications, throttled.
    Passive,
    /// Fixed-interval polling with a bounded number of checks.
    Aggressive,
}

/// Why a technique did not produce a verified artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechniqueFailure {
    pub technique: Technique,
    pub reason: String,
}

/// Diagnostic view of one engine, for status displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub descriptor_id: String,
    pub enabled: bool,
    pub state: ApplicationState,
    pub watch_state: WatchState,
    pub watch_mode: WatchMode,
    pub reconciliation_checks: u32,
    pub applied_technique: Option<Technique>,
    pub payload_bytes: Option<usize>,
    pub payload_source: Option<Url>,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub last_attempts: Vec<FetchAttempt>,
    pub last_apply_failures: Vec<TechniqueFailure>,
}

fn summarize_attempts(attempts: &[FetchAttempt]) -> String {
    if attempts.is_empty() {
        return "no strategy was attempted".to_string();
    }
    attempts
        .iter()
        .filter_map(|a| {
            a.failure_reason()
                .map(|reason| format!("{} <{}>: {reason}", a.strategy, a.source))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn summarize_failures(failures: &[TechniqueFailure]) -> String {
    if failures.is_empty() {
        return "no technique was attempted".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.technique, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Every fetch strategy failed for every source.
#[derive(thiserror::Error, Debug, Clone)]
#[error("all fetch strategies failed for `{descriptor_id}`: {}", summarize_attempts(.attempts))]
pub struct FetchError {
    pub descriptor_id: String,
    pub attempts: Vec<FetchAttempt>,
}

impl FetchError {
    /// Per-attempt failure reasons, in attempt order.
    pub fn reasons(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .filter_map(FetchAttempt::failure_reason)
            .collect()
    }
}

/// Every injection technique failed or could not be verified.
#[derive(thiserror::Error, Debug, Clone)]
#[error("all injection techniques failed for `{descriptor_id}`: {}", summarize_failures(.failures))]
pub struct ApplyError {
    pub descriptor_id: String,
    pub failures: Vec<TechniqueFailure>,
}

/// Errors from the persistent key-value store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur in the engine.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("an apply is already in flight for `{0}`")]
    InFlight(String),

    #[error("`{0}` is disabled")]
    Disabled(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Invalid registry: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type EngineResult<T> = Result<T, EngineError>;
