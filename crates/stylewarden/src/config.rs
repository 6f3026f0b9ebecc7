//! Engine configuration loading and path resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{EngineError, EngineResult};

/// Directory name under the user's home for state and config.
pub const STATE_DIR_NAME: &str = ".stylewarden";

/// Tunables shared by every engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per strategy call.
    pub fetch_timeout_ms: u64,
    /// Minimum trimmed payload length considered plausible.
    pub min_payload_len: usize,
    /// Case-insensitive prefixes that mark a body as an error page.
    pub error_markers: Vec<String>,
    /// Relay URL templates; `{url}` is replaced by the percent-encoded source.
    pub relays: Vec<String>,
    /// Minimum spacing between reconciliation-triggered applies.
    pub reapply_throttle_ms: u64,
    /// Aggressive poll interval.
    pub poll_interval_ms: u64,
    /// Aggressive poll bound.
    pub max_checks: u32,
    /// Attempts made by `apply_with_retry` before giving up.
    pub retry_ceiling: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Quiet period after an external trigger before re-asserting.
    pub trigger_settle_ms: u64,
    /// How long an injected link may take to report load or error.
    pub link_load_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    /// A present artifact applied more recently than this is left alone.
    pub min_apply_interval_ms: u64,
    /// Browser binary used by `run`; searched for when unset.
    pub chromium_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 15_000,
            min_payload_len: 10,
            error_markers: vec![
                "<!doctype html".to_string(),
                "<html".to_string(),
                "404: not found".to_string(),
                "access denied".to_string(),
            ],
            relays: vec![
                "https://api.allorigins.win/raw?url={url}".to_string(),
                "https://corsproxy.io/?{url}".to_string(),
                "https://api.codetabs.com/v1/proxy?quest={url}".to_string(),
            ],
            reapply_throttle_ms: 1_000,
            poll_interval_ms: 2_000,
            max_checks: 50,
            retry_ceiling: 15,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            trigger_settle_ms: 300,
            link_load_timeout_ms: 2_000,
            ready_timeout_ms: 10_000,
            ready_poll_ms: 100,
            min_apply_interval_ms: 500,
            chromium_path: None,
        }
    }
}

impl EngineConfig {
    /// Load from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine spin or never finish.
    pub fn validate(&self) -> EngineResult<()> {
        if self.fetch_timeout_ms == 0 {
            return Err(EngineError::Config("fetch_timeout_ms must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(EngineError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.ready_poll_ms == 0 {
            return Err(EngineError::Config("ready_poll_ms must be > 0".into()));
        }
        if self.retry_ceiling == 0 {
            return Err(EngineError::Config("retry_ceiling must be >= 1".into()));
        }
        if let Some(bad) = self.relays.iter().find(|r| !r.contains("{url}")) {
            return Err(EngineError::Config(format!(
                "relay template `{bad}` has no {{url}} placeholder"
            )));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn reapply_throttle(&self) -> Duration {
        Duration::from_millis(self.reapply_throttle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn trigger_settle(&self) -> Duration {
        Duration::from_millis(self.trigger_settle_ms)
    }

    pub fn link_load_timeout(&self) -> Duration {
        Duration::from_millis(self.link_load_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn min_apply_interval(&self) -> Duration {
        Duration::from_millis(self.min_apply_interval_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Resolve the state directory: explicit → `STYLEWARDEN_HOME` → `~/.stylewarden`.
pub fn resolve_state_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Ok(env_path) = std::env::var("STYLEWARDEN_HOME") {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Resolve the site registry file: explicit → `STYLEWARDEN_SITES` → `<state>/sites.json`.
pub fn resolve_sites_path(explicit: Option<&Path>, state_dir: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Ok(env_path) = std::env::var("STYLEWARDEN_SITES") {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    state_dir.join("sites.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_checks": 5, "relays": []}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_checks, 5);
        assert!(config.relays.is_empty());
        assert_eq!(config.poll_interval_ms, 2_000);
        assert_eq!(config.min_apply_interval_ms, 500);
        assert!(config.chromium_path.is_none());
    }

    #[test]
    fn test_chromium_path_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"chromium_path": "/opt/chrome/chrome"}"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.chromium_path, Some(PathBuf::from("/opt/chrome/chrome")));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_relay_without_placeholder_rejected() {
        let config = EngineConfig {
            relays: vec!["https://relay.test/".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(500));
        assert_eq!(config.retry_delay(2), Duration::from_millis(1_000));
        assert_eq!(config.retry_delay(4), Duration::from_millis(4_000));
        assert_eq!(config.retry_delay(10), Duration::from_millis(8_000));
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_millis(8_000));
    }

    #[test]
    fn test_explicit_paths_win() {
        let state = resolve_state_dir(Some(Path::new("/tmp/sw-state")));
        assert_eq!(state, PathBuf::from("/tmp/sw-state"));
        let sites = resolve_sites_path(Some(Path::new("/tmp/sites.json")), &state);
        assert_eq!(sites, PathBuf::from("/tmp/sites.json"));
    }
}
