//! Engine event bus.
//!
//! A `tokio::sync::broadcast` channel carrying [`EngineEvent`] values to any
//! number of independent observers (status line, log sink, tests). With no
//! subscribers, events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use url::Url;

use crate::types::{Technique, WatchMode};

/// Why a re-apply was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapplyReason {
    /// The artifact node was removed from the document.
    ArtifactRemoved,
    /// A poll found the artifact missing.
    PollMissing,
    /// Navigation, focus or visibility change.
    ExternalTrigger,
}

/// Every event an engine emits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    // ── Fetch ────────────────────
    /// A strategy produced a plausible payload.
    FetchSucceeded {
        descriptor_id: String,
        strategy: String,
        source: Url,
        bytes: usize,
        attempts: usize,
    },
    /// Every strategy failed for every source.
    FetchFailed {
        descriptor_id: String,
        attempts: usize,
        reason: String,
    },

    // ── Apply ────────────────────
    /// The artifact is present and verified.
    Applied {
        descriptor_id: String,
        technique: Technique,
        from_cache: bool,
        /// The node exists but its rules could not be inspected.
        weak: bool,
    },
    /// Every technique failed.
    ApplyFailed { descriptor_id: String, reason: String },
    /// The artifact was removed by the engine.
    Removed { descriptor_id: String },

    // ── Reconciliation ────────────────────
    ReapplyTriggered {
        descriptor_id: String,
        reason: ReapplyReason,
    },
    WatchStarted {
        descriptor_id: String,
        mode: WatchMode,
    },
    WatchStopped { descriptor_id: String },
    /// Aggressive polling hit its check limit and stopped. Informational.
    ReconciliationBoundExceeded { descriptor_id: String, checks: u32 },

    // ── Controller ────────────────────
    /// `apply_with_retry` gave up. Reported once per exhaustion.
    RetryExhausted {
        descriptor_id: String,
        attempts: u32,
        last_error: String,
    },
    EnabledChanged { descriptor_id: String, enabled: bool },
}

impl EngineEvent {
    pub fn descriptor_id(&self) -> &str {
        match self {
            EngineEvent::FetchSucceeded { descriptor_id, .. }
            | EngineEvent::FetchFailed { descriptor_id, .. }
            | EngineEvent::Applied { descriptor_id, .. }
            | EngineEvent::ApplyFailed { descriptor_id, .. }
            | EngineEvent::Removed { descriptor_id }
            | EngineEvent::ReapplyTriggered { descriptor_id, .. }
            | EngineEvent::WatchStarted { descriptor_id, .. }
            | EngineEvent::WatchStopped { descriptor_id }
            | EngineEvent::ReconciliationBoundExceeded { descriptor_id, .. }
            | EngineEvent::RetryExhausted { descriptor_id, .. }
            | EngineEvent::EnabledChanged { descriptor_id, .. } => descriptor_id,
        }
    }
}

/// Broadcast channel for engine events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::Applied {
            descriptor_id: "claude".to_string(),
            technique: Technique::ObjectUrlLink,
            from_cache: true,
            weak: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Applied\""));
        assert!(json.contains("object_url_link"));

        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            EngineEvent::Applied { descriptor_id, technique, .. } => {
                assert_eq!(descriptor_id, "claude");
                assert_eq!(technique, Technique::ObjectUrlLink);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_event_bus_emit_no_subscribers() {
        let bus = EventBus::new(16);
        bus.emit(EngineEvent::Removed {
            descriptor_id: "x".to_string(),
        });
    }

    #[test]
    fn test_event_bus_subscribe_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::ReconciliationBoundExceeded {
            descriptor_id: "grok".to_string(),
            checks: 50,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.descriptor_id(), "grok");
        assert!(matches!(
            event,
            EngineEvent::ReconciliationBoundExceeded { checks: 50, .. }
        ));
    }
}
