//! Persisted per-descriptor enabled flag.

use std::sync::Arc;

use crate::store::KeyValueStore;
use crate::types::{ResourceDescriptor, StoreError};

/// Key prefix for the enabled flag.
pub const ENABLED_KEY_PREFIX: &str = "enabled_";

#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn KeyValueStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn key(descriptor_id: &str) -> String {
        format!("{ENABLED_KEY_PREFIX}{descriptor_id}")
    }

    /// Stored flag, or the descriptor default when absent or unparseable.
    pub fn is_enabled(&self, descriptor: &ResourceDescriptor) -> bool {
        let Some(raw) = self.store.get(&Self::key(&descriptor.id)) else {
            return descriptor.enabled_by_default;
        };
        match serde_json::from_str::<bool>(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Ignoring corrupt enabled flag for {}: {e}", descriptor.id);
                descriptor.enabled_by_default
            }
        }
    }

    pub fn set_enabled(&self, descriptor: &ResourceDescriptor, enabled: bool) -> Result<(), StoreError> {
        self.store
            .set(&Self::key(&descriptor.id), serde_json::to_string(&enabled)?)
    }

    /// Forget the stored flag so the descriptor default applies again.
    pub fn reset(&self, descriptor: &ResourceDescriptor) -> Result<bool, StoreError> {
        self.store.remove(&Self::key(&descriptor.id))
    }
}
