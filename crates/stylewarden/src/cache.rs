//! Payload cache with TTL and provenance checks.
//!
//! One entry per descriptor, stored as JSON under `css_cache_<id>` in the
//! shared key-value store. Anything that fails to decode is a miss.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::store::KeyValueStore;
use crate::types::{CacheEntry, ResourceDescriptor, StoreError};

/// Key prefix for cache entries.
pub const CACHE_KEY_PREFIX: &str = "css_cache_";

#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn key(descriptor_id: &str) -> String {
        format!("{CACHE_KEY_PREFIX}{descriptor_id}")
    }

    /// Fresh entry for `descriptor`, if any.
    pub fn get(&self, descriptor: &ResourceDescriptor) -> Option<CacheEntry> {
        self.get_at(descriptor, Utc::now())
    }

    /// Like [`get`](Self::get) with an explicit clock.
    pub fn get_at(&self, descriptor: &ResourceDescriptor, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = self.read(descriptor)?;

        if !descriptor.has_source(&entry.source_url) {
            tracing::debug!(
                "Cache entry for {} came from {}, which is no longer a source",
                descriptor.id,
                entry.source_url
            );
            return None;
        }

        if entry.is_expired_at(descriptor.cache_ttl, now) {
            tracing::debug!("Cache entry for {} expired", descriptor.id);
            return None;
        }

        Some(entry)
    }

    /// Store a freshly fetched payload, replacing any previous entry.
    pub fn put(
        &self,
        descriptor: &ResourceDescriptor,
        payload: &str,
        source_url: &Url,
    ) -> Result<CacheEntry, StoreError> {
        let entry = CacheEntry {
            payload: payload.to_string(),
            fetched_at: Utc::now(),
            source_url: source_url.clone(),
            descriptor_id: descriptor.id.clone(),
        };
        self.store
            .set(&Self::key(&descriptor.id), serde_json::to_string(&entry)?)?;
        tracing::debug!(
            "Cached {} bytes for {} from {}",
            payload.len(),
            descriptor.id,
            source_url
        );
        Ok(entry)
    }

    pub fn invalidate(&self, descriptor: &ResourceDescriptor) -> Result<bool, StoreError> {
        self.store.remove(&Self::key(&descriptor.id))
    }

    /// Remove every cache entry, returning how many were dropped.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in self.store.keys() {
            if key.starts_with(CACHE_KEY_PREFIX) && self.store.remove(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Age of the stored entry regardless of freshness.
    pub fn age(&self, descriptor: &ResourceDescriptor) -> Option<Duration> {
        self.read(descriptor).map(|e| e.age_at(Utc::now()))
    }

    /// Stored entry without TTL or source checks.
    pub fn peek(&self, descriptor: &ResourceDescriptor) -> Option<CacheEntry> {
        self.read(descriptor)
    }

    fn read(&self, descriptor: &ResourceDescriptor) -> Option<CacheEntry> {
        let raw = self.store.get(&Self::key(&descriptor.id))?;
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Corrupt cache entry for {}: {e}", descriptor.id);
                return None;
            }
        };
        if entry.descriptor_id != descriptor.id {
            tracing::debug!(
                "Cache entry under {} belongs to {}",
                descriptor.id,
                entry.descriptor_id
            );
            return None;
        }
        Some(entry)
    }
}
