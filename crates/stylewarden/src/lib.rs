//! Stylewarden: keep a remote stylesheet applied to a document that keeps trying to drop it.

pub mod apply;
pub mod cache;
pub mod config;
pub mod context;
pub mod controller;
pub mod document;
pub mod events;
pub mod fetch;
pub mod registry;
pub mod settings;
pub mod store;
pub mod types;
pub mod watch;

pub use apply::{ApplyEngine, ApplyOutcome, ApplyStrategy, Presence};
pub use cache::CacheStore;
pub use config::EngineConfig;
pub use context::{ApplyClaim, EngineContext};
pub use controller::{EngineBuilder, EngineController};
pub use document::{HostDocument, MemoryDocument};
pub use events::{EngineEvent, EventBus, ReapplyReason};
pub use fetch::{FetchPipeline, FetchStrategy, FetchedPayload};
pub use registry::SiteRegistry;
pub use settings::Settings;
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use types::*;
pub use watch::{ReconciliationLoop, Trigger};
