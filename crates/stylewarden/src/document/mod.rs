//! Host document abstraction.
//!
//! The engine writes to exactly one node in a document it does not own. The
//! [`HostDocument`] trait is the boundary: an in-process implementation for
//! tests and dry runs, and a Chromium implementation driving a live page.

pub mod chromium;
pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use chromium::ChromiumDocument;
pub use memory::MemoryDocument;

/// What kind of node carries the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Style,
    Link,
}

/// Observed state of a node in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub kind: NodeKind,
    /// `href` for link nodes.
    pub href: Option<String>,
    /// Parsed rule count, or `None` when the sheet cannot be inspected
    /// (cross-origin, still loading).
    pub rule_count: Option<usize>,
}

impl NodeInfo {
    /// Present with rules, or present and uninspectable.
    pub fn is_live(&self) -> bool {
        self.rule_count != Some(0)
    }

    /// The object URL this node references, if any.
    pub fn object_url(&self) -> Option<&str> {
        self.href.as_deref().filter(|h| h.starts_with("blob:"))
    }
}

/// How a link load attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkLoad {
    Loaded,
    Errored,
    TimedOut,
}

/// A structural change to the artifact container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Mutation {
    Added(String),
    Removed(String),
}

/// The live document the engine applies into.
#[async_trait]
pub trait HostDocument: Send + Sync {
    /// Find the node with element id `id`.
    async fn find(&self, id: &str) -> Result<Option<NodeInfo>>;

    /// Append a `<style>` node with `css` as its text.
    async fn insert_style(&self, id: &str, css: &str) -> Result<()>;

    /// Append a stylesheet `<link>` and wait up to `wait` for load or error.
    async fn insert_link(&self, id: &str, href: &str, wait: Duration) -> Result<LinkLoad>;

    /// Create an object URL holding `css`.
    async fn create_object_url(&self, css: &str) -> Result<String>;

    async fn revoke_object_url(&self, url: &str) -> Result<()>;

    /// Remove the node with id `id`, returning what was removed.
    async fn remove(&self, id: &str) -> Result<Option<NodeInfo>>;

    /// Whether any element matches the CSS `selector`.
    async fn exists(&self, selector: &str) -> Result<bool>;

    /// Structural mutations of the artifact container.
    fn subscribe(&self) -> broadcast::Receiver<Mutation>;
}

/// Poll until `selector` exists or `timeout` elapses. Returns whether it appeared.
pub async fn wait_for_selector(
    doc: &dyn HostDocument,
    selector: &str,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match doc.exists(selector).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => tracing::debug!("Selector check for {selector} failed: {e:#}"),
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}
