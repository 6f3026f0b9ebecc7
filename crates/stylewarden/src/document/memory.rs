//! In-process document head.
//!
//! Holds artifact nodes, an object-URL table and a mutation broadcast. Knobs
//! let tests reproduce hostile pages: CSP-blocked inline styles, failing
//! links, missing object-URL support, scripts that delete nodes.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{HostDocument, LinkLoad, Mutation, NodeInfo, NodeKind};

#[derive(Debug, Clone)]
struct Node {
    id: String,
    kind: NodeKind,
    href: Option<String>,
    rule_count: Option<usize>,
}

impl Node {
    fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            kind: self.kind,
            href: self.href.clone(),
            rule_count: self.rule_count,
        }
    }
}

#[derive(Debug)]
struct DocState {
    nodes: Vec<Node>,
    object_urls: HashMap<String, String>,
    next_object_url: u64,
    selectors: HashSet<String>,
    block_inline_styles: bool,
    object_urls_supported: bool,
    link_outcome: LinkLoad,
    external_rule_count: Option<usize>,
    inserts: usize,
}

impl Default for DocState {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            object_urls: HashMap::new(),
            next_object_url: 1,
            selectors: HashSet::new(),
            block_inline_styles: false,
            object_urls_supported: true,
            link_outcome: LinkLoad::Loaded,
            external_rule_count: None,
            inserts: 0,
        }
    }
}

pub struct MemoryDocument {
    state: Mutex<DocState>,
    mutations: broadcast::Sender<Mutation>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    pub fn new() -> Self {
        let (mutations, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(DocState::default()),
            mutations,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, mutation: Mutation) {
        let _ = self.mutations.send(mutation);
    }

    /// Inline styles get inserted but their sheet stays empty, as under a strict CSP.
    pub fn block_inline_styles(&self, blocked: bool) {
        self.lock().block_inline_styles = blocked;
    }

    pub fn set_object_urls_supported(&self, supported: bool) {
        self.lock().object_urls_supported = supported;
    }

    /// Outcome reported by every subsequent link load.
    pub fn set_link_outcome(&self, outcome: LinkLoad) {
        self.lock().link_outcome = outcome;
    }

    /// Rule count reported for loaded external links (`None` = cross-origin).
    pub fn set_external_rule_count(&self, count: Option<usize>) {
        self.lock().external_rule_count = count;
    }

    /// Make `selector` match an element.
    pub fn add_selector(&self, selector: &str) {
        self.lock().selectors.insert(selector.to_string());
    }

    /// Remove a node the way a page script would: no object URL cleanup.
    pub fn external_remove(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            match state.nodes.iter().position(|n| n.id == id) {
                Some(pos) => {
                    state.nodes.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.notify(Mutation::Removed(id.to_string()));
        }
        removed
    }

    /// Drop every node, as when a SPA rebuilds its head.
    pub fn clear_head(&self) {
        let removed: Vec<String> = {
            let mut state = self.lock();
            state.nodes.drain(..).map(|n| n.id).collect()
        };
        for id in removed {
            self.notify(Mutation::Removed(id));
        }
    }

    /// Number of nodes carrying `id`.
    pub fn count(&self, id: &str) -> usize {
        self.lock().nodes.iter().filter(|n| n.id == id).count()
    }

    /// Object URLs created and not yet revoked.
    pub fn live_object_urls(&self) -> usize {
        self.lock().object_urls.len()
    }

    /// Total nodes ever inserted.
    pub fn insert_count(&self) -> usize {
        self.lock().inserts
    }

    fn push(&self, node: Node) {
        let id = node.id.clone();
        {
            let mut state = self.lock();
            state.nodes.push(node);
            state.inserts += 1;
        }
        self.notify(Mutation::Added(id));
    }
}

#[async_trait]
impl HostDocument for MemoryDocument {
    async fn find(&self, id: &str) -> Result<Option<NodeInfo>> {
        Ok(self.lock().nodes.iter().find(|n| n.id == id).map(Node::info))
    }

    async fn insert_style(&self, id: &str, css: &str) -> Result<()> {
        let blocked = self.lock().block_inline_styles;
        let rule_count = if blocked { 0 } else { count_rules(css) };
        self.push(Node {
            id: id.to_string(),
            kind: NodeKind::Style,
            href: None,
            rule_count: Some(rule_count),
        });
        Ok(())
    }

    async fn insert_link(&self, id: &str, href: &str, wait: Duration) -> Result<LinkLoad> {
        let (outcome, rule_count) = {
            let state = self.lock();
            if href.starts_with("blob:") {
                match state.object_urls.get(href) {
                    Some(css) if state.link_outcome == LinkLoad::Loaded => {
                        (LinkLoad::Loaded, Some(count_rules(css)))
                    }
                    Some(_) => (state.link_outcome, Some(0)),
                    None => (LinkLoad::Errored, Some(0)),
                }
            } else if state.link_outcome == LinkLoad::Loaded {
                (LinkLoad::Loaded, state.external_rule_count)
            } else {
                (state.link_outcome, Some(0))
            }
        };

        self.push(Node {
            id: id.to_string(),
            kind: NodeKind::Link,
            href: Some(href.to_string()),
            rule_count,
        });

        if outcome == LinkLoad::TimedOut {
            tokio::time::sleep(wait).await;
        }
        Ok(outcome)
    }

    async fn create_object_url(&self, css: &str) -> Result<String> {
        let mut state = self.lock();
        if !state.object_urls_supported {
            bail!("object URLs are not supported in this document");
        }
        let url = format!("blob:memory/{}", state.next_object_url);
        state.next_object_url += 1;
        state.object_urls.insert(url.clone(), css.to_string());
        Ok(url)
    }

    async fn revoke_object_url(&self, url: &str) -> Result<()> {
        self.lock().object_urls.remove(url);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Option<NodeInfo>> {
        let removed = {
            let mut state = self.lock();
            state
                .nodes
                .iter()
                .position(|n| n.id == id)
                .map(|pos| state.nodes.remove(pos))
        };
        if removed.is_some() {
            self.notify(Mutation::Removed(id.to_string()));
        }
        Ok(removed.map(|n| n.info()))
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let state = self.lock();
        if let Some(id) = selector.strip_prefix('#') {
            if state.nodes.iter().any(|n| n.id == id) {
                return Ok(true);
            }
        }
        Ok(state.selectors.contains(selector))
    }

    fn subscribe(&self) -> broadcast::Receiver<Mutation> {
        self.mutations.subscribe()
    }
}

/// Count top-level rule blocks in `css`, skipping comments.
pub fn count_rules(css: &str) -> usize {
    let bytes = css.as_bytes();
    let mut depth = 0usize;
    let mut rules = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 1;
            }
            b'{' => {
                if depth == 0 {
                    rules += 1;
                }
                depth += 1;
            }
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    rules
}
