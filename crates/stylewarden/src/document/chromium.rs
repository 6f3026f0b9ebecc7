//! Live-page document over chromiumoxide.
//!
//! Every operation is a script evaluated in the page. Mutation notifications
//! come from an in-page `MutationObserver` that queues changes on `window`;
//! a background task drains that queue and forwards it to subscribers. The
//! observer reinstalls itself after navigation, at which point every node
//! this document had inserted is reported removed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

use super::{HostDocument, LinkLoad, Mutation, NodeInfo, NodeKind};
use crate::config::resolve_state_dir;
use crate::fetch::FetchStrategy;

/// Managed installs under `<state dir>/chromium`, relative to that directory.
const MANAGED_BINARIES: &[&str] = &[
    "chrome-linux64/chrome",
    "chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
    "chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
    "chrome",
];

const SYSTEM_BINARIES: &[&str] = &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"];

/// Locate a browser binary.
///
/// A configured path must exist. Otherwise: `STYLEWARDEN_CHROMIUM_PATH`, a
/// managed install in the state directory, then `PATH`.
pub fn find_chromium(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        bail!("configured chromium_path {} does not exist", path.display());
    }

    let from_env = std::env::var_os("STYLEWARDEN_CHROMIUM_PATH").map(PathBuf::from);
    let managed_root = resolve_state_dir(None).join("chromium");
    from_env
        .into_iter()
        .chain(MANAGED_BINARIES.iter().map(|rel| managed_root.join(rel)))
        .find(|path| path.exists())
        .or_else(|| SYSTEM_BINARIES.iter().find_map(|name| which::which(name).ok()))
        .context("Chromium not found. Install Chrome, set chromium_path in config.json, or set STYLEWARDEN_CHROMIUM_PATH.")
}

/// Launch Chromium and spawn its CDP handler loop.
pub async fn launch_browser(headless: bool, configured: Option<&Path>) -> Result<(Browser, JoinHandle<()>)> {
    let chrome_path = find_chromium(configured)?;
    tracing::debug!("Launching {}", chrome_path.display());

    let mut builder = BrowserConfig::builder()
        .chrome_executable(chrome_path)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions");
    if headless {
        builder = builder.arg("--headless=new");
    } else {
        builder = builder.with_head();
    }
    let config = builder
        .build()
        .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("failed to launch Chromium")?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            let _ = event;
        }
    });

    Ok((browser, handle))
}

async fn eval<T: DeserializeOwned>(page: &Page, script: String) -> Result<T> {
    let result = page
        .evaluate(script)
        .await
        .context("script evaluation failed")?;
    result
        .into_value()
        .map_err(|e| anyhow!("failed to convert script result: {e:?}"))
}

fn js(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

const CONTAINER: &str = "(document.head || document.documentElement)";

const INSTALL_OBSERVER: &str = r#"
    if (!window.__stylewardenObserver) {
        window.__stylewardenQueue = [];
        const record = (kind, nodes) => {
            for (const n of nodes) {
                if (n && n.id) window.__stylewardenQueue.push([kind, n.id]);
            }
        };
        const obs = new MutationObserver((records) => {
            for (const r of records) {
                record('added', r.addedNodes);
                record('removed', r.removedNodes);
            }
        });
        obs.observe(document.head || document.documentElement, { childList: true });
        window.__stylewardenObserver = obs;
        fresh = true;
    }
"#;

#[derive(Debug, Deserialize)]
struct Drained {
    fresh: bool,
    events: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    found: bool,
    #[serde(default)]
    kind: Option<NodeKind>,
    #[serde(default)]
    href: Option<String>,
    #[serde(default)]
    rules: Option<usize>,
}

impl RawNode {
    fn into_info(self, id: &str) -> Option<NodeInfo> {
        if !self.found {
            return None;
        }
        Some(NodeInfo {
            id: id.to_string(),
            kind: self.kind.unwrap_or(NodeKind::Style),
            href: self.href,
            rule_count: self.rules,
        })
    }
}

fn describe_node_script(id: &str, remove: bool) -> String {
    let removal = if remove { "el.remove();" } else { "" };
    format!(
        r#"(() => {{
            const el = document.getElementById({id});
            if (!el) return {{ found: false }};
            let rules = null;
            try {{
                if (el.sheet) rules = el.sheet.cssRules.length;
                else if (el.tagName === 'STYLE') rules = 0;
            }} catch (e) {{
                rules = null;
            }}
            const info = {{
                found: true,
                kind: el.tagName === 'LINK' ? 'link' : 'style',
                href: el.getAttribute('href'),
                rules,
            }};
            {removal}
            return info;
        }})()"#,
        id = js(id),
    )
}

/// Append a stylesheet link and resolve with its load outcome.
///
/// The link is left in no-CORS mode: a cross-origin sheet still applies, it
/// just reports no readable rules.
fn insert_link_script(id: &str, href: &str, wait: Duration) -> String {
    format!(
        r#"new Promise((resolve) => {{
            const l = document.createElement('link');
            l.id = {id};
            l.rel = 'stylesheet';
            l.type = 'text/css';
            let done = false;
            const finish = (r) => {{ if (!done) {{ done = true; resolve(r); }} }};
            l.onload = () => finish('loaded');
            l.onerror = () => finish('errored');
            setTimeout(() => finish('timed_out'), {ms});
            l.href = {href};
            {CONTAINER}.appendChild(l);
        }})"#,
        id = js(id),
        href = js(href),
        ms = wait.as_millis(),
    )
}

/// A [`HostDocument`] backed by a Chromium page.
pub struct ChromiumDocument {
    page: Page,
    owned: Arc<Mutex<HashSet<String>>>,
    mutations: broadcast::Sender<Mutation>,
    drain: JoinHandle<()>,
}

fn lock_owned(owned: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    owned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChromiumDocument {
    /// Attach to `page`, draining mutation notifications every `poll`.
    pub async fn attach(page: Page, poll: Duration) -> Result<Self> {
        let (mutations, _) = broadcast::channel(64);
        let owned = Arc::new(Mutex::new(HashSet::new()));

        eval::<bool>(
            &page,
            format!("(() => {{ let fresh = false; {INSTALL_OBSERVER} return true; }})()"),
        )
        .await
        .context("failed to install mutation observer")?;

        let drain = tokio::spawn(drain_loop(
            page.clone(),
            poll,
            mutations.clone(),
            owned.clone(),
        ));

        Ok(Self {
            page,
            owned,
            mutations,
            drain,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Current page URL.
    pub async fn url(&self) -> Result<Option<String>> {
        self.page.url().await.context("failed to get URL")
    }
}

impl Drop for ChromiumDocument {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

async fn drain_loop(
    page: Page,
    poll: Duration,
    mutations: broadcast::Sender<Mutation>,
    owned: Arc<Mutex<HashSet<String>>>,
) {
    let script = format!(
        r#"(() => {{
            let fresh = false;
            {INSTALL_OBSERVER}
            const events = window.__stylewardenQueue.splice(0);
            return {{ fresh, events }};
        }})()"#
    );
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let drained: Drained = match eval(&page, script.clone()).await {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!("Mutation drain failed: {e:#}");
                continue;
            }
        };

        if drained.fresh {
            let lost: Vec<String> = lock_owned(&owned).drain().collect();
            if !lost.is_empty() {
                tracing::debug!("Document context was replaced; {} nodes lost", lost.len());
            }
            for id in lost {
                let _ = mutations.send(Mutation::Removed(id));
            }
        }

        for (kind, id) in drained.events {
            let mutation = match kind.as_str() {
                "added" => Mutation::Added(id),
                _ => {
                    lock_owned(&owned).remove(&id);
                    Mutation::Removed(id)
                }
            };
            let _ = mutations.send(mutation);
        }
    }
}

#[async_trait]
impl HostDocument for ChromiumDocument {
    async fn find(&self, id: &str) -> Result<Option<NodeInfo>> {
        let raw: RawNode = eval(&self.page, describe_node_script(id, false)).await?;
        Ok(raw.into_info(id))
    }

    async fn insert_style(&self, id: &str, css: &str) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const s = document.createElement('style');
                s.id = {id};
                s.type = 'text/css';
                s.textContent = {css};
                {CONTAINER}.appendChild(s);
                return true;
            }})()"#,
            id = js(id),
            css = js(css),
        );
        eval::<bool>(&self.page, script).await?;
        lock_owned(&self.owned).insert(id.to_string());
        Ok(())
    }

    async fn insert_link(&self, id: &str, href: &str, wait: Duration) -> Result<LinkLoad> {
        let script = insert_link_script(id, href, wait);
        lock_owned(&self.owned).insert(id.to_string());
        let outcome = tokio::time::timeout(wait + Duration::from_secs(1), eval::<LinkLoad>(&self.page, script))
            .await
            .unwrap_or(Ok(LinkLoad::TimedOut))?;
        Ok(outcome)
    }

    async fn create_object_url(&self, css: &str) -> Result<String> {
        let script = format!(
            r#"(() => {{
                if (typeof URL === 'undefined' || !URL.createObjectURL) return '';
                return URL.createObjectURL(new Blob([{css}], {{ type: 'text/css' }}));
            }})()"#,
            css = js(css),
        );
        let url: String = eval(&self.page, script).await?;
        if url.is_empty() {
            bail!("object URLs are not supported in this page");
        }
        Ok(url)
    }

    async fn revoke_object_url(&self, url: &str) -> Result<()> {
        let script = format!(
            "(() => {{ try {{ URL.revokeObjectURL({url}); }} catch (e) {{}} return true; }})()",
            url = js(url),
        );
        eval::<bool>(&self.page, script).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Option<NodeInfo>> {
        let raw: RawNode = eval(&self.page, describe_node_script(id, true)).await?;
        lock_owned(&self.owned).remove(id);
        Ok(raw.into_info(id))
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let script = format!(
            "(() => {{ try {{ return document.querySelector({sel}) !== null; }} catch (e) {{ return false; }} }})()",
            sel = js(selector),
        );
        eval(&self.page, script).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Mutation> {
        self.mutations.subscribe()
    }
}

/// In-page request strategy: `fetch()` from the page's own origin.
#[derive(Clone)]
pub struct PageFetch {
    page: Page,
}

impl PageFetch {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

#[async_trait]
impl FetchStrategy for PageFetch {
    fn name(&self) -> &str {
        "page"
    }

    async fn fetch(&self, source: &Url) -> Result<String> {
        let script = format!(
            r#"fetch({url}, {{ cache: 'no-cache' }}).then((r) => {{
                if (!r.ok) throw new Error('HTTP ' + r.status);
                return r.text();
            }})"#,
            url = js(source.as_str()),
        );
        eval(&self.page, script).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_chromium_path() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("chrome");
        std::fs::write(&binary, "").unwrap();
        assert_eq!(find_chromium(Some(&binary)).unwrap(), binary);

        let missing = dir.path().join("nope");
        let err = find_chromium(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_link_is_not_forced_into_cors_mode() {
        let script = insert_link_script("site-styles", "https://cdn.test/site.css", Duration::from_millis(2000));
        assert!(!script.contains("crossOrigin"));
        assert!(script.contains(r#"l.href = "https://cdn.test/site.css";"#));
        assert!(script.contains("2000"));
    }

    #[test]
    fn test_js_literal_escaping() {
        assert_eq!(js("plain"), "\"plain\"");
        assert_eq!(js("a\"b</style>\n"), "\"a\\\"b</style>\\n\"");
    }

    #[test]
    fn test_raw_node_conversion() {
        let missing: RawNode = serde_json::from_str(r#"{"found": false}"#).unwrap();
        assert!(missing.into_info("x").is_none());

        let link: RawNode = serde_json::from_str(
            r#"{"found": true, "kind": "link", "href": "blob:https://a.test/1", "rules": null}"#,
        )
        .unwrap();
        let info = link.into_info("x").unwrap();
        assert_eq!(info.kind, NodeKind::Link);
        assert!(info.is_live());
        assert_eq!(info.object_url(), Some("blob:https://a.test/1"));
    }

    #[test]
    fn test_describe_script_embeds_escaped_id() {
        let script = describe_node_script("my\"id", true);
        assert!(script.contains(r#"getElementById("my\"id")"#));
        assert!(script.contains("el.remove();"));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_apply_and_observe_removal() {
        let (browser, _handler) = launch_browser(true, None).await.expect("launch failed");
        let page = browser
            .new_page("data:text/html,<html><head></head><body><main>hi</main></body></html>")
            .await
            .expect("failed to open page");

        let doc = ChromiumDocument::attach(page, Duration::from_millis(50))
            .await
            .expect("attach failed");
        let mut rx = doc.subscribe();

        doc.insert_style("sw-test", "main { color: red; }").await.unwrap();
        let node = doc.find("sw-test").await.unwrap().unwrap();
        assert_eq!(node.rule_count, Some(1));
        assert!(doc.exists("main").await.unwrap());

        doc.page()
            .evaluate("document.getElementById('sw-test').remove()")
            .await
            .unwrap();

        let mut saw_removal = false;
        for _ in 0..40 {
            if let Ok(Ok(Mutation::Removed(id))) =
                tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
            {
                if id == "sw-test" {
                    saw_removal = true;
                    break;
                }
            }
        }
        assert!(saw_removal);
    }
}
