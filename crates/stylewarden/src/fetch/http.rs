//! HTTP fetch strategies built on reqwest.
//!
//! Native requests retry on 5xx and back off on 429; relays wrap the source
//! URL in a tunnel template; the opaque fetch ignores status entirely.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use url::Url;

use super::FetchStrategy;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/131.0.0.0 Safari/537.36";

fn build_client(timeout_ms: u64, http1_only: bool) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent(USER_AGENT);
    if http1_only {
        builder = builder.http1_only();
    }
    builder.build().unwrap_or_default()
}

/// GET with retry on 5xx / transport errors and backoff on 429.
async fn get_with_retry(client: &reqwest::Client, url: &str, max_retries: u32) -> Result<String> {
    let mut retries = 0u32;

    loop {
        match client.get(url).send().await {
            Ok(r) => {
                let status = r.status().as_u16();

                if status >= 500 && retries < max_retries {
                    retries += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(retries - 1));
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if status == 429 && retries < max_retries {
                    retries += 1;
                    let retry_after = r
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(2);
                    tokio::time::sleep(Duration::from_secs(retry_after.min(10))).await;
                    continue;
                }

                if !r.status().is_success() {
                    bail!("HTTP {status}");
                }

                return r.text().await.context("reading response body");
            }
            Err(e) => {
                if retries < max_retries {
                    retries += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(retries - 1));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(e.into());
            }
        }
    }
}

/// Privileged direct request, not subject to page CORS.
#[derive(Clone)]
pub struct NativeHttp {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for hosts that reject HTTP/2.
    h1_client: reqwest::Client,
    max_retries: u32,
}

impl NativeHttp {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: build_client(timeout_ms, false),
            h1_client: build_client(timeout_ms, true),
            max_retries: 2,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl FetchStrategy for NativeHttp {
    fn name(&self) -> &str {
        "native"
    }

    async fn fetch(&self, source: &Url) -> Result<String> {
        match get_with_retry(&self.client, source.as_str(), self.max_retries).await {
            Ok(body) => Ok(body),
            Err(e) => {
                let err_str = format!("{e:#}");
                if err_str.contains("http2")
                    || err_str.contains("protocol")
                    || err_str.contains("connection closed")
                {
                    get_with_retry(&self.h1_client, source.as_str(), self.max_retries).await
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Request tunnelled through a public relay.
#[derive(Clone)]
pub struct RelayHttp {
    name: String,
    template: String,
    client: reqwest::Client,
}

impl RelayHttp {
    /// `template` must contain `{url}`, replaced by the percent-encoded source.
    pub fn new(template: &str, timeout_ms: u64) -> Self {
        let host = Url::parse(&template.replace("{url}", ""))
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            name: format!("relay:{host}"),
            template: template.to_string(),
            client: build_client(timeout_ms, false),
        }
    }

    pub fn relay_url(&self, source: &Url) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(source.as_str().as_bytes()).collect();
        self.template.replace("{url}", &encoded)
    }
}

#[async_trait]
impl FetchStrategy for RelayHttp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, source: &Url) -> Result<String> {
        let url = self.relay_url(source);
        get_with_retry(&self.client, &url, 0)
            .await
            .with_context(|| format!("via {}", self.name))
    }
}

/// Fire-and-hope request: HTTP/1.1, no retries, status ignored.
#[derive(Clone)]
pub struct OpaqueFetch {
    client: reqwest::Client,
}

impl OpaqueFetch {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: build_client(timeout_ms, true),
        }
    }
}

#[async_trait]
impl FetchStrategy for OpaqueFetch {
    fn name(&self) -> &str {
        "opaque"
    }

    async fn fetch(&self, source: &Url) -> Result<String> {
        let r = self.client.get(source.as_str()).send().await?;
        r.text().await.context("reading opaque body")
    }
}
