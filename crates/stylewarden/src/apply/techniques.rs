//! Injection techniques, from most to least reliable.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{ApplyStrategy, Injected};
use crate::document::{HostDocument, LinkLoad};
use crate::types::{Payload, Technique};

/// `<style>` node with the payload as text.
pub struct InlineStyle;

#[async_trait]
impl ApplyStrategy for InlineStyle {
    fn technique(&self) -> Technique {
        Technique::InlineStyle
    }

    async fn inject(&self, doc: &dyn HostDocument, id: &str, payload: &Payload) -> Result<Injected> {
        doc.insert_style(id, &payload.content).await?;
        Ok(Injected::default())
    }
}

/// `<link>` pointing at an object URL that holds the payload.
pub struct ObjectUrlLink {
    pub load_timeout: Duration,
}

#[async_trait]
impl ApplyStrategy for ObjectUrlLink {
    fn technique(&self) -> Technique {
        Technique::ObjectUrlLink
    }

    async fn inject(&self, doc: &dyn HostDocument, id: &str, payload: &Payload) -> Result<Injected> {
        let url = doc.create_object_url(&payload.content).await?;
        match doc.insert_link(id, &url, self.load_timeout).await {
            Ok(LinkLoad::Loaded) => Ok(Injected {
                object_url: Some(url),
            }),
            outcome => {
                let _ = doc.remove(id).await;
                let _ = doc.revoke_object_url(&url).await;
                match outcome {
                    Ok(load) => bail!("object URL link did not load ({load:?})"),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// `<link>` pointing at the payload's source URL.
pub struct ExternalLink {
    pub load_timeout: Duration,
}

#[async_trait]
impl ApplyStrategy for ExternalLink {
    fn technique(&self) -> Technique {
        Technique::ExternalLink
    }

    async fn inject(&self, doc: &dyn HostDocument, id: &str, payload: &Payload) -> Result<Injected> {
        match doc
            .insert_link(id, payload.source_url.as_str(), self.load_timeout)
            .await
        {
            Ok(LinkLoad::Loaded) => Ok(Injected::default()),
            outcome => {
                let _ = doc.remove(id).await;
                match outcome {
                    Ok(load) => bail!("external link to {} did not load ({load:?})", payload.source_url),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use url::Url;

    fn payload() -> Payload {
        Payload::new("a{} b{}", Url::parse("https://cdn.test/s.css").unwrap())
    }

    #[tokio::test]
    async fn test_object_url_link_cleans_up_on_error() {
        let doc = MemoryDocument::new();
        doc.set_link_outcome(LinkLoad::Errored);
        let technique = ObjectUrlLink {
            load_timeout: Duration::from_secs(2),
        };

        let err = technique.inject(&doc, "x", &payload()).await.unwrap_err();
        assert!(err.to_string().contains("Errored"));
        assert_eq!(doc.count("x"), 0);
        assert_eq!(doc.live_object_urls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_link_timeout_removes_node() {
        let doc = MemoryDocument::new();
        doc.set_link_outcome(LinkLoad::TimedOut);
        let technique = ExternalLink {
            load_timeout: Duration::from_secs(2),
        };

        assert!(technique.inject(&doc, "x", &payload()).await.is_err());
        assert_eq!(doc.count("x"), 0);
    }

    #[tokio::test]
    async fn test_object_url_link_reports_url() {
        let doc = MemoryDocument::new();
        let technique = ObjectUrlLink {
            load_timeout: Duration::from_secs(2),
        };
        let injected = technique.inject(&doc, "x", &payload()).await.unwrap();
        assert!(injected.object_url.unwrap().starts_with("blob:"));
        assert_eq!(doc.count("x"), 1);
    }
}
