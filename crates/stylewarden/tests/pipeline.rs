//! Fetch pipeline over real HTTP, and file-backed persistence.

use std::sync::Arc;
use std::time::Duration;

use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stylewarden::{
    CacheStore, EngineConfig, FetchPipeline, FileStore, KeyValueStore, ResourceDescriptor,
    Settings,
};

const CSS_40: &str = "body { color: #123456; margin: 0 auto; }";

fn quick_config() -> EngineConfig {
    EngineConfig {
        fetch_timeout_ms: 300,
        relays: Vec::new(),
        ..Default::default()
    }
}

#[tokio::test]
async fn slow_first_source_falls_through_to_second() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.css"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(CSS_40)
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b.css"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CSS_40))
        .mount(&server)
        .await;

    let a = Url::parse(&format!("{}/a.css", server.uri())).unwrap();
    let b = Url::parse(&format!("{}/b.css", server.uri())).unwrap();
    let descriptor = ResourceDescriptor::new("site", vec![a.clone(), b.clone()], "#site-styles");

    let pipeline = FetchPipeline::standard(&quick_config(), None);
    let fetched = pipeline.fetch(&descriptor).await.unwrap();

    assert_eq!(fetched.payload.content, CSS_40);
    assert_eq!(fetched.payload.source_url, b);
    assert_eq!(fetched.strategy, "native");
    assert_eq!(fetched.attempts.len(), 2);
    assert_eq!(fetched.attempts[0].source, a);
    assert!(!fetched.attempts[0].is_success());
}

#[tokio::test]
async fn error_pages_fall_through_to_opaque_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string(CSS_40))
        .mount(&server)
        .await;

    let source = Url::parse(&format!("{}/theme.css", server.uri())).unwrap();
    let descriptor = ResourceDescriptor::new("site", vec![source], "#site-styles");

    let fetched = FetchPipeline::standard(&quick_config(), None)
        .fetch(&descriptor)
        .await
        .unwrap();
    assert_eq!(fetched.strategy, "opaque");
    assert_eq!(fetched.attempts.len(), 2);
    assert!(fetched.attempts[0]
        .failure_reason()
        .unwrap()
        .contains("HTTP 403"));
}

#[tokio::test]
async fn nothing_reachable_returns_every_reason() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("404: Not Found"))
        .mount(&server)
        .await;

    let source = Url::parse(&format!("{}/gone.css", server.uri())).unwrap();
    let descriptor = ResourceDescriptor::new("site", vec![source], "#site-styles");

    let err = FetchPipeline::standard(&quick_config(), None)
        .fetch(&descriptor)
        .await
        .unwrap_err();
    assert_eq!(err.attempts.len(), 2);
    let reasons = err.reasons();
    assert!(reasons[0].contains("HTTP 404"));
    assert!(reasons[1].contains("error page"));
}

#[test]
fn cache_and_settings_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let source = Url::parse("https://raw.example.com/site.css").unwrap();
    let descriptor = ResourceDescriptor::new("site", vec![source.clone()], "#site-styles");

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
        CacheStore::new(store.clone())
            .put(&descriptor, CSS_40, &source)
            .unwrap();
        Settings::new(store).set_enabled(&descriptor, false).unwrap();
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
    let entry = CacheStore::new(store.clone()).get(&descriptor).unwrap();
    assert_eq!(entry.payload, CSS_40);
    assert_eq!(entry.descriptor_id, "site");
    assert!(!Settings::new(store).is_enabled(&descriptor));

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let cached: serde_json::Value =
        serde_json::from_str(raw["css_cache_site"].as_str().unwrap()).unwrap();
    assert!(cached["fetchedAt"].is_i64());
    assert_eq!(cached["sourceURL"], "https://raw.example.com/site.css");
}
