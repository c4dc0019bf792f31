//! Routing behaviour against in-process providers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conduit_core::{ConduitError, ConduitResult, ContentRequest, ContentType};
use conduit_mcp::{McpToolDef, McpToolResult};
use conduit_router::{ContentRouter, ProviderPolicy, RouterConfig, ToolProvider};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

enum Reply {
    Text(&'static str),
    ToolError(&'static str),
    Fail,
}

struct MockProvider {
    name: &'static str,
    priority: i32,
    connected: AtomicBool,
    tools: Vec<McpToolDef>,
    reply: Reply,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockProvider {
    fn new(name: &'static str, priority: i32, tools: Value, reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            name,
            priority,
            connected: AtomicBool::new(true),
            tools: serde_json::from_value(tools).unwrap(),
            reply,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ToolProvider for MockProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn tools(&self) -> Vec<McpToolDef> {
        self.tools.clone()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        _timeout: Option<Duration>,
    ) -> ConduitResult<McpToolResult> {
        self.calls.lock().push((name.to_string(), arguments));
        match self.reply {
            Reply::Text(text) => Ok(serde_json::from_value(
                json!({"content": [{"type": "text", "text": text}]}),
            )
            .unwrap()),
            Reply::ToolError(text) => Ok(serde_json::from_value(
                json!({"content": [{"type": "text", "text": text}], "isError": true}),
            )
            .unwrap()),
            Reply::Fail => Err(ConduitError::connection(self.name, "upstream unavailable")),
        }
    }
}

fn image_tool() -> Value {
    json!([{
        "name": "generate_image",
        "description": "Draws a picture",
        "inputSchema": {"type": "object", "properties": {"prompt": {}, "format": {}, "width": {}}}
    }])
}

fn image_request() -> ContentRequest {
    ContentRequest::new(ContentType::Image, "a lighthouse at dusk")
}

#[tokio::test(start_paused = true)]
async fn test_results_are_cached_within_ttl() {
    let router = ContentRouter::new(RouterConfig::default());
    let provider = MockProvider::new("art", 0, image_tool(), Reply::Text("img"));
    router
        .add_provider(provider.clone(), ProviderPolicy::default())
        .unwrap();

    let first = router.generate_content(&image_request()).await.unwrap();
    assert!(!first.metadata.cached);
    assert_eq!(first.content, "img");

    tokio::time::advance(Duration::from_secs(120)).await;
    let second = router.generate_content(&image_request()).await.unwrap();
    assert!(second.metadata.cached);
    assert_eq!(second.content, "img");
    assert_eq!(provider.call_count(), 1);

    tokio::time::advance(Duration::from_secs(181)).await;
    let third = router.generate_content(&image_request()).await.unwrap();
    assert!(!third.metadata.cached);
    assert_eq!(provider.call_count(), 2);

    let stats = router.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_category_bonus_wins_and_placeholder_on_failure() {
    let router = ContentRouter::default();
    // Explicit category: 50 + 10 + 20 = 80. Keyword match only: 50 + 10 = 60.
    let explicit = MockProvider::new("explicit", 10, image_tool(), Reply::Fail);
    let heuristic = MockProvider::new("heuristic", 10, image_tool(), Reply::Text("img"));
    router
        .add_provider(
            explicit.clone(),
            ProviderPolicy::for_categories([ContentType::Image]).with_placeholder_fallback(),
        )
        .unwrap();
    router
        .add_provider(heuristic.clone(), ProviderPolicy::default())
        .unwrap();

    let result = router.generate_content(&image_request()).await.unwrap();
    assert!(result.metadata.placeholder);
    assert_eq!(result.metadata.provider, "explicit");
    assert_eq!(result.metadata.quality_score, 0.0);
    assert!(result.content.contains("a lighthouse at dusk"));
    assert_eq!(explicit.call_count(), 1);
    assert_eq!(heuristic.call_count(), 0);

    // Placeholders are not cached.
    assert_eq!(router.cache_stats().entries, 0);
}

#[tokio::test]
async fn test_failure_falls_through_to_next_candidate() {
    let router = ContentRouter::default();
    let first = MockProvider::new("first", 20, image_tool(), Reply::Fail);
    let second = MockProvider::new("second", 0, image_tool(), Reply::Text("img"));
    router.add_provider(first.clone(), ProviderPolicy::default()).unwrap();
    router.add_provider(second.clone(), ProviderPolicy::default()).unwrap();

    let result = router.generate_content(&image_request()).await.unwrap();
    assert_eq!(result.metadata.provider, "second");
    assert_eq!(first.call_count(), 1);

    let metrics = router.provider_metrics();
    assert_eq!(metrics["first"].failures, 1);
    assert_eq!(metrics["second"].successes, 1);
}

#[tokio::test]
async fn test_last_error_propagates_when_all_fail() {
    let router = ContentRouter::default();
    let only = MockProvider::new("only", 0, image_tool(), Reply::Fail);
    router.add_provider(only, ProviderPolicy::default()).unwrap();

    let err = router.generate_content(&image_request()).await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
async fn test_tool_error_counts_as_failure() {
    let router = ContentRouter::default();
    let broken = MockProvider::new("broken", 5, image_tool(), Reply::ToolError("quota exceeded"));
    let backup = MockProvider::new("backup", 0, image_tool(), Reply::Text("img"));
    router.add_provider(broken, ProviderPolicy::default()).unwrap();
    router.add_provider(backup, ProviderPolicy::default()).unwrap();

    let result = router.generate_content(&image_request()).await.unwrap();
    assert_eq!(result.metadata.provider, "backup");
    assert_eq!(router.provider_metrics()["broken"].failures, 1);
}

#[tokio::test]
async fn test_no_suitable_provider() {
    let router = ContentRouter::default();
    let files = MockProvider::new(
        "files",
        0,
        json!([{"name": "list_dir", "description": "Lists a directory"}]),
        Reply::Text("x"),
    );
    router.add_provider(files.clone(), ProviderPolicy::default()).unwrap();

    let err = router
        .generate_content(&ContentRequest::new(ContentType::Video, "a clip"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConduitError::NoProvider { ref content_type } if content_type == "video"));
    assert_eq!(files.call_count(), 0);
}

#[tokio::test]
async fn test_disconnected_providers_are_skipped() {
    let router = ContentRouter::default();
    let offline = MockProvider::new("offline", 50, image_tool(), Reply::Text("stale"));
    offline.connected.store(false, Ordering::SeqCst);
    let online = MockProvider::new("online", 0, image_tool(), Reply::Text("fresh"));
    router.add_provider(offline.clone(), ProviderPolicy::default()).unwrap();
    router.add_provider(online, ProviderPolicy::default()).unwrap();

    let result = router.generate_content(&image_request()).await.unwrap();
    assert_eq!(result.content, "fresh");
    assert_eq!(offline.call_count(), 0);

    let providers = router.get_available_providers();
    assert_eq!(providers.len(), 2);
    assert!(!providers[0].connected);
    assert_eq!(providers[1].success_rate, Some(1.0));
}

#[tokio::test]
async fn test_arguments_are_mapped_from_request() {
    let router = ContentRouter::default();
    let provider = MockProvider::new("art", 0, image_tool(), Reply::Text("img"));
    router.add_provider(provider.clone(), ProviderPolicy::default()).unwrap();

    let request = image_request()
        .with_constraint("width", json!(1024))
        .with_parameter("seed", json!(7));
    router.generate_content(&request).await.unwrap();

    let calls = provider.calls.lock();
    let (tool, args) = &calls[0];
    assert_eq!(tool, "generate_image");
    assert_eq!(
        args,
        &json!({"prompt": "a lighthouse at dusk", "format": "image", "width": 1024, "seed": 7})
    );
}

#[tokio::test]
async fn test_provider_registry() {
    let router = ContentRouter::default();
    let art = MockProvider::new("art", 0, image_tool(), Reply::Text("img"));
    router.add_provider(art.clone(), ProviderPolicy::default()).unwrap();
    let err = router
        .add_provider(art, ProviderPolicy::default())
        .unwrap_err();
    assert!(matches!(err, ConduitError::Config(_)));

    router.generate_content(&image_request()).await.unwrap();
    router.clear_cache();
    assert_eq!(router.cache_stats().entries, 0);

    assert!(router.remove_provider("art"));
    assert!(!router.remove_provider("art"));
    assert!(router.get_available_providers().is_empty());
}
