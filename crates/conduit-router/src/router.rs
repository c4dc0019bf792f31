//! Content router: picks the best tool across providers, calls it, caches
//! the result and falls back down the candidate list on failure.

use crate::cache::{cache_key, CacheStats, ResultCache};
use crate::mapping::map_arguments;
use crate::provider::{ProviderPolicy, ToolProvider};
use crate::quality::{extract, quality_score};
use crate::scoring::{score, suitability, History};
use chrono::{DateTime, Utc};
use conduit_core::{
    ConduitError, ConduitResult, ContentRequest, ContentResult, ContentType, ResultMetadata,
};
use conduit_mcp::{McpToolDef, McpToolResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// JSON-RPC server-error code used when a tool reports `isError`.
const TOOL_ERROR_CODE: i64 = -32000;

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_capacity() -> usize {
    100
}

/// Router settings, the `[router]` table of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How long a generated result is served from cache (default: 300).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Maximum cached results (default: 100).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Per-call deadline; the provider's own timeout applies when unset.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            call_timeout_ms: None,
        }
    }
}

/// Call history the router keeps per provider.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ProviderStats {
    /// Successes over all calls, or `None` before the first call.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        (total > 0).then(|| self.successes as f64 / total as f64)
    }

    fn history(&self) -> History {
        let calls = self.successes + self.failures;
        History {
            success_ratio: self.success_rate(),
            avg_latency_ms: (calls > 0).then_some(self.avg_latency_ms),
        }
    }

    fn record(&mut self, success: bool, latency_ms: f64) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let calls = (self.successes + self.failures) as f64;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / calls;
        self.last_used = Some(Utc::now());
    }
}

/// One entry of [`ContentRouter::get_available_providers`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub connected: bool,
    pub tool_count: usize,
    pub priority: i32,
    pub categories: Vec<ContentType>,
    /// `None` until the router has called the provider.
    pub success_rate: Option<f64>,
}

struct Registered {
    provider: Arc<dyn ToolProvider>,
    policy: ProviderPolicy,
}

#[derive(Clone)]
struct Candidate {
    provider: Arc<dyn ToolProvider>,
    policy: ProviderPolicy,
    tool: McpToolDef,
    score: f64,
    priority: i32,
}

/// Routes content requests to the best-scoring provider tool.
pub struct ContentRouter {
    config: RouterConfig,
    providers: RwLock<Vec<Registered>>,
    cache: Mutex<ResultCache>,
    stats: Mutex<HashMap<String, ProviderStats>>,
}

impl ContentRouter {
    /// Router with no providers and an empty cache.
    pub fn new(config: RouterConfig) -> Self {
        let cache = ResultCache::new(Duration::from_secs(config.cache_ttl_secs), config.cache_capacity);
        Self {
            config,
            providers: RwLock::new(Vec::new()),
            cache: Mutex::new(cache),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Register a provider. Names must be unique.
    pub fn add_provider(
        &self,
        provider: Arc<dyn ToolProvider>,
        policy: ProviderPolicy,
    ) -> ConduitResult<()> {
        let mut providers = self.providers.write();
        if providers.iter().any(|r| r.provider.name() == provider.name()) {
            return Err(ConduitError::Config(format!(
                "provider '{}' is already registered",
                provider.name()
            )));
        }
        info!(provider = %provider.name(), categories = ?policy.categories, "Provider registered");
        providers.push(Registered { provider, policy });
        Ok(())
    }

    /// Returns whether a provider by that name was registered.
    pub fn remove_provider(&self, name: &str) -> bool {
        let mut providers = self.providers.write();
        let before = providers.len();
        providers.retain(|r| r.provider.name() != name);
        let removed = providers.len() != before;
        if removed {
            info!(provider = %name, "Provider removed");
        }
        removed
    }

    /// Generate content for `request`, from cache when possible.
    pub async fn generate_content(&self, request: &ContentRequest) -> ConduitResult<ContentResult> {
        let key = cache_key(request)?;
        if let Some(mut hit) = self.cache.lock().get(&key) {
            debug!(content_type = %request.content_type, provider = %hit.metadata.provider, "Cache hit");
            hit.metadata.cached = true;
            return Ok(hit);
        }

        let candidates = self.candidates(request);
        if candidates.is_empty() {
            warn!(content_type = %request.content_type, "No suitable provider");
            return Err(ConduitError::NoProvider {
                content_type: request.content_type.to_string(),
            });
        }

        let timeout = self.config.call_timeout_ms.map(Duration::from_millis);
        let mut last_error = None;

        for candidate in candidates {
            let provider_name = candidate.provider.name().to_string();
            let arguments = map_arguments(request, &candidate.tool);
            debug!(
                provider = %provider_name,
                tool = %candidate.tool.name,
                score = candidate.score,
                "Trying candidate"
            );

            let started = Instant::now();
            let outcome = candidate
                .provider
                .call_tool(&candidate.tool.name, arguments, timeout)
                .await
                .and_then(|result| reject_tool_error(&provider_name, result));
            let latency = started.elapsed();
            let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);

            self.stats
                .lock()
                .entry(provider_name.clone())
                .or_default()
                .record(outcome.is_ok(), latency.as_secs_f64() * 1000.0);

            match outcome {
                Ok(result) => {
                    let content = build_result(&provider_name, &candidate.tool, &result, latency_ms);
                    info!(
                        provider = %provider_name,
                        tool = %candidate.tool.name,
                        latency_ms,
                        quality = content.metadata.quality_score,
                        "Content generated"
                    );
                    self.cache.lock().insert(key, content.clone());
                    return Ok(content);
                }
                Err(e) if candidate.policy.placeholder_fallback => {
                    warn!(provider = %provider_name, tool = %candidate.tool.name, error = %e, "Candidate failed, returning placeholder");
                    return Ok(placeholder(request, &provider_name, &candidate.tool, latency_ms));
                }
                Err(e) => {
                    warn!(provider = %provider_name, tool = %candidate.tool.name, error = %e, "Candidate failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConduitError::NoProvider {
            content_type: request.content_type.to_string(),
        }))
    }

    /// Suitable (provider, tool) pairs, best first. Ties keep priority, then
    /// registration order.
    fn candidates(&self, request: &ContentRequest) -> Vec<Candidate> {
        let stats = self.stats.lock().clone();
        let providers = self.providers.read();
        let mut candidates = Vec::new();

        for registered in providers.iter() {
            let provider = &registered.provider;
            if !provider.is_connected() {
                debug!(provider = %provider.name(), "Skipping disconnected provider");
                continue;
            }
            let history = stats
                .get(provider.name())
                .map(ProviderStats::history)
                .unwrap_or_default();
            let priority = provider.priority();

            for tool in provider.tools() {
                let Some(fit) = suitability(&tool, request.content_type, &registered.policy) else {
                    continue;
                };
                let score = score(priority, fit, history, tool.has_examples());
                candidates.push(Candidate {
                    provider: provider.clone(),
                    policy: registered.policy.clone(),
                    tool,
                    score,
                    priority,
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.priority.cmp(&a.priority))
        });
        candidates
    }

    /// Every registered provider, in registration order.
    pub fn get_available_providers(&self) -> Vec<ProviderInfo> {
        let stats = self.stats.lock();
        self.providers
            .read()
            .iter()
            .map(|r| ProviderInfo {
                name: r.provider.name().to_string(),
                connected: r.provider.is_connected(),
                tool_count: r.provider.tools().len(),
                priority: r.provider.priority(),
                categories: r.policy.categories.clone(),
                success_rate: stats.get(r.provider.name()).and_then(ProviderStats::success_rate),
            })
            .collect()
    }

    /// Call history per provider name.
    pub fn provider_metrics(&self) -> HashMap<String, ProviderStats> {
        self.stats.lock().clone()
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        debug!("Content cache cleared");
    }

    /// Cache occupancy and hit counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

fn reject_tool_error(provider: &str, result: McpToolResult) -> ConduitResult<McpToolResult> {
    if result.is_error {
        return Err(ConduitError::Protocol {
            server: provider.to_string(),
            code: TOOL_ERROR_CODE,
            message: result.text(),
            data: result.structured_content,
        });
    }
    Ok(result)
}

fn build_result(
    provider: &str,
    tool: &McpToolDef,
    result: &McpToolResult,
    latency_ms: u64,
) -> ContentResult {
    let extracted = extract(result);
    let quality = quality_score(&extracted, result, latency_ms);
    ContentResult {
        content: extracted.content,
        alternatives: extracted.alternatives,
        metadata: ResultMetadata {
            provider: provider.to_string(),
            tool: tool.name.clone(),
            latency_ms,
            quality_score: quality,
            cached: false,
            placeholder: false,
            generated_at: Utc::now(),
        },
    }
}

fn placeholder(
    request: &ContentRequest,
    provider: &str,
    tool: &McpToolDef,
    latency_ms: u64,
) -> ContentResult {
    ContentResult {
        content: format!(
            "[placeholder {}] {} is unavailable for: {}",
            request.content_type, tool.name, request.prompt
        ),
        alternatives: Vec::new(),
        metadata: ResultMetadata {
            provider: provider.to_string(),
            tool: tool.name.clone(),
            latency_ms,
            quality_score: 0.0,
            cached: false,
            placeholder: true,
            generated_at: Utc::now(),
        },
    }
}

impl Default for ContentRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_router_config_defaults() {
        let config: RouterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RouterConfig::default());
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.cache_capacity, 100);
    }

    #[test]
    fn test_provider_stats_history() {
        let mut stats = ProviderStats::default();
        assert_eq!(stats.history(), History::default());
        stats.record(true, 100.0);
        stats.record(false, 300.0);
        assert_eq!(stats.success_rate(), Some(0.5));
        assert_eq!(stats.history().avg_latency_ms, Some(200.0));
    }

    #[test]
    fn test_tool_error_becomes_failure() {
        let result: McpToolResult = serde_json::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "quota exceeded"}],
            "isError": true
        }))
        .unwrap();
        let err = reject_tool_error("p", result).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_empty_router_has_no_provider() {
        let router = ContentRouter::default();
        let err = router
            .generate_content(&ContentRequest::new(ContentType::Video, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::NoProvider { ref content_type } if content_type == "video"));
    }
}
