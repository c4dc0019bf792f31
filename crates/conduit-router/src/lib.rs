//! Content routing across MCP tool providers.
//!
//! A [`ContentRouter`] scores every tool of every connected provider for the
//! requested content type, calls the best one with arguments mapped from the
//! request, and falls through to the next candidate when a call fails.
//! Results are cached by request for a bounded time.

/// Result cache.
pub mod cache;
/// Request to tool-argument mapping.
pub mod mapping;
/// Provider trait and policy.
pub mod provider;
/// Result extraction and quality scoring.
pub mod quality;
/// The router.
pub mod router;
/// Suitability and candidate scoring.
pub mod scoring;

pub use cache::{cache_key, CacheStats, ResultCache};
pub use mapping::map_arguments;
pub use provider::{ProviderPolicy, ToolProvider};
pub use router::{ContentRouter, ProviderInfo, ProviderStats, RouterConfig};
pub use scoring::{score, suitability, History, Suitability};
