//! Bounded TTL cache of generated content.

use conduit_core::{ConduitResult, ContentRequest, ContentResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// SHA-256 of the request's canonical JSON.
pub fn cache_key(request: &ContentRequest) -> ConduitResult<String> {
    let bytes = serde_json::to_vec(request)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

struct CacheEntry {
    result: ContentResult,
    inserted_at: Instant,
}

/// Cache occupancy and hit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Inserting past `capacity` evicts the oldest insertion.
pub struct ResultCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    ttl: Duration,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl ResultCache {
    /// Empty cache; a zero capacity disables caching.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Returns a live entry. Expired entries are purged first.
    pub fn get(&mut self, key: &str) -> Option<ContentResult> {
        self.purge_expired();
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.result.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or refresh `key`, evicting the oldest entry when full.
    pub fn insert(&mut self, key: String, result: ContentResult) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| k != &key);
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Entries currently held, expired ones included until the next lookup.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Occupancy and hit counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            ttl_secs: self.ttl.as_secs(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Insertion order is also expiry order, so expired keys sit at the front.
    fn purge_expired(&mut self) {
        while let Some(key) = self.order.front() {
            let expired = self
                .entries
                .get(key)
                .map_or(true, |e| e.inserted_at.elapsed() >= self.ttl);
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conduit_core::{ContentType, ResultMetadata};

    fn result(content: &str) -> ContentResult {
        ContentResult {
            content: content.to_string(),
            alternatives: vec![],
            metadata: ResultMetadata {
                provider: "p".into(),
                tool: "t".into(),
                latency_ms: 1,
                quality_score: 0.5,
                cached: false,
                placeholder: false,
                generated_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_cache_key_is_stable_and_request_sensitive() {
        let a = ContentRequest::new(ContentType::Text, "hello");
        let b = ContentRequest::new(ContentType::Text, "hello");
        let c = ContentRequest::new(ContentType::Text, "hello").with_parameter("n", 2.into());
        assert_eq!(cache_key(&a).unwrap(), cache_key(&b).unwrap());
        assert_ne!(cache_key(&a).unwrap(), cache_key(&c).unwrap());
        assert_eq!(cache_key(&a).unwrap().len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let mut cache = ResultCache::new(Duration::from_secs(300), 100);
        cache.insert("k".into(), result("v"));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get("k").is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_inserting_past_capacity_evicts_oldest() {
        let mut cache = ResultCache::new(Duration::from_secs(300), 100);
        for i in 0..100 {
            cache.insert(format!("k{i}"), result("v"));
        }
        assert_eq!(cache.len(), 100);

        cache.insert("k100".into(), result("v"));
        assert_eq!(cache.len(), 100);
        assert!(cache.get("k0").is_none());
        assert!(cache.get("k1").is_some());
        assert!(cache.get("k100").is_some());
    }

    #[tokio::test]
    async fn test_reinsert_refreshes_position() {
        let mut cache = ResultCache::new(Duration::from_secs(300), 2);
        cache.insert("a".into(), result("1"));
        cache.insert("b".into(), result("2"));
        cache.insert("a".into(), result("3"));
        cache.insert("c".into(), result("4"));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().content, "3");
    }

    #[tokio::test]
    async fn test_clear() {
        let mut cache = ResultCache::new(Duration::from_secs(300), 10);
        cache.insert("a".into(), result("1"));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
