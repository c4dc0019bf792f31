use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of content a caller asks the router to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Video,
    Audio,
    Data,
}

impl ContentType {
    /// Every content type, in declaration order.
    pub const ALL: [ContentType; 5] = [
        ContentType::Text,
        ContentType::Image,
        ContentType::Video,
        ContentType::Audio,
        ContentType::Data,
    ];

    /// Lowercase name used in config and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::Data => "data",
        }
    }

    /// Case-insensitive inverse of [`ContentType::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(ContentType::Text),
            "image" => Some(ContentType::Image),
            "video" => Some(ContentType::Video),
            "audio" => Some(ContentType::Audio),
            "data" => Some(ContentType::Data),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for generated content, routed to the best available tool.
///
/// Maps are ordered so that two equal requests always serialize to the same
/// bytes, which the router relies on for cache keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRequest {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraints: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ContentRequest {
    /// Request with no context, constraints or parameters.
    pub fn new(content_type: ContentType, prompt: impl Into<String>) -> Self {
        Self {
            content_type,
            prompt: prompt.into(),
            context: BTreeMap::new(),
            constraints: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a context field (topic, level, ...).
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Add a constraint matched against tool property names.
    pub fn with_constraint(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.constraints.insert(key.into(), value);
        self
    }

    /// Add a tool argument passed through unchanged.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Provenance and scoring information attached to every [`ContentResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub provider: String,
    pub tool: String,
    pub latency_ms: u64,
    /// Heuristic in `[0, 1]`; a UX proxy, not a correctness signal.
    pub quality_score: f64,
    pub cached: bool,
    /// Set when the result is a degraded stand-in for a failed call.
    #[serde(default)]
    pub placeholder: bool,
    pub generated_at: DateTime<Utc>,
}

/// Content produced for a [`ContentRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentResult {
    pub content: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub metadata: ResultMetadata,
}
