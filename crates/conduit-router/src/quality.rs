//! Turning a tool result into content, and scoring it.

use conduit_mcp::McpToolResult;

/// Latency tiers: (upper bound in ms, score).
const LATENCY_TIERS: &[(u64, f64)] = &[(1_000, 0.5), (5_000, 0.4), (15_000, 0.25)];
const SLOWEST_TIER: f64 = 0.1;

const ALTERNATIVES_BONUS: f64 = 0.2;
const MULTI_ITEM_BONUS: f64 = 0.15;
const METADATA_BONUS: f64 = 0.15;

/// Content items pulled out of a tool result: the primary one first.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub content: String,
    pub alternatives: Vec<String>,
    /// Number of content blocks in the raw result.
    pub items: usize,
}

/// Text blocks are used as is; binary blocks become data URIs; embedded
/// resources contribute their text or URI. Structured output is the last
/// resort when there are no usable blocks.
pub fn extract(result: &McpToolResult) -> Extracted {
    let mut items: Vec<String> = result
        .content
        .iter()
        .filter_map(|block| match block.content_type.as_str() {
            "image" | "audio" => block.data.as_ref().map(|data| {
                let mime = block
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| format!("{}/*", block.content_type));
                format!("data:{mime};base64,{data}")
            }),
            "resource" => block.resource.as_ref().and_then(|r| {
                r.get("text")
                    .or_else(|| r.get("uri"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            }),
            _ => (!block.text.is_empty()).then(|| block.text.clone()),
        })
        .collect();

    if items.is_empty() {
        if let Some(structured) = &result.structured_content {
            items.push(structured.to_string());
        }
    }

    let count = result.content.len();
    let mut iter = items.into_iter();
    Extracted {
        content: iter.next().unwrap_or_default(),
        alternatives: iter.collect(),
        items: count,
    }
}

/// Faster calls score higher; see `LATENCY_TIERS`.
pub fn latency_score(latency_ms: u64) -> f64 {
    LATENCY_TIERS
        .iter()
        .find(|(bound, _)| latency_ms < *bound)
        .map_or(SLOWEST_TIER, |(_, score)| *score)
}

/// Heuristic in `[0, 1]` combining speed and richness.
pub fn quality_score(extracted: &Extracted, result: &McpToolResult, latency_ms: u64) -> f64 {
    let mut score = latency_score(latency_ms);
    if !extracted.alternatives.is_empty() {
        score += ALTERNATIVES_BONUS;
    }
    if extracted.items > 1 {
        score += MULTI_ITEM_BONUS;
    }
    if result
        .structured_content
        .as_ref()
        .is_some_and(|v| v.as_object().is_some_and(|o| !o.is_empty()))
    {
        score += METADATA_BONUS;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(value: serde_json::Value) -> McpToolResult {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_latency_tiers() {
        assert_eq!(latency_score(200), 0.5);
        assert_eq!(latency_score(1_000), 0.4);
        assert_eq!(latency_score(9_000), 0.25);
        assert_eq!(latency_score(60_000), 0.1);
    }

    #[test]
    fn test_extract_images_as_data_uris() {
        let r = result(json!({"content": [
            {"type": "image", "data": "AAAA", "mimeType": "image/png"},
            {"type": "text", "text": "caption"}
        ]}));
        let extracted = extract(&r);
        assert_eq!(extracted.content, "data:image/png;base64,AAAA");
        assert_eq!(extracted.alternatives, vec!["caption".to_string()]);
        assert_eq!(extracted.items, 2);
    }

    #[test]
    fn test_extract_falls_back_to_structured_content() {
        let r = result(json!({"content": [], "structuredContent": {"rows": 3}}));
        assert_eq!(extract(&r).content, r#"{"rows":3}"#);
    }

    #[test]
    fn test_rich_results_score_higher() {
        let plain = result(json!({"content": [{"type": "text", "text": "a"}]}));
        let rich = result(json!({
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "structuredContent": {"model": "x"}
        }));
        let plain_score = quality_score(&extract(&plain), &plain, 100);
        let rich_score = quality_score(&extract(&rich), &rich, 100);
        assert_eq!(plain_score, 0.5);
        assert!(rich_score > plain_score);
        assert!(rich_score <= 1.0);
    }
}
