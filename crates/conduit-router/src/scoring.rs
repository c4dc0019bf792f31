//! Tool suitability and candidate scoring.

use crate::provider::ProviderPolicy;
use conduit_core::ContentType;
use conduit_mcp::McpToolDef;

const BASE_SCORE: f64 = 50.0;
const CATEGORY_BONUS: f64 = 20.0;
const SUCCESS_WEIGHT: f64 = 30.0;
const SLOW_PENALTY: f64 = 10.0;
const SLOW_THRESHOLD_MS: f64 = 10_000.0;
const EXAMPLES_BONUS: f64 = 5.0;

/// Keywords that mark a tool as able to produce a content type.
pub fn synonyms(content_type: ContentType) -> &'static [&'static str] {
    match content_type {
        ContentType::Text => &[
            "text", "write", "generate", "compose", "summar", "story", "article", "explain",
            "chat", "complet", "language",
        ],
        ContentType::Image => &[
            "image", "picture", "photo", "draw", "illustrat", "paint", "render", "visual",
            "diagram",
        ],
        ContentType::Video => &["video", "animat", "clip", "movie", "film"],
        ContentType::Audio => &["audio", "speech", "voice", "tts", "sound", "music", "narrat"],
        ContentType::Data => &[
            "data", "json", "csv", "table", "dataset", "chart", "analy", "quiz",
        ],
    }
}

/// How a tool qualified for a content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suitability {
    /// The provider lists the content type in its categories.
    Explicit,
    /// Name or description matched a synonym.
    Heuristic,
}

/// Whether `tool` can serve `content_type`. A non-empty category list is
/// authoritative; otherwise name and description are matched against the
/// synonym table.
pub fn suitability(
    tool: &McpToolDef,
    content_type: ContentType,
    policy: &ProviderPolicy,
) -> Option<Suitability> {
    if !policy.categories.is_empty() {
        return policy
            .categories
            .contains(&content_type)
            .then_some(Suitability::Explicit);
    }

    let name = tool.name.to_lowercase();
    let description = tool.description.to_lowercase();
    synonyms(content_type)
        .iter()
        .any(|kw| name.contains(kw) || description.contains(kw))
        .then_some(Suitability::Heuristic)
}

/// What the router remembers about one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct History {
    pub success_ratio: Option<f64>,
    pub avg_latency_ms: Option<f64>,
}

/// Additive candidate score; higher is tried first.
pub fn score(
    priority: i32,
    suitability: Suitability,
    history: History,
    has_examples: bool,
) -> f64 {
    let mut score = BASE_SCORE + f64::from(priority);
    if suitability == Suitability::Explicit {
        score += CATEGORY_BONUS;
    }
    score += SUCCESS_WEIGHT * history.success_ratio.unwrap_or(0.0);
    if history.avg_latency_ms.is_some_and(|ms| ms > SLOW_THRESHOLD_MS) {
        score -= SLOW_PENALTY;
    }
    if has_examples {
        score += EXAMPLES_BONUS;
    }
    score
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> McpToolDef {
        serde_json::from_value(json!({"name": name, "description": description})).unwrap()
    }

    #[test]
    fn test_heuristic_matches_name_or_description() {
        let policy = ProviderPolicy::default();
        assert_eq!(
            suitability(&tool("generate_image", ""), ContentType::Image, &policy),
            Some(Suitability::Heuristic)
        );
        assert_eq!(
            suitability(&tool("run", "Converts text to speech"), ContentType::Audio, &policy),
            Some(Suitability::Heuristic)
        );
        assert_eq!(suitability(&tool("list_files", "Lists a directory"), ContentType::Video, &policy), None);
    }

    #[test]
    fn test_categories_are_authoritative() {
        let policy = ProviderPolicy::for_categories([ContentType::Data]);
        assert_eq!(
            suitability(&tool("anything", ""), ContentType::Data, &policy),
            Some(Suitability::Explicit)
        );
        // Matching keywords do not override the allow-list.
        assert_eq!(suitability(&tool("generate_image", ""), ContentType::Image, &policy), None);
    }

    #[test]
    fn test_score_components() {
        assert_eq!(score(0, Suitability::Heuristic, History::default(), false), 50.0);
        assert_eq!(score(10, Suitability::Explicit, History::default(), false), 80.0);
        assert_eq!(score(10, Suitability::Heuristic, History::default(), false), 60.0);

        let history = History {
            success_ratio: Some(0.5),
            avg_latency_ms: Some(12_000.0),
        };
        assert_eq!(score(0, Suitability::Heuristic, history, true), 50.0 + 15.0 - 10.0 + 5.0);
    }

    #[test]
    fn test_no_history_contributes_nothing() {
        let fresh = score(0, Suitability::Heuristic, History::default(), false);
        let failing = score(
            0,
            Suitability::Heuristic,
            History {
                success_ratio: Some(0.0),
                avg_latency_ms: None,
            },
            false,
        );
        assert_eq!(fresh, failing);
    }
}
