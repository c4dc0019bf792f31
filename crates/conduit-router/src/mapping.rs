//! Maps a content request onto a tool's declared input schema.

use conduit_core::ContentRequest;
use conduit_mcp::McpToolDef;
use serde_json::{Map, Value};

const PROMPT_FIELDS: &[&str] = &["prompt", "text", "content", "query", "input"];
const TYPE_FIELDS: &[&str] = &["type", "format", "contenttype", "content_type"];
const CONTEXT_FIELDS: &[&str] = &["context", "topic", "level"];

/// Builds the `arguments` object for a `tools/call`.
///
/// Schema properties are filled from the request by name; a schema without
/// properties gets the prompt alone. Explicit `parameters` are applied last
/// and win over anything inferred.
pub fn map_arguments(request: &ContentRequest, tool: &McpToolDef) -> Value {
    let mut args = Map::new();
    let properties = tool.property_names();

    if properties.is_empty() {
        args.insert("prompt".into(), Value::String(request.prompt.clone()));
    }

    for property in properties {
        let key = property.to_lowercase();
        let value = if PROMPT_FIELDS.contains(&key.as_str()) {
            Some(Value::String(request.prompt.clone()))
        } else if TYPE_FIELDS.contains(&key.as_str()) {
            Some(Value::String(request.content_type.as_str().to_string()))
        } else if CONTEXT_FIELDS.contains(&key.as_str()) {
            context_value(request, property)
        } else {
            None
        };
        if let Some(value) = value {
            args.insert(property.to_string(), value);
        }
        if let Some(constraint) = request.constraints.get(property) {
            args.insert(property.to_string(), constraint.clone());
        }
    }

    for (key, value) in &request.parameters {
        args.insert(key.clone(), value.clone());
    }

    Value::Object(args)
}

/// A context field of the same name, or the whole context for `context`.
fn context_value(request: &ContentRequest, property: &str) -> Option<Value> {
    if let Some(value) = request.context.get(property) {
        return Some(value.clone());
    }
    if property.eq_ignore_ascii_case("context") && !request.context.is_empty() {
        let whole: Map<String, Value> = request
            .context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        return Some(Value::Object(whole));
    }
    None
}
