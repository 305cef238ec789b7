//! Generation collaborator
//!
//! The agent hands a persona prompt and rendered context to a [`Generator`]
//! and gets back a reply plus optional actions, memory notes and trait
//! observations. Parsing is lenient: the model's output is untrusted.

mod openai;
mod prompt;

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::ActionRequest;
use crate::error::GenerationError;

pub use openai::OpenAiGenerator;
pub use prompt::{RESPONSE_SCHEMA, system_prompt};

/// Input for one generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Persona text plus response instructions
    pub system_prompt: String,
    /// Rendered context package
    pub context: String,
}

/// A fact the model wants remembered
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryNote {
    pub content: String,
    pub importance: Option<f64>,
    /// `global`, `user` (the addressed user) or a user reference
    pub about: Option<String>,
}

/// Observed traits for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraitNote {
    /// User reference as the model wrote it
    pub user: String,
    pub traits: Vec<String>,
}

/// Parsed model output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResponse {
    pub message: String,
    pub actions: Vec<ActionRequest>,
    pub memories: Vec<MemoryNote>,
    pub traits: Vec<TraitNote>,
}

/// Produces replies
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a reply for `request`
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError`] if the backend fails or returns nothing usable
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError>;
}

/// Parse raw model output
///
/// Accepts bare JSON, JSON in a ```` ```json ```` fence, or JSON surrounded by
/// prose. Anything else becomes a plain message with no actions. Malformed
/// actions and notes are skipped individually.
#[must_use]
pub fn parse_response(raw: &str) -> GenerationResponse {
    let Some(Value::Object(obj)) = extract_json(raw) else {
        return GenerationResponse {
            message: strip_reasoning(raw).trim().to_string(),
            ..GenerationResponse::default()
        };
    };

    let message = ["message", "response", "reply"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string();

    let mut actions = Vec::new();
    if let Some(Value::Array(items)) = obj.get("actions") {
        for item in items {
            match ActionRequest::from_json(item) {
                Ok(request) => actions.push(request),
                Err(e) => tracing::warn!(error = %e, "skipping malformed action"),
            }
        }
    }
    match obj.get("action") {
        Some(Value::String(legacy)) => match ActionRequest::from_legacy(legacy) {
            Ok(Some(request)) => actions.push(request),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, action = %legacy, "skipping malformed action"),
        },
        Some(item @ Value::Object(_)) => match ActionRequest::from_json(item) {
            Ok(request) => actions.push(request),
            Err(e) => tracing::warn!(error = %e, "skipping malformed action"),
        },
        _ => {}
    }

    let memories = match obj.get("memories") {
        Some(Value::Array(items)) => items.iter().filter_map(memory_note).collect(),
        _ => Vec::new(),
    };

    let traits = match obj.get("traits") {
        Some(Value::Array(items)) => items.iter().filter_map(trait_note).collect(),
        _ => Vec::new(),
    };

    GenerationResponse {
        message,
        actions,
        memories,
        traits,
    }
}

fn memory_note(value: &Value) -> Option<MemoryNote> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(MemoryNote {
            content: s.trim().to_string(),
            importance: None,
            about: None,
        }),
        Value::Object(obj) => {
            let content = obj.get("content").and_then(Value::as_str)?.trim();
            if content.is_empty() {
                return None;
            }
            Some(MemoryNote {
                content: content.to_string(),
                importance: obj
                    .get("importance")
                    .and_then(Value::as_f64)
                    .filter(|i| i.is_finite())
                    .map(|i| i.clamp(0.0, 1.0)),
                about: obj
                    .get("about")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            })
        }
        _ => None,
    }
}

fn trait_note(value: &Value) -> Option<TraitNote> {
    let obj = value.as_object()?;
    let user = ["user_id", "user", "target"]
        .iter()
        .find_map(|k| match obj.get(*k) {
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())?;
    let traits: Vec<String> = match obj.get("traits") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };
    (!traits.is_empty()).then_some(TraitNote { user, traits })
}

/// Drop a leading `<think>...</think>` block some models emit
fn strip_reasoning(raw: &str) -> &str {
    raw.rfind("</think>").map_or(raw, |end| &raw[end + "</think>".len()..])
}

fn extract_json(raw: &str) -> Option<Value> {
    let cleaned = strip_reasoning(raw).trim();
    if let Ok(value) = serde_json::from_str(cleaned) {
        return Some(value);
    }

    if let Some(start) = cleaned.find("```json") {
        let after = &cleaned[start + "```json".len()..];
        if let Some(end) = after.find("```")
            && let Ok(value) = serde_json::from_str(after[..end].trim())
        {
            return Some(value);
        }
    }

    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionKind, ActionParams};

    #[test]
    fn parses_full_structured_reply() {
        let raw = r#"{
            "message": "hi alice!",
            "actions": [{"type": "timeout", "target": "bob", "minutes": 5}],
            "memories": [{"content": "alice likes tea", "importance": 0.7, "about": "user"}],
            "traits": [{"user_id": "1", "traits": ["likes tea", "night owl"]}]
        }"#;
        let response = parse_response(raw);
        assert_eq!(response.message, "hi alice!");
        assert_eq!(response.actions.len(), 1);
        assert_eq!(response.actions[0].params, ActionParams::Timeout { minutes: 5 });
        assert_eq!(response.memories[0].importance, Some(0.7));
        assert_eq!(response.memories[0].about.as_deref(), Some("user"));
        assert_eq!(response.traits[0].traits.len(), 2);
    }

    #[test]
    fn extracts_fenced_json() {
        let raw = "sure thing\n```json\n{\"message\": \"boop\", \"action\": \"ban \\\"big bob\\\"\"}\n```";
        let response = parse_response(raw);
        assert_eq!(response.message, "boop");
        assert_eq!(response.actions[0].kind, ActionKind::Ban);
        assert_eq!(response.actions[0].target.as_deref(), Some("big bob"));
    }

    #[test]
    fn extracts_json_from_prose() {
        let response = parse_response("Here you go: {\"message\": \"hello\", \"action\": \"none\"} cheers");
        assert_eq!(response.message, "hello");
        assert!(response.actions.is_empty());
    }

    #[test]
    fn plain_text_becomes_message() {
        let response = parse_response("<think>hmm</think> just saying hi");
        assert_eq!(response.message, "just saying hi");
        assert!(response.actions.is_empty());
        assert!(response.memories.is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = r#"{"message": "ok",
            "actions": [{"type": "explode"}, {"type": "dm", "target": "al", "message": "hi"}],
            "memories": ["plain note", {"importance": 0.3}, 7],
            "traits": [{"user_id": "2", "traits": []}, {"user": "3", "traits": "shy"}]}"#;
        let response = parse_response(raw);
        assert_eq!(response.actions.len(), 1);
        assert_eq!(response.actions[0].kind, ActionKind::Dm);
        assert_eq!(response.memories.len(), 1);
        assert_eq!(response.memories[0].content, "plain note");
        assert_eq!(response.traits.len(), 1);
        assert_eq!(response.traits[0].user, "3");
    }
}
