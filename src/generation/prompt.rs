//! System prompt assembly

use crate::config::{CharacterConfig, SafetyConfig};

/// Response format the model is asked to follow
pub const RESPONSE_SCHEMA: &str = r#"Respond with a single JSON object:
{
  "message": "your reply, in character",
  "actions": [{"type": "<action>", "target": "<user name or id>", "...": "parameters"}],
  "memories": [{"content": "a fact worth remembering, first person", "importance": 0.5, "about": "global | user | <user id>"}],
  "traits": [{"user_id": "<user id>", "traits": ["short observation"]}]
}
Use an empty list when there is nothing to add. Only include memories and
traits that are genuinely new."#;

/// Build the system prompt for a turn
///
/// Only actions the safety settings allow are advertised to the model.
#[must_use]
pub fn system_prompt(character: &CharacterConfig, safety: &SafetyConfig) -> String {
    let mut actions = Vec::new();
    if safety.enable_timeouts {
        actions.push(format!(
            "- timeout: {{\"type\": \"timeout\", \"target\": ..., \"minutes\": 1-{}}}",
            safety.max_timeout_minutes
        ));
    }
    if safety.enable_bans {
        actions.push("- ban: {\"type\": \"ban\", \"target\": ..., \"reason\": ...}".to_string());
    }
    if safety.enable_nicknames {
        actions.push(
            "- nickname: {\"type\": \"nickname\", \"target\": ..., \"nickname\": ...}".to_string(),
        );
    }
    actions.push("- dm: {\"type\": \"dm\", \"target\": ..., \"message\": ...}".to_string());

    format!(
        "{persona}\n\nYour name is {name}. You are chatting in a Discord server.\n\n\
         Available actions (use sparingly, only when it fits the conversation):\n{actions}\n\n\
         {schema}",
        persona = character.persona_prompt,
        name = character.name,
        actions = actions.join("\n"),
        schema = RESPONSE_SCHEMA,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character() -> CharacterConfig {
        CharacterConfig {
            name: "Scribble".to_string(),
            persona_prompt: "You are a cat.".to_string(),
            fallback_message: "oops".to_string(),
        }
    }

    #[test]
    fn advertises_only_enabled_actions() {
        let prompt = system_prompt(&character(), &SafetyConfig::default());
        assert!(prompt.starts_with("You are a cat."));
        assert!(prompt.contains("\"minutes\": 1-60"));
        assert!(!prompt.contains("- ban:"));
        assert!(prompt.contains("\"message\": \"your reply, in character\""));
    }
}
