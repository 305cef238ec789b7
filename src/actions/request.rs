//! Action requests produced by the generator

use serde_json::{Map, Value};

/// Kind of moderation-style action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Timeout,
    Ban,
    Nickname,
    Dm,
    VoiceJoin,
    ImageSearch,
}

impl ActionKind {
    /// Parse from the generator's type name (several spellings accepted)
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('_', "-").as_str() {
            "timeout" | "mute" => Some(Self::Timeout),
            "ban" => Some(Self::Ban),
            "nickname" | "nick" | "rename" => Some(Self::Nickname),
            "dm" | "direct-message" => Some(Self::Dm),
            "voice-join" | "vcjoin" | "vc-join" | "voice" => Some(Self::VoiceJoin),
            "image-search" | "image" | "images" => Some(Self::ImageSearch),
            _ => None,
        }
    }

    /// Canonical name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Ban => "ban",
            Self::Nickname => "nickname",
            Self::Dm => "dm",
            Self::VoiceJoin => "voice-join",
            Self::ImageSearch => "image-search",
        }
    }

    /// Whether the action is aimed at a user
    #[must_use]
    pub const fn is_targeted(self) -> bool {
        matches!(self, Self::Timeout | Self::Ban | Self::Nickname | Self::Dm)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionParams {
    Timeout { minutes: i64 },
    Ban,
    Nickname { nickname: String },
    Dm { message: String },
    VoiceJoin,
    ImageSearch { query: String, count: u32 },
}

/// One action the generator asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub kind: ActionKind,
    /// Target as the generator wrote it (name, mention or id)
    pub target: Option<String>,
    pub params: ActionParams,
    pub reason: Option<String>,
}

impl ActionRequest {
    /// Parse the structured form `{"type": ..., "target": ..., ...params}`
    ///
    /// # Errors
    ///
    /// Returns a description of what is missing or malformed
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "action is not an object".to_string())?;
        let raw_kind = str_param(obj, &["type", "action", "kind"])
            .ok_or_else(|| "action has no type".to_string())?;
        let kind =
            ActionKind::parse(&raw_kind).ok_or_else(|| format!("unknown action type {raw_kind:?}"))?;

        let target = str_param(obj, &["target", "user", "username"]);
        let reason = str_param(obj, &["reason"]);

        let params = match kind {
            ActionKind::Timeout => {
                let minutes = int_param(obj, &["minutes", "duration", "duration_minutes"])
                    .ok_or_else(|| "timeout needs minutes".to_string())?;
                ActionParams::Timeout { minutes }
            }
            ActionKind::Ban => ActionParams::Ban,
            ActionKind::Nickname => ActionParams::Nickname {
                nickname: str_param(obj, &["nickname", "new_nickname", "name"])
                    .ok_or_else(|| "nickname needs a new name".to_string())?,
            },
            ActionKind::Dm => ActionParams::Dm {
                message: str_param(obj, &["message", "content", "text"])
                    .ok_or_else(|| "dm needs a message".to_string())?,
            },
            ActionKind::VoiceJoin => ActionParams::VoiceJoin,
            ActionKind::ImageSearch => ActionParams::ImageSearch {
                query: str_param(obj, &["query", "search"])
                    .or_else(|| target.clone())
                    .ok_or_else(|| "image search needs a query".to_string())?,
                count: int_param(obj, &["count"])
                    .and_then(|c| u32::try_from(c).ok())
                    .unwrap_or(1),
            },
        };

        Ok(Self {
            kind,
            target: if kind.is_targeted() { target } else { None },
            params,
            reason,
        })
    }

    /// Parse the legacy single-string form, e.g. `timeout "some user" 5`
    ///
    /// `none` and empty strings yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns a description of what is missing or malformed
    pub fn from_legacy(raw: &str) -> Result<Option<Self>, String> {
        let parts = shell_words::split(raw)
            .unwrap_or_else(|_| raw.split_whitespace().map(ToString::to_string).collect());
        let Some((head, args)) = parts.split_first() else {
            return Ok(None);
        };
        if head.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        let kind = ActionKind::parse(head).ok_or_else(|| format!("unknown action {head:?}"))?;

        let arg = |i: usize, what: &str| {
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{kind} needs {what}"))
        };

        let (target, params) = match kind {
            ActionKind::Timeout => {
                let target = arg(0, "a target")?;
                let minutes = arg(1, "minutes")?
                    .parse::<i64>()
                    .map_err(|_| "timeout minutes must be a whole number".to_string())?;
                (Some(target), ActionParams::Timeout { minutes })
            }
            ActionKind::Ban => (Some(arg(0, "a target")?), ActionParams::Ban),
            ActionKind::Nickname => (
                Some(arg(0, "a target")?),
                ActionParams::Nickname {
                    nickname: args.get(1..).unwrap_or_default().join(" "),
                },
            ),
            ActionKind::Dm => (
                Some(arg(0, "a target")?),
                ActionParams::Dm {
                    message: args.get(1..).unwrap_or_default().join(" "),
                },
            ),
            ActionKind::VoiceJoin => (None, ActionParams::VoiceJoin),
            ActionKind::ImageSearch => {
                let (query, count) = match args {
                    [] => return Err("image search needs a query".to_string()),
                    [query] => (query.clone(), 1),
                    [query, count, ..] => (query.clone(), count.parse::<u32>().unwrap_or(1)),
                };
                (None, ActionParams::ImageSearch { query, count })
            }
        };

        Ok(Some(Self {
            kind,
            target,
            params,
            reason: None,
        }))
    }
}

fn str_param(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[allow(clippy::cast_possible_truncation)]
fn int_param(obj: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_legacy_timeout() {
        let request = ActionRequest::from_legacy(r#"timeout "big bob" 5"#).unwrap().unwrap();
        assert_eq!(request.kind, ActionKind::Timeout);
        assert_eq!(request.target.as_deref(), Some("big bob"));
        assert_eq!(request.params, ActionParams::Timeout { minutes: 5 });
    }

    #[test]
    fn unbalanced_quotes_fall_back_to_whitespace() {
        let request = ActionRequest::from_legacy(r#"dm bob "hi there"#).unwrap().unwrap();
        assert_eq!(request.target.as_deref(), Some("bob"));
        assert_eq!(
            request.params,
            ActionParams::Dm {
                message: r#""hi there"#.to_string()
            }
        );

        let request = ActionRequest::from_legacy("nickname 'al' Tea Queen").unwrap().unwrap();
        assert_eq!(request.target.as_deref(), Some("al"));
    }

    #[test]
    fn legacy_none_is_no_action() {
        assert_eq!(ActionRequest::from_legacy("none").unwrap(), None);
        assert_eq!(ActionRequest::from_legacy("").unwrap(), None);
    }

    #[test]
    fn legacy_errors_are_reported() {
        assert!(ActionRequest::from_legacy("timeout bob soon").is_err());
        assert!(ActionRequest::from_legacy("explode bob").is_err());
        assert!(ActionRequest::from_legacy("ban").is_err());
    }

    #[test]
    fn parses_structured_actions() {
        let request = ActionRequest::from_json(&json!({
            "type": "nickname", "target": "alice", "nickname": "Tea Queen"
        }))
        .unwrap();
        assert_eq!(request.kind, ActionKind::Nickname);
        assert_eq!(
            request.params,
            ActionParams::Nickname {
                nickname: "Tea Queen".to_string()
            }
        );

        let request = ActionRequest::from_json(&json!({
            "type": "timeout", "target": "<@42>", "minutes": "15", "reason": "spam"
        }))
        .unwrap();
        assert_eq!(request.params, ActionParams::Timeout { minutes: 15 });
        assert_eq!(request.reason.as_deref(), Some("spam"));

        let request = ActionRequest::from_json(&json!({"type": "image_search", "query": "cats"})).unwrap();
        assert_eq!(request.kind, ActionKind::ImageSearch);
        assert!(request.target.is_none());
    }

    #[test]
    fn structured_errors_are_reported() {
        assert!(ActionRequest::from_json(&json!({"type": "timeout", "target": "bob"})).is_err());
        assert!(ActionRequest::from_json(&json!({"type": "launch"})).is_err());
        assert!(ActionRequest::from_json(&json!("ban bob")).is_err());
    }
}
