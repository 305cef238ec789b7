//! Settings file loading
//!
//! Supports `~/.config/scribble/config.toml` (or an explicit path) as the
//! settings document. All fields are optional; the file is a partial overlay
//! on top of defaults. Unknown keys are ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level settings file schema
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFile {
    /// Character identity and persona text
    #[serde(default)]
    pub character: CharacterFileConfig,

    /// Engagement rules (mentions, wake word, random replies)
    #[serde(default)]
    pub engagement: EngagementFileConfig,

    /// Action safety limits
    #[serde(default)]
    pub safety: SafetyFileConfig,

    /// Memory store limits
    #[serde(default)]
    pub memory: MemoryFileConfig,

    /// Dossier store limits
    #[serde(default)]
    pub dossier: DossierFileConfig,

    /// Context package budget
    #[serde(default)]
    pub context: ContextFileConfig,

    /// Generation backend
    #[serde(default)]
    pub generation: GenerationFileConfig,

    /// Discord connection
    #[serde(default)]
    pub discord: DiscordFileConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingFileConfig,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct CharacterFileConfig {
    /// Name the agent answers to (e.g. "Scribble")
    pub name: Option<String>,
    /// Inline persona/system prompt
    pub persona: Option<String>,
    /// File holding the persona prompt (takes precedence over `persona`)
    pub persona_path: Option<String>,
    /// In-character reply used when a turn fails
    pub fallback_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EngagementFileConfig {
    pub activation_threshold: Option<f64>,
    pub wake_word: Option<String>,
    pub enable_wake_word_mode: Option<bool>,
    pub conversation_timeout_minutes: Option<i64>,
    pub random_response_chance: Option<f64>,
    pub message_history_count: Option<usize>,
    pub command_cooldown_seconds: Option<u64>,
    pub command_prefix: Option<String>,
    /// Channel ids or names where the agent never engages
    pub blacklisted_channels: Option<Vec<String>>,
    /// Blacklist file, one channel per line, `#` comments
    pub blacklist_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SafetyFileConfig {
    pub admin_user_ids: Option<Vec<String>>,
    pub protected_user_ids: Option<Vec<String>>,
    pub max_actions_per_hour: Option<u32>,
    /// "requester" or "global"
    pub action_rate_scope: Option<String>,
    pub max_timeout_minutes: Option<i64>,
    pub clamp_timeouts: Option<bool>,
    pub enable_bans: Option<bool>,
    pub enable_timeouts: Option<bool>,
    pub enable_nicknames: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MemoryFileConfig {
    pub max_entries_per_scope: Option<usize>,
    pub merge_threshold: Option<f64>,
    pub max_context_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DossierFileConfig {
    pub max_traits: Option<usize>,
    pub trait_merge_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextFileConfig {
    /// Character ceiling for the assembled context
    pub max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerationFileConfig {
    /// OpenAI-compatible base URL (e.g. `https://api.openai.com/v1`)
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscordFileConfig {
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingFileConfig {
    /// Default tracing filter (e.g. "info", "scribble=debug")
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PathsFileConfig {
    /// Directory holding `memories.json` and `dossier.json`
    pub data_dir: Option<String>,
}

impl SettingsFile {
    /// Parse a settings document; `.json` paths are read as JSON, anything
    /// else as TOML
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid for its format
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(content).map_err(|e| {
                Error::Config(format!("failed to parse {}: {e}", path.display()))
            })
        } else {
            toml::from_str(content).map_err(|e| {
                Error::Config(format!("failed to parse {}: {e}", path.display()))
            })
        }
    }
}

/// Load the settings file
///
/// An explicitly requested file must exist and parse. The default location is
/// optional: a missing file yields `SettingsFile::default()`.
///
/// # Errors
///
/// Returns error if an explicit file is missing or any file fails to parse
pub fn load_settings_file(explicit: Option<&Path>) -> Result<SettingsFile> {
    let (path, required) = match explicit {
        Some(p) => (p.to_path_buf(), true),
        None => match settings_file_path() {
            Some(p) => (p, false),
            None => return Ok(SettingsFile::default()),
        },
    };

    if !path.exists() {
        if required {
            return Err(Error::Config(format!(
                "settings file not found: {}",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(SettingsFile::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let settings = SettingsFile::parse(&path, &content)?;
    tracing::info!(path = %path.display(), "loaded settings file");
    Ok(settings)
}

/// Return the default settings path: `~/.config/scribble/config.toml`
pub fn settings_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "scribble").map(|d| d.config_dir().join("config.toml"))
}
