//! Configuration management for Scribble
//!
//! The settings document is parsed once at startup into a typed [`Config`].
//! Every recognized option has a safe default; out-of-range values are a
//! fatal [`Error::Config`].

pub mod file;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::engagement::BlacklistSet;
use crate::{Error, Result};

pub use file::{SettingsFile, load_settings_file, settings_file_path};

/// Default persona prompt when none is configured
const DEFAULT_PERSONA: &str = "You are Scribble, a friendly and curious member of this chat server.";

/// Default in-character reply for failed turns
const DEFAULT_FALLBACK: &str = "*sowwy, I made an oopsie! Something went wrong... uwu*";

/// Scribble configuration
#[derive(Debug)]
pub struct Config {
    /// Character identity
    pub character: CharacterConfig,

    /// Engagement rules
    pub engagement: EngagementConfig,

    /// Action safety limits
    pub safety: SafetyConfig,

    /// Memory store limits
    pub memory: MemoryConfig,

    /// Dossier store limits
    pub dossier: DossierConfig,

    /// Character ceiling for assembled context
    pub max_context_chars: usize,

    /// Generation backend
    pub generation: GenerationConfig,

    /// Discord bot token
    pub discord_token: Option<SecretString>,

    /// Channels where the agent never engages
    pub blacklist: BlacklistSet,

    /// Directory for persisted state
    pub data_dir: PathBuf,

    /// Default tracing filter from the settings file
    pub log_level: Option<String>,
}

/// Character identity and persona
#[derive(Debug, Clone)]
pub struct CharacterConfig {
    /// Name the agent answers to
    pub name: String,

    /// System persona text sent with every generation request
    pub persona_prompt: String,

    /// In-character reply for failed turns
    pub fallback_message: String,
}

/// Engagement rules for the message classifier
#[derive(Debug, Clone)]
pub struct EngagementConfig {
    /// Minimum name similarity (0-1) to count as a mention
    pub activation_threshold: f64,

    /// Phrase that opens a conversation window
    pub wake_word: String,

    /// Whether the wake word opens conversation windows at all
    pub enable_wake_word_mode: bool,

    /// Length of a conversation window after the last message
    pub conversation_timeout: Duration,

    /// Probability (0-1) of replying to an unaddressed message
    pub random_response_chance: f64,

    /// Messages of history handed to the generator
    pub message_history_count: usize,

    /// Minimum gap between replies to the same user
    pub command_cooldown: Duration,

    /// Prefix for administrative commands
    pub command_prefix: String,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.85,
            wake_word: "scribble".to_string(),
            enable_wake_word_mode: true,
            conversation_timeout: Duration::from_secs(10 * 60),
            random_response_chance: 0.0,
            message_history_count: 20,
            command_cooldown: Duration::from_secs(3),
            command_prefix: "!scribble".to_string(),
        }
    }
}

/// Which bucket an action counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionRateScope {
    /// One bucket per requesting user
    #[default]
    Requester,
    /// One bucket shared by everyone
    Global,
}

impl ActionRateScope {
    /// Parse from string representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "requester" | "user" => Some(Self::Requester),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// Action gate limits
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Users allowed to run admin commands; never targetable by actions
    pub admin_user_ids: HashSet<String>,

    /// Users never targetable by actions
    pub protected_user_ids: HashSet<String>,

    /// Authorized actions per scope per hour
    pub max_actions_per_hour: u32,

    /// Bucket the hourly counter applies to
    pub action_rate_scope: ActionRateScope,

    /// Longest timeout an action may request
    pub max_timeout_minutes: i64,

    /// Clamp over-long timeouts instead of denying them
    pub clamp_timeouts: bool,

    pub enable_bans: bool,
    pub enable_timeouts: bool,
    pub enable_nicknames: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            admin_user_ids: HashSet::new(),
            protected_user_ids: HashSet::new(),
            max_actions_per_hour: 10,
            action_rate_scope: ActionRateScope::default(),
            max_timeout_minutes: 60,
            clamp_timeouts: true,
            enable_bans: false,
            enable_timeouts: true,
            enable_nicknames: true,
        }
    }
}

/// Memory store limits
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Cap on entries per scope
    pub max_entries_per_scope: usize,

    /// Similarity at which new content merges into an existing entry
    pub merge_threshold: f64,

    /// Entries handed to the generator per turn
    pub max_context_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries_per_scope: 100,
            merge_threshold: 0.9,
            max_context_entries: 20,
        }
    }
}

/// Dossier store limits
#[derive(Debug, Clone, Copy)]
pub struct DossierConfig {
    /// Cap on traits per user
    pub max_traits: usize,

    /// Similarity at which traits are considered the same observation
    pub trait_merge_threshold: f64,
}

impl Default for DossierConfig {
    fn default() -> Self {
        Self {
            max_traits: 20,
            trait_merge_threshold: 0.85,
        }
    }
}

/// Generation backend settings
#[derive(Debug)]
pub struct GenerationConfig {
    /// OpenAI-compatible base URL
    pub api_url: String,

    /// API key (optional for local backends)
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Bound on a single generation call
    pub timeout: Duration,

    /// Max tokens per completion
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            timeout: Duration::from_secs(60),
            max_tokens: 500,
            temperature: 0.8,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            character: CharacterConfig {
                name: "Scribble".to_string(),
                persona_prompt: DEFAULT_PERSONA.to_string(),
                fallback_message: DEFAULT_FALLBACK.to_string(),
            },
            engagement: EngagementConfig::default(),
            safety: SafetyConfig::default(),
            memory: MemoryConfig::default(),
            dossier: DossierConfig::default(),
            max_context_chars: 12_000,
            generation: GenerationConfig::default(),
            discord_token: None,
            blacklist: BlacklistSet::default(),
            data_dir: default_data_dir(),
            log_level: None,
        }
    }
}

/// Default data directory (`~/.local/share/scribble` on Linux)
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "scribble")
        .map_or_else(|| PathBuf::from("data"), |d| d.data_dir().to_path_buf())
}

impl Config {
    /// Load configuration from the settings file and environment
    ///
    /// Environment overrides: `DISCORD_TOKEN`, `OPENAI_API_KEY`,
    /// `SCRIBBLE_DATA_DIR`.
    ///
    /// # Errors
    ///
    /// Returns error if the settings file is unreadable or any value is invalid
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut settings = load_settings_file(explicit_path)?;

        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            settings.discord.token = Some(token);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            settings.generation.api_key = Some(key);
        }
        if let Ok(dir) = std::env::var("SCRIBBLE_DATA_DIR") {
            settings.paths.data_dir = Some(dir);
        }

        let config = Self::from_settings(settings)?;

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        Ok(config)
    }

    /// Build a validated configuration from a parsed settings document
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range or a referenced persona file
    /// cannot be read
    #[allow(clippy::too_many_lines)]
    pub fn from_settings(settings: SettingsFile) -> Result<Self> {
        let defaults = Self::default();
        let SettingsFile {
            character,
            engagement,
            safety,
            memory,
            dossier,
            context,
            generation,
            discord,
            logging,
            paths,
        } = settings;

        let persona_prompt = match character.persona_path {
            Some(path) => std::fs::read_to_string(&path)
                .map(|s| s.trim().to_string())
                .map_err(|e| Error::Config(format!("failed to read persona {path}: {e}")))?,
            None => character.persona.unwrap_or(defaults.character.persona_prompt),
        };

        let character = CharacterConfig {
            name: character.name.unwrap_or(defaults.character.name),
            persona_prompt,
            fallback_message: character
                .fallback_message
                .unwrap_or(defaults.character.fallback_message),
        };

        let d = defaults.engagement;
        let timeout_minutes = engagement
            .conversation_timeout_minutes
            .unwrap_or(i64::try_from(d.conversation_timeout.as_secs() / 60).unwrap_or(10));
        if timeout_minutes <= 0 {
            return Err(Error::Config(format!(
                "conversation_timeout_minutes must be positive, got {timeout_minutes}"
            )));
        }

        let mut blacklist = BlacklistSet::from_entries(
            engagement.blacklisted_channels.unwrap_or_default(),
        );
        if let Some(path) = engagement.blacklist_path {
            blacklist.extend(BlacklistSet::load(Path::new(&path)));
        }

        let engagement = EngagementConfig {
            activation_threshold: engagement
                .activation_threshold
                .unwrap_or(d.activation_threshold),
            wake_word: engagement
                .wake_word
                .map(|w| w.trim().to_string())
                .unwrap_or(d.wake_word),
            enable_wake_word_mode: engagement
                .enable_wake_word_mode
                .unwrap_or(d.enable_wake_word_mode),
            conversation_timeout: Duration::from_secs(timeout_minutes.unsigned_abs() * 60),
            random_response_chance: engagement
                .random_response_chance
                .unwrap_or(d.random_response_chance),
            message_history_count: engagement
                .message_history_count
                .unwrap_or(d.message_history_count),
            command_cooldown: engagement
                .command_cooldown_seconds
                .map_or(d.command_cooldown, Duration::from_secs),
            command_prefix: engagement.command_prefix.unwrap_or(d.command_prefix),
        };

        let s = defaults.safety;
        let action_rate_scope = match safety.action_rate_scope {
            Some(raw) => ActionRateScope::parse(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "action_rate_scope must be \"requester\" or \"global\", got {raw:?}"
                ))
            })?,
            None => s.action_rate_scope,
        };
        let safety = SafetyConfig {
            admin_user_ids: safety
                .admin_user_ids
                .map_or(s.admin_user_ids, |ids| ids.into_iter().collect()),
            protected_user_ids: safety
                .protected_user_ids
                .map_or(s.protected_user_ids, |ids| ids.into_iter().collect()),
            max_actions_per_hour: safety.max_actions_per_hour.unwrap_or(s.max_actions_per_hour),
            action_rate_scope,
            max_timeout_minutes: safety.max_timeout_minutes.unwrap_or(s.max_timeout_minutes),
            clamp_timeouts: safety.clamp_timeouts.unwrap_or(s.clamp_timeouts),
            enable_bans: safety.enable_bans.unwrap_or(s.enable_bans),
            enable_timeouts: safety.enable_timeouts.unwrap_or(s.enable_timeouts),
            enable_nicknames: safety.enable_nicknames.unwrap_or(s.enable_nicknames),
        };

        let m = defaults.memory;
        let memory = MemoryConfig {
            max_entries_per_scope: memory.max_entries_per_scope.unwrap_or(m.max_entries_per_scope),
            merge_threshold: memory.merge_threshold.unwrap_or(m.merge_threshold),
            max_context_entries: memory.max_context_entries.unwrap_or(m.max_context_entries),
        };

        let ds = defaults.dossier;
        let dossier = DossierConfig {
            max_traits: dossier.max_traits.unwrap_or(ds.max_traits),
            trait_merge_threshold: dossier
                .trait_merge_threshold
                .unwrap_or(ds.trait_merge_threshold),
        };

        let g = defaults.generation;
        let generation = GenerationConfig {
            api_url: generation
                .api_url
                .map_or(g.api_url, |u| u.trim_end_matches('/').to_string()),
            api_key: generation
                .api_key
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: generation.model.unwrap_or(g.model),
            timeout: generation.timeout_seconds.map_or(g.timeout, Duration::from_secs),
            max_tokens: generation.max_tokens.unwrap_or(g.max_tokens),
            temperature: generation.temperature.unwrap_or(g.temperature),
        };

        let config = Self {
            character,
            engagement,
            safety,
            memory,
            dossier,
            max_context_chars: context.max_chars.unwrap_or(defaults.max_context_chars),
            generation,
            discord_token: discord
                .token
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            blacklist,
            data_dir: paths.data_dir.map_or(defaults.data_dir, PathBuf::from),
            log_level: logging.level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range option
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::Config(format!("{name} must be within 0..=1, got {v}")))
            }
        };

        unit("activation_threshold", self.engagement.activation_threshold)?;
        unit("random_response_chance", self.engagement.random_response_chance)?;
        unit("memory.merge_threshold", self.memory.merge_threshold)?;
        unit("dossier.trait_merge_threshold", self.dossier.trait_merge_threshold)?;

        if self.character.name.trim().is_empty() {
            return Err(Error::Config("character name must not be empty".to_string()));
        }
        if self.engagement.enable_wake_word_mode && self.engagement.wake_word.is_empty() {
            return Err(Error::Config(
                "wake_word must be set when wake word mode is enabled".to_string(),
            ));
        }
        if self.engagement.message_history_count == 0 {
            return Err(Error::Config("message_history_count must be at least 1".to_string()));
        }
        if self.safety.max_timeout_minutes <= 0 {
            return Err(Error::Config("max_timeout_minutes must be positive".to_string()));
        }
        if self.memory.max_entries_per_scope == 0 || self.dossier.max_traits == 0 {
            return Err(Error::Config("memory and dossier caps must be at least 1".to_string()));
        }
        if self.generation.timeout.is_zero() {
            return Err(Error::Config("generation timeout must be positive".to_string()));
        }

        Ok(())
    }

    /// Path of the memory store file
    #[must_use]
    pub fn memories_path(&self) -> PathBuf {
        self.data_dir.join("memories.json")
    }

    /// Path of the dossier store file
    #[must_use]
    pub fn dossier_path(&self) -> PathBuf {
        self.data_dir.join("dossier.json")
    }
}
