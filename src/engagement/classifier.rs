//! Per-message engagement decision

use std::sync::{Mutex, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::blacklist::BlacklistSet;
use super::wake::{Transition, WakeState, WakeStateStore, WakeStatus};
use crate::channels::IncomingMessage;
use crate::config::EngagementConfig;
use crate::similarity;

/// Why a message was not answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Channel is on the blacklist
    Blacklisted,
    /// No text to respond to
    Empty,
    /// Sent by the agent itself or another bot
    FromBot,
    /// Nothing in the message called for a reply
    NotAddressed,
}

/// Outcome of classifying one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ignore(IgnoreReason),
    /// Agent was named or explicitly mentioned
    RespondMentioned,
    /// Wake word opened a conversation window
    RespondWakeActivate,
    /// Channel was already awake
    RespondWakeContinuation,
    /// Unprompted reply drawn at random
    RespondRandom,
}

impl Decision {
    /// Whether the agent should take a turn
    #[must_use]
    pub const fn should_respond(self) -> bool {
        !matches!(self, Self::Ignore(_))
    }

    /// Stable label for logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ignore(IgnoreReason::Blacklisted) => "ignore-blacklisted",
            Self::Ignore(IgnoreReason::Empty) => "ignore-empty",
            Self::Ignore(IgnoreReason::FromBot) => "ignore-bot",
            Self::Ignore(IgnoreReason::NotAddressed) => "ignore",
            Self::RespondMentioned => "respond-mentioned",
            Self::RespondWakeActivate => "respond-wake-activate",
            Self::RespondWakeContinuation => "respond-wake-continuation",
            Self::RespondRandom => "respond-random",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the content of a message says about the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    /// Name matched or platform mention present
    pub mentioned: bool,
    /// Wake word present
    pub wake_word: bool,
}

impl Signals {
    /// Inspect `content` for the agent's name and wake word
    #[must_use]
    pub fn detect(
        content: &str,
        explicitly_mentioned: bool,
        agent_name: &str,
        config: &EngagementConfig,
    ) -> Self {
        let threshold = config.activation_threshold;
        let mentioned =
            explicitly_mentioned || similarity::best_phrase_match(content, agent_name) >= threshold;

        let wake = config.wake_word.to_lowercase();
        let wake_word = !wake.is_empty()
            && (content.to_lowercase().contains(&wake)
                || similarity::best_phrase_match(content, &wake) >= threshold);

        Self { mentioned, wake_word }
    }
}

/// Decide for a message that passed the pre-checks
///
/// `roll` is only called when the outcome depends on the random draw.
/// Returns the decision and the wake transition it implies.
pub fn decide(
    signals: Signals,
    state: &WakeState,
    wake_enabled: bool,
    random_response_chance: f64,
    roll: impl FnOnce(f64) -> bool,
) -> (Decision, Transition) {
    let asleep = state.status == WakeStatus::Asleep;
    let opens_window = wake_enabled && asleep && signals.wake_word;

    if signals.mentioned {
        // A name that doubles as the wake word still opens the window
        let transition = if opens_window {
            Transition::Activate
        } else {
            Transition::Touch
        };
        return (Decision::RespondMentioned, transition);
    }

    if opens_window {
        return (Decision::RespondWakeActivate, Transition::Activate);
    }

    if !asleep {
        return (Decision::RespondWakeContinuation, Transition::Touch);
    }

    if random_response_chance > 0.0 && roll(random_response_chance.min(1.0)) {
        return (Decision::RespondRandom, Transition::None);
    }

    (Decision::Ignore(IgnoreReason::NotAddressed), Transition::None)
}

/// Message classifier
///
/// The only component that changes wake status in response to traffic.
pub struct Classifier {
    config: EngagementConfig,
    agent_name: String,
    agent_id: RwLock<Option<String>>,
    blacklist: BlacklistSet,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("agent_name", &self.agent_name)
            .field("blacklist", &self.blacklist.len())
            .finish_non_exhaustive()
    }
}

impl Classifier {
    /// Create a classifier with an entropy-seeded random source
    #[must_use]
    pub fn new(config: EngagementConfig, agent_name: String, blacklist: BlacklistSet) -> Self {
        Self::with_rng(config, agent_name, blacklist, StdRng::from_entropy())
    }

    /// Create a classifier with an explicit random source
    #[must_use]
    pub fn with_rng(
        config: EngagementConfig,
        agent_name: String,
        blacklist: BlacklistSet,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            agent_name,
            agent_id: RwLock::new(None),
            blacklist,
            rng: Mutex::new(rng),
        }
    }

    /// Record the agent's own platform id (from the ready event)
    pub fn set_agent_id(&self, agent_id: String) {
        *self.agent_id.write().unwrap_or_else(PoisonError::into_inner) = Some(agent_id);
    }

    /// The agent's own platform id, once known
    #[must_use]
    pub fn agent_id(&self) -> Option<String> {
        self.agent_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Name the agent answers to
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Whether the channel is blacklisted
    #[must_use]
    pub fn is_blacklisted(&self, message: &IncomingMessage) -> bool {
        self.blacklist
            .contains(&message.channel_id, message.channel_name.as_deref())
    }

    /// Whether the message was written by the agent itself or another bot
    #[must_use]
    pub fn is_from_bot(&self, message: &IncomingMessage) -> bool {
        message.author_is_bot || self.agent_id().is_some_and(|id| id == message.author_id)
    }

    /// Classify a message, applying any wake transition atomically
    pub fn classify(&self, message: &IncomingMessage, wake: &WakeStateStore) -> Decision {
        self.classify_turn(message, wake).0
    }

    /// Classify a message and capture the channel epoch in the same step
    ///
    /// The epoch is `None` when the message was rejected before the wake
    /// state was consulted.
    pub fn classify_turn(
        &self,
        message: &IncomingMessage,
        wake: &WakeStateStore,
    ) -> (Decision, Option<u64>) {
        if self.is_blacklisted(message) {
            return (Decision::Ignore(IgnoreReason::Blacklisted), None);
        }
        if self.is_from_bot(message) {
            return (Decision::Ignore(IgnoreReason::FromBot), None);
        }
        let content = message.content.trim();
        if content.is_empty() {
            return (Decision::Ignore(IgnoreReason::Empty), None);
        }

        let explicit = self
            .agent_id()
            .is_some_and(|id| message.mentions_user(&id));
        let signals = Signals::detect(content, explicit, &self.agent_name, &self.config);

        let (decision, epoch) = wake.transition(&message.channel_id, |state, enabled| {
            let (decision, transition) = decide(
                signals,
                state,
                enabled,
                self.config.random_response_chance,
                |p| {
                    self.rng
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .gen_bool(p)
                },
            );
            ((decision, state.epoch), transition)
        });

        tracing::debug!(
            channel_id = %message.channel_id,
            author_id = %message.author_id,
            decision = %decision,
            "message classified"
        );
        (decision, Some(epoch))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;

    fn message(content: &str) -> IncomingMessage {
        IncomingMessage {
            id: "m1".to_string(),
            channel_id: "c1".to_string(),
            channel_name: Some("general".to_string()),
            guild_id: Some("g1".to_string()),
            author_id: "u1".to_string(),
            author_name: "alice".to_string(),
            author_is_bot: false,
            content: content.to_string(),
            timestamp: Utc::now(),
            mentions: Vec::new(),
        }
    }

    fn setup(config: EngagementConfig) -> (Arc<ManualClock>, WakeStateStore, Classifier) {
        let clock = Arc::new(ManualClock::default());
        let wake = WakeStateStore::new(
            clock.clone(),
            config.enable_wake_word_mode,
            config.conversation_timeout,
        );
        let classifier = Classifier::with_rng(
            config,
            "Scribble".to_string(),
            BlacklistSet::from_entries(["quiet-room"]),
            StdRng::seed_from_u64(7),
        );
        (clock, wake, classifier)
    }

    fn wake_config() -> EngagementConfig {
        EngagementConfig {
            wake_word: "hey buddy".to_string(),
            ..EngagementConfig::default()
        }
    }

    #[test]
    fn fuzzy_name_counts_as_mention() {
        let (_, wake, classifier) = setup(EngagementConfig::default());
        let decision = classifier.classify(&message("hey scrible can you help"), &wake);
        assert_eq!(decision, Decision::RespondMentioned);
    }

    #[test]
    fn explicit_mention_counts() {
        let (_, wake, classifier) = setup(wake_config());
        classifier.set_agent_id("bot".to_string());
        let mut msg = message("<@bot> what's up");
        msg.mentions.push("bot".to_string());
        assert_eq!(classifier.classify(&msg, &wake), Decision::RespondMentioned);
    }

    #[test]
    fn blacklisted_channel_touches_nothing() {
        let (_, wake, classifier) = setup(wake_config());
        let mut msg = message("hey buddy");
        msg.channel_name = Some("quiet-room".to_string());
        assert_eq!(
            classifier.classify(&msg, &wake),
            Decision::Ignore(IgnoreReason::Blacklisted)
        );
        assert!(!wake.is_awake("c1"));
    }

    #[test]
    fn bots_and_self_are_ignored() {
        let (_, wake, classifier) = setup(EngagementConfig::default());
        let mut msg = message("scribble!");
        msg.author_is_bot = true;
        assert_eq!(classifier.classify(&msg, &wake), Decision::Ignore(IgnoreReason::FromBot));

        classifier.set_agent_id("self".to_string());
        let mut own = message("scribble here");
        own.author_id = "self".to_string();
        assert_eq!(classifier.classify(&own, &wake), Decision::Ignore(IgnoreReason::FromBot));
    }

    #[test]
    fn empty_content_is_ignored() {
        let (_, wake, classifier) = setup(EngagementConfig::default());
        assert_eq!(
            classifier.classify(&message("   "), &wake),
            Decision::Ignore(IgnoreReason::Empty)
        );
    }

    #[test]
    fn wake_word_opens_window_and_continuation_follows() {
        let (clock, wake, classifier) = setup(wake_config());
        assert_eq!(
            classifier.classify(&message("Hey Buddy, morning"), &wake),
            Decision::RespondWakeActivate
        );
        assert!(wake.is_awake("c1"));

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(
            classifier.classify(&message("what's for lunch"), &wake),
            Decision::RespondWakeContinuation
        );

        clock.advance(chrono::Duration::minutes(11));
        assert_eq!(
            classifier.classify(&message("anyone?"), &wake),
            Decision::Ignore(IgnoreReason::NotAddressed)
        );
    }

    #[test]
    fn wake_word_ignored_when_mode_disabled() {
        let (_, wake, classifier) = setup(EngagementConfig {
            enable_wake_word_mode: false,
            ..wake_config()
        });
        assert_eq!(
            classifier.classify(&message("hey buddy"), &wake),
            Decision::Ignore(IgnoreReason::NotAddressed)
        );
        assert!(!wake.is_awake("c1"));
    }

    #[test]
    fn name_as_wake_word_opens_window() {
        let (clock, wake, classifier) = setup(EngagementConfig::default());
        assert_eq!(
            classifier.classify(&message("scribble"), &wake),
            Decision::RespondMentioned
        );
        clock.advance(chrono::Duration::minutes(9));
        assert!(wake.is_awake("c1"));
        clock.advance(chrono::Duration::minutes(2));
        assert!(!wake.is_awake("c1"));
    }

    #[test]
    fn random_chance_extremes() {
        let (_, wake, always) = setup(EngagementConfig {
            random_response_chance: 1.0,
            ..wake_config()
        });
        assert_eq!(always.classify(&message("lovely weather"), &wake), Decision::RespondRandom);
        assert!(!wake.is_awake("c1"));

        let (_, wake, never) = setup(wake_config());
        assert_eq!(
            never.classify(&message("lovely weather"), &wake),
            Decision::Ignore(IgnoreReason::NotAddressed)
        );
    }

    #[test]
    fn decide_is_pure_given_state() {
        let clock = ManualClock::default();
        let wake = WakeStateStore::new(Arc::new(clock), true, Duration::from_secs(600));
        let state = wake.get("c1");
        let signals = Signals {
            mentioned: false,
            wake_word: true,
        };
        let (decision, transition) = decide(signals, &state, true, 0.0, |_| unreachable!());
        assert_eq!(decision, Decision::RespondWakeActivate);
        assert_eq!(transition, Transition::Activate);
    }
}
