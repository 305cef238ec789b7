//! Turn processing
//!
//! One task per inbound event. A turn runs:
//!
//! 1. admin command check
//! 2. classification (captures the channel epoch)
//! 3. per-user cooldown
//! 4. context assembly and generation, with no lock held
//! 5. supersession check, then reply and gated actions
//! 6. memory and dossier updates from the exchange
//!
//! If the channel is reset or deleted while the model is thinking, the
//! result is thrown away: no reply, no action, no store write. A reset
//! that lands after the reply still stops any remaining action and the
//! store writes.

mod cooldown;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

pub use cooldown::Cooldown;

use crate::actions::{
    ActionExecutor, ActionGate, ActionKind, ActionRequest, Authorization, ExecutionScope,
    Requester,
};
use crate::admin::{AdminCommand, AdminContext};
use crate::channels::{Channel, ChannelEvent, IncomingMessage, OutgoingMessage};
use crate::clock::Clock;
use crate::config::{CharacterConfig, Config};
use crate::context::{AssemblerConfig, ChannelHistory, ContextAssembler, ContextPackage, HistoryMessage};
use crate::engagement::{Classifier, Decision, WakeStateStore};
use crate::error::GenerationError;
use crate::generation::{
    GenerationRequest, GenerationResponse, Generator, MemoryNote, TraitNote, system_prompt,
};
use crate::store::memory::DEFAULT_IMPORTANCE;
use crate::store::{DossierStore, MemoryScope, MemoryStore, RepairReport};

/// Messages of history kept per channel beyond what a turn needs
const HISTORY_SLACK: usize = 10;

/// What happened to one action request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub kind: ActionKind,
    pub target_id: Option<String>,
    /// `executed`, `failed`, or the deny label
    pub outcome: String,
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Classifier chose not to engage
    Ignored(Decision),
    /// Admin command handled (or refused)
    Admin,
    /// Author replied again inside their cooldown
    CoolingDown,
    /// Channel was reset or deleted mid-turn; result discarded
    Superseded,
    /// Generation failed; the fallback message was sent
    Fallback,
    /// Reply sent
    Replied {
        decision: Decision,
        actions: Vec<ActionOutcome>,
        memories_written: usize,
        dossiers_updated: usize,
    },
}

/// External collaborators a turn talks to
#[derive(Clone)]
pub struct Collaborators {
    pub channel: Arc<dyn Channel>,
    pub generator: Arc<dyn Generator>,
    pub executor: Arc<dyn ActionExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// The conversational agent
pub struct Agent {
    character: CharacterConfig,
    system_prompt: String,
    command_prefix: String,
    history_count: usize,
    generation_timeout: Duration,
    classifier: Classifier,
    wake: WakeStateStore,
    history: ChannelHistory,
    memories: Arc<MemoryStore>,
    dossiers: Arc<DossierStore>,
    assembler: ContextAssembler,
    gate: ActionGate,
    cooldown: Cooldown,
    channel: Arc<dyn Channel>,
    generator: Arc<dyn Generator>,
    executor: Arc<dyn ActionExecutor>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.character.name)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create an agent with an entropy-seeded random source
    #[must_use]
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        Self::with_rng(config, collaborators, StdRng::from_entropy())
    }

    /// Create an agent with an explicit random source for unprompted replies
    #[must_use]
    pub fn with_rng(config: &Config, collaborators: Collaborators, rng: StdRng) -> Self {
        let Collaborators {
            channel,
            generator,
            executor,
            clock,
        } = collaborators;

        let memories = Arc::new(MemoryStore::new(
            config.memories_path(),
            config.memory,
            clock.clone(),
        ));
        let dossiers = Arc::new(DossierStore::new(
            config.dossier_path(),
            config.dossier,
            clock.clone(),
        ));
        let history_count = config.engagement.message_history_count.max(1);
        let assembler = ContextAssembler::new(
            memories.clone(),
            dossiers.clone(),
            AssemblerConfig {
                history_count,
                max_memories: config.memory.max_context_entries,
                max_chars: config.max_context_chars,
            },
        );

        Self {
            character: config.character.clone(),
            system_prompt: system_prompt(&config.character, &config.safety),
            command_prefix: config.engagement.command_prefix.clone(),
            history_count,
            generation_timeout: config.generation.timeout,
            classifier: Classifier::with_rng(
                config.engagement.clone(),
                config.character.name.clone(),
                config.blacklist.clone(),
                rng,
            ),
            wake: WakeStateStore::new(
                clock.clone(),
                config.engagement.enable_wake_word_mode,
                config.engagement.conversation_timeout,
            ),
            history: ChannelHistory::new(history_count + HISTORY_SLACK),
            memories,
            dossiers,
            assembler,
            gate: ActionGate::new(config.safety.clone(), clock),
            cooldown: Cooldown::new(config.engagement.command_cooldown),
            channel,
            generator,
            executor,
        }
    }

    /// Load both stores from disk, repairing what needs it
    pub async fn load_stores(&self) -> (RepairReport, RepairReport) {
        let memories = self.memories.load().await;
        let dossiers = self.dossiers.load().await;
        tracing::info!(
            memories = self.memories.len().await,
            dossiers = self.dossiers.len().await,
            memory_issues = memories.issues.len(),
            dossier_issues = dossiers.issues.len(),
            "stores loaded"
        );
        (memories, dossiers)
    }

    #[must_use]
    pub const fn wake(&self) -> &WakeStateStore {
        &self.wake
    }

    #[must_use]
    pub fn memories(&self) -> &MemoryStore {
        &self.memories
    }

    #[must_use]
    pub fn dossiers(&self) -> &DossierStore {
        &self.dossiers
    }

    #[must_use]
    pub const fn gate(&self) -> &ActionGate {
        &self.gate
    }

    #[must_use]
    pub const fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    #[must_use]
    pub const fn history(&self) -> &ChannelHistory {
        &self.history
    }

    /// Drop cooldown entries and action rate windows that have fully elapsed
    pub fn sweep(&self) {
        self.cooldown.sweep();
        self.gate.sweep();
    }

    /// Handle one event from the transport
    pub async fn handle_event(&self, event: ChannelEvent) -> Option<TurnOutcome> {
        match event {
            ChannelEvent::Ready {
                agent_id,
                agent_name,
            } => {
                tracing::info!(%agent_id, %agent_name, "agent identity known");
                self.classifier.set_agent_id(agent_id);
                None
            }
            ChannelEvent::ChannelDeleted { channel_id } => {
                self.wake.forget(&channel_id);
                self.history.forget(&channel_id);
                None
            }
            ChannelEvent::Message(message) => Some(self.process_message(message).await),
        }
    }

    /// Run a full turn for one message
    pub async fn process_message(&self, message: IncomingMessage) -> TurnOutcome {
        if self.classifier.is_blacklisted(&message) {
            return TurnOutcome::Ignored(self.classifier.classify(&message, &self.wake));
        }

        if !message.author_is_bot
            && let Some(parsed) = AdminCommand::parse(&message.content, &self.command_prefix)
        {
            self.run_admin(&message, parsed).await;
            return TurnOutcome::Admin;
        }

        let from_agent = self
            .classifier
            .agent_id()
            .is_some_and(|id| id == message.author_id);
        let window = self.history.record_window(
            &message.channel_id,
            HistoryMessage::from_incoming(&message, from_agent),
            self.history_count,
        );

        let (decision, epoch) = self.classifier.classify_turn(&message, &self.wake);
        let Some(epoch) = epoch.filter(|_| decision.should_respond()) else {
            return TurnOutcome::Ignored(decision);
        };

        if !self.cooldown.check(&message.author_id) {
            tracing::debug!(author_id = %message.author_id, "author cooling down");
            return TurnOutcome::CoolingDown;
        }

        if let Err(e) = self.channel.send_typing(&message.channel_id).await {
            tracing::debug!(error = %e, "typing indicator failed");
        }

        let package = self
            .assembler
            .build_context(&message.channel_id, &message.author_id, &window)
            .await;

        let generated = self.generate(&package).await;

        if !self.wake.is_current(&message.channel_id, epoch) {
            tracing::info!(channel_id = %message.channel_id, "turn superseded, discarding result");
            return TurnOutcome::Superseded;
        }

        let response = match generated {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(channel_id = %message.channel_id, error = %e, "generation failed");
                self.reply(&message, &self.character.fallback_message).await;
                return TurnOutcome::Fallback;
            }
        };

        if !response.message.is_empty() {
            self.reply(&message, &response.message).await;
        }

        let mut actions = Vec::with_capacity(response.actions.len());
        for request in &response.actions {
            if !self.wake.is_current(&message.channel_id, epoch) {
                tracing::info!(
                    channel_id = %message.channel_id,
                    skipped = response.actions.len() - actions.len(),
                    "channel reset after reply; dropping remaining actions"
                );
                return TurnOutcome::Superseded;
            }
            actions.push(self.run_action(request, &package, &message).await);
        }

        if !self.wake.is_current(&message.channel_id, epoch) {
            tracing::info!(channel_id = %message.channel_id, "channel reset before learning; skipping");
            return TurnOutcome::Superseded;
        }
        let (memories_written, dossiers_updated) = self.learn(&response, &package, &message).await;

        TurnOutcome::Replied {
            decision,
            actions,
            memories_written,
            dossiers_updated,
        }
    }

    async fn generate(
        &self,
        package: &ContextPackage,
    ) -> Result<GenerationResponse, GenerationError> {
        let request = GenerationRequest {
            system_prompt: self.system_prompt.clone(),
            context: package.render(),
        };
        tokio::time::timeout(self.generation_timeout, self.generator.generate(&request))
            .await
            .map_err(|_| GenerationError::Timeout(self.generation_timeout))?
    }

    async fn reply(&self, message: &IncomingMessage, content: &str) {
        let outgoing =
            OutgoingMessage::reply(message.channel_id.clone(), content.to_string(), message.id.clone());
        if let Err(e) = self.channel.send(outgoing).await {
            tracing::warn!(channel_id = %message.channel_id, error = %e, "failed to send reply");
        }
    }

    async fn run_admin(&self, message: &IncomingMessage, parsed: Result<AdminCommand, String>) {
        if !self.gate.is_admin(&message.author_id) {
            tracing::info!(author_id = %message.author_id, "admin command from non-admin ignored");
            return;
        }
        let text = match parsed {
            Ok(command) => {
                tracing::info!(author_id = %message.author_id, ?command, "admin command");
                let ctx = AdminContext {
                    wake: &self.wake,
                    memories: &self.memories,
                    dossiers: &self.dossiers,
                    gate: &self.gate,
                };
                command.run(ctx, &message.channel_id).await
            }
            Err(usage) => usage,
        };
        self.reply(message, &text).await;
    }

    async fn run_action(
        &self,
        request: &ActionRequest,
        package: &ContextPackage,
        message: &IncomingMessage,
    ) -> ActionOutcome {
        let target_id = request
            .target
            .as_deref()
            .and_then(|raw| package.resolve_target(raw));
        let requester = Requester {
            user_id: message.author_id.clone(),
            display_name: message.author_name.clone(),
            channel_id: message.channel_id.clone(),
        };

        let outcome = match self.gate.authorize(request, target_id.as_deref(), &requester) {
            Authorization::Deny(reason) => reason.as_str().to_string(),
            Authorization::Allow(action) => {
                let scope = ExecutionScope {
                    guild_id: message.guild_id.clone(),
                    channel_id: message.channel_id.clone(),
                };
                match self.executor.execute(&action, &scope).await {
                    Ok(summary) => {
                        tracing::info!(action = %action.kind, %summary, "action executed");
                        "executed".to_string()
                    }
                    Err(e) => {
                        tracing::warn!(action = %action.kind, error = %e, "action failed");
                        "failed".to_string()
                    }
                }
            }
        };

        ActionOutcome {
            kind: request.kind,
            target_id,
            outcome,
        }
    }

    /// Write memories and traits from the exchange; returns (memories, dossiers) written
    async fn learn(
        &self,
        response: &GenerationResponse,
        package: &ContextPackage,
        message: &IncomingMessage,
    ) -> (usize, usize) {
        let mut memories_written = 0;
        for note in &response.memories {
            let Some(scope) = memory_scope(note, package, &message.author_id) else {
                tracing::debug!(about = ?note.about, "memory about unknown user skipped");
                continue;
            };
            match self
                .memories
                .upsert(scope, &note.content, note.importance.unwrap_or(DEFAULT_IMPORTANCE))
                .await
            {
                Ok(_) => memories_written += 1,
                Err(e) => tracing::warn!(error = %e, "memory write failed"),
            }
        }

        let mut observed: Vec<(String, Vec<String>)> = vec![(message.author_id.clone(), Vec::new())];
        for TraitNote { user, traits } in &response.traits {
            let Some(user_id) = package.resolve_target(user) else {
                tracing::debug!(%user, "traits about unknown user skipped");
                continue;
            };
            match observed.iter_mut().find(|(id, _)| *id == user_id) {
                Some((_, existing)) => existing.extend(traits.iter().cloned()),
                None => observed.push((user_id, traits.clone())),
            }
        }

        let mut dossiers_updated = 0;
        for (user_id, traits) in observed {
            let display_name = if user_id == message.author_id {
                message.author_name.clone()
            } else {
                package
                    .participants
                    .iter()
                    .find(|p| p.user_id == user_id)
                    .map_or_else(String::new, |p| p.display_name.clone())
            };
            match self.dossiers.upsert(&user_id, &display_name, &traits).await {
                Ok(_) => dossiers_updated += 1,
                Err(e) => tracing::warn!(%user_id, error = %e, "dossier write failed"),
            }
        }

        (memories_written, dossiers_updated)
    }
}

/// Which scope a memory note belongs to
fn memory_scope(note: &MemoryNote, package: &ContextPackage, author_id: &str) -> Option<MemoryScope> {
    match note.about.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("global" | "everyone" | "server") => Some(MemoryScope::Global),
        Some("user" | "me" | "author" | "them") => Some(MemoryScope::User(author_id.to_string())),
        Some(_) => note
            .about
            .as_deref()
            .and_then(|about| package.resolve_target(about))
            .map(MemoryScope::User),
    }
}
