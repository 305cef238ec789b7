//! Shared test utilities

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use scribble::actions::{ActionExecutor, AuthorizedAction, ExecutionScope};
use scribble::channels::{Channel, IncomingMessage, OutgoingMessage};
use scribble::clock::ManualClock;
use scribble::error::GenerationError;
use scribble::generation::{GenerationRequest, GenerationResponse, Generator, parse_response};
use scribble::{Agent, Collaborators, Config};
use tokio::sync::Notify;

/// Mock channel that records what was sent
#[derive(Default)]
pub struct MockChannel {
    pub sent: Mutex<Vec<OutgoingMessage>>,
    pub typing: Mutex<Vec<String>>,
    /// When set, each send records the message, signals `started` and waits for `release`
    send_hold: Option<(Arc<Notify>, Arc<Notify>)>,
    /// Sleep inside every typing indicator
    typing_delay: Option<Duration>,
}

impl MockChannel {
    /// Hold every send until released; returns (started, release)
    pub fn held_send(mut self) -> (Self, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.send_hold = Some((started.clone(), release.clone()));
        (self, started, release)
    }

    pub fn with_typing_delay(mut self, delay: Duration) -> Self {
        self.typing_delay = Some(delay);
        self
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.content).collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&mut self) -> scribble::Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> scribble::Result<()> {
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> scribble::Result<()> {
        self.sent.lock().unwrap().push(message);
        if let Some((started, release)) = &self.send_hold {
            started.notify_one();
            release.notified().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn send_typing(&self, channel_id: &str) -> scribble::Result<()> {
        self.typing.lock().unwrap().push(channel_id.to_string());
        if let Some(delay) = self.typing_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// What the mock generator does on its next call
pub enum Scripted {
    /// Raw model output, parsed like a real backend's
    Raw(String),
    Fail(String),
    /// Sleep before answering
    Slow(Duration, String),
}

/// Generator that replays scripted outputs; replies "ok" once exhausted
#[derive(Default)]
pub struct MockGenerator {
    script: Mutex<VecDeque<Scripted>>,
    pub requests: Mutex<Vec<GenerationRequest>>,
    /// When set, each call signals `started` and waits for `release`
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl MockGenerator {
    pub fn scripted(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn raw(outputs: &[&str]) -> Self {
        Self::scripted(outputs.iter().map(|o| Scripted::Raw((*o).to_string())))
    }

    /// Hold every call until released; returns (started, release)
    pub fn held(mut self) -> (Self, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.hold = Some((started.clone(), release.clone()));
        (self, started, release)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some((started, release)) = &self.hold {
            started.notify_one();
            release.notified().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            None => Ok(parse_response("ok")),
            Some(Scripted::Raw(raw)) => Ok(parse_response(&raw)),
            Some(Scripted::Fail(reason)) => Err(GenerationError::Failure(reason)),
            Some(Scripted::Slow(delay, raw)) => {
                tokio::time::sleep(delay).await;
                Ok(parse_response(&raw))
            }
        }
    }
}

/// Executor that records what it was asked to do
#[derive(Default)]
pub struct MockExecutor {
    pub executed: Mutex<Vec<AuthorizedAction>>,
}

impl MockExecutor {
    pub fn executed(&self) -> Vec<AuthorizedAction> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(
        &self,
        action: &AuthorizedAction,
        _scope: &ExecutionScope,
    ) -> scribble::Result<String> {
        self.executed.lock().unwrap().push(action.clone());
        Ok(format!("did {}", action.kind))
    }
}

/// Config pointing at `dir`, with no cooldown and a few known users
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.to_path_buf();
    config.engagement.command_cooldown = Duration::ZERO;
    config.safety.admin_user_ids = HashSet::from(["100".to_string()]);
    config.safety.protected_user_ids = HashSet::from(["200".to_string()]);
    config.character.fallback_message = "oops, my quill slipped".to_string();
    config
}

/// An agent wired to mocks
pub struct Harness {
    pub agent: Arc<Agent>,
    pub channel: Arc<MockChannel>,
    pub generator: Arc<MockGenerator>,
    pub executor: Arc<MockExecutor>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(config: &Config, generator: MockGenerator) -> Harness {
    harness_with_channel(config, generator, MockChannel::default())
}

pub fn harness_with_channel(
    config: &Config,
    generator: MockGenerator,
    channel: MockChannel,
) -> Harness {
    let channel = Arc::new(channel);
    let generator = Arc::new(generator);
    let executor = Arc::new(MockExecutor::default());
    let clock = Arc::new(ManualClock::default());
    let agent = Agent::with_rng(
        config,
        Collaborators {
            channel: channel.clone(),
            generator: generator.clone(),
            executor: executor.clone(),
            clock: clock.clone(),
        },
        StdRng::seed_from_u64(7),
    );
    Harness {
        agent: Arc::new(agent),
        channel,
        generator,
        executor,
        clock,
    }
}

/// A guild message from a human
pub fn message(id: &str, channel_id: &str, author: (&str, &str), content: &str) -> IncomingMessage {
    IncomingMessage {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        channel_name: Some("general".to_string()),
        guild_id: Some("900".to_string()),
        author_id: author.0.to_string(),
        author_name: author.1.to_string(),
        author_is_bot: false,
        content: content.to_string(),
        timestamp: Utc::now(),
        mentions: Vec::new(),
    }
}

pub const ALICE: (&str, &str) = ("1", "alice");
pub const BOB: (&str, &str) = ("2", "bob");
pub const ADMIN: (&str, &str) = ("100", "mod");
pub const VIP: (&str, &str) = ("200", "vip");
