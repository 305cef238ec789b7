//! Daemon - the long-running agent service
//!
//! Connects the Discord transport, loads the stores, and dispatches one task
//! per inbound event until interrupted.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::mpsc;

use crate::agent::{Agent, Collaborators};
use crate::channels::{Channel, ChannelEvent, DiscordChannel, DiscordExecutor};
use crate::clock::{Clock, SystemClock};
use crate::generation::OpenAiGenerator;
use crate::store::{DossierStore, MemoryStore, RepairReport};
use crate::{Config, Error, Result};

/// How often idle cooldown entries are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// The Scribble daemon
pub struct Daemon {
    config: Config,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a new daemon instance
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if no Discord token is configured or the transport or
    /// generation client cannot be set up
    pub async fn run(self) -> Result<()> {
        let token = self
            .config
            .discord_token
            .as_ref()
            .ok_or_else(|| Error::Config("DISCORD_TOKEN is not set".to_string()))?
            .expose_secret()
            .to_string();

        let generator = Arc::new(OpenAiGenerator::new(&self.config.generation)?);

        let (mut discord, rx) = DiscordChannel::with_receiver(token);
        discord.connect().await?;
        let http = discord
            .http()
            .ok_or_else(|| Error::Channel("Discord connected without an HTTP client".to_string()))?;

        let agent = Arc::new(Agent::new(
            &self.config,
            Collaborators {
                channel: Arc::new(discord),
                generator,
                executor: Arc::new(DiscordExecutor::new(http)),
                clock: Arc::new(SystemClock),
            },
        ));
        agent.load_stores().await;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        tracing::info!(
            name = %self.config.character.name,
            wake_word = %self.config.engagement.wake_word,
            "scribble running"
        );
        dispatch(Arc::clone(&agent), rx, shutdown_rx).await;

        if let Err(e) = agent.memories().save().await {
            tracing::warn!(error = %e, "final memory save failed");
        }
        if let Err(e) = agent.dossiers().save().await {
            tracing::warn!(error = %e, "final dossier save failed");
        }
        tracing::info!("daemon stopped");
        Ok(())
    }
}

/// Spawn a task per event until the source closes or shutdown is signalled
pub async fn dispatch(
    agent: Arc<Agent>,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("event source closed");
                    break;
                };
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    if let Some(outcome) = agent.handle_event(event).await {
                        tracing::debug!(?outcome, "turn finished");
                    }
                });
            }
            _ = sweep.tick() => agent.sweep(),
            _ = shutdown.recv() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }
}

fn offline_stores(config: &Config) -> (MemoryStore, DossierStore) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    (
        MemoryStore::new(config.memories_path(), config.memory, Arc::clone(&clock)),
        DossierStore::new(config.dossier_path(), config.dossier, clock),
    )
}

/// Validate and repair both store files without starting the agent
///
/// # Errors
///
/// Returns error if a repaired file cannot be written
pub async fn repair_stores(config: &Config) -> Result<(RepairReport, RepairReport)> {
    let (memories, dossiers) = offline_stores(config);
    let memory_report = memories.validate_and_repair().await?;
    let dossier_report = dossiers.validate_and_repair().await?;
    Ok((memory_report, dossier_report))
}

/// Clear the memory store file
///
/// # Errors
///
/// Returns error if the file cannot be written
pub async fn reset_memories(config: &Config) -> Result<()> {
    let (memories, _) = offline_stores(config);
    memories.reset().await?;
    Ok(())
}
