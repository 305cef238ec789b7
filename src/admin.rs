//! Administrative chat commands
//!
//! `!scribble <command>` from a configured admin. Everyone else's use of the
//! prefix is ignored silently.

use std::time::Duration;

use crate::actions::ActionGate;
use crate::engagement::WakeStateStore;
use crate::store::{DossierStore, MemoryStore, RepairReport};

/// Most authorization records shown by `status`
const STATUS_RECORDS: usize = 5;

/// A parsed admin command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Status,
    /// Turn wake-word mode on or off
    Wake(bool),
    /// Set the conversation window length in minutes
    WakeTimeout(u64),
    /// Close this channel's window
    Sleep,
    MemoryRepair,
    MemoryReset,
    DossierRepair,
    Help,
}

const USAGE: &str = "commands: status | wake on|off | wake timeout <minutes> | sleep | \
                     memory repair | memory reset | dossier repair";

impl AdminCommand {
    /// Parse `content` if it starts with `prefix`
    ///
    /// Returns `None` when the message is not a command at all, and
    /// `Some(Err(usage))` when it is one we do not understand.
    #[must_use]
    pub fn parse(content: &str, prefix: &str) -> Option<Result<Self, String>> {
        let content = content.trim();
        let head = content.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(prefix) {
            return None;
        }
        let rest = &content[prefix.len()..];
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return None;
        }

        let words: Vec<String> = rest.split_whitespace().map(str::to_lowercase).collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        let command = match words.as_slice() {
            ["status"] => Self::Status,
            ["wake", "on"] => Self::Wake(true),
            ["wake", "off"] => Self::Wake(false),
            ["wake", "timeout", minutes] => match minutes.parse::<u64>() {
                Ok(m) if m > 0 => Self::WakeTimeout(m),
                _ => return Some(Err("wake timeout needs a positive number of minutes".to_string())),
            },
            ["sleep"] => Self::Sleep,
            ["memory", "repair"] => Self::MemoryRepair,
            ["memory", "reset"] => Self::MemoryReset,
            ["dossier", "repair"] => Self::DossierRepair,
            [] | ["help"] => Self::Help,
            _ => return Some(Err(USAGE.to_string())),
        };
        Some(Ok(command))
    }
}

/// State the admin surface can inspect and change
#[derive(Clone, Copy)]
pub struct AdminContext<'a> {
    pub wake: &'a WakeStateStore,
    pub memories: &'a MemoryStore,
    pub dossiers: &'a DossierStore,
    pub gate: &'a ActionGate,
}

impl AdminCommand {
    /// Run the command for `channel_id`, returning the reply text
    pub async fn run(self, ctx: AdminContext<'_>, channel_id: &str) -> String {
        match self {
            Self::Status => status(ctx, channel_id).await,
            Self::Wake(enabled) => {
                ctx.wake.set_enabled(enabled);
                format!("wake-word mode {}", if enabled { "on" } else { "off" })
            }
            Self::WakeTimeout(minutes) => {
                ctx.wake.set_timeout(Duration::from_secs(minutes.saturating_mul(60)));
                format!("conversation window is now {minutes} minutes")
            }
            Self::Sleep => {
                ctx.wake.reset(channel_id);
                "going quiet in this channel".to_string()
            }
            Self::MemoryRepair => describe_repair("memory", ctx.memories.validate_and_repair().await),
            Self::MemoryReset => match ctx.memories.reset().await {
                Ok(()) => "memories cleared".to_string(),
                Err(e) => format!("memory reset failed: {e}"),
            },
            Self::DossierRepair => {
                describe_repair("dossier", ctx.dossiers.validate_and_repair().await)
            }
            Self::Help => USAGE.to_string(),
        }
    }
}

async fn status(ctx: AdminContext<'_>, channel_id: &str) -> String {
    let timeout_minutes = ctx.wake.timeout().as_secs() / 60;
    let mut lines = vec![
        format!(
            "wake-word mode: {} ({timeout_minutes} min window)",
            if ctx.wake.enabled() { "on" } else { "off" }
        ),
        format!(
            "this channel: {}",
            if ctx.wake.is_awake(channel_id) { "awake" } else { "asleep" }
        ),
        format!("awake channels: {}", ctx.wake.awake_channels().len()),
        format!("memories: {}", ctx.memories.len().await),
        format!("dossiers: {}", ctx.dossiers.len().await),
    ];

    let records = ctx.gate.recent_records(STATUS_RECORDS);
    if records.is_empty() {
        lines.push("recent actions: none".to_string());
    } else {
        lines.push("recent actions:".to_string());
        for record in records {
            lines.push(format!(
                "- {} {} -> {} by {} ({})",
                record.at.format("%H:%M"),
                record.kind,
                record.target_id.as_deref().unwrap_or("-"),
                record.requester_id,
                record.outcome,
            ));
        }
    }
    lines.join("\n")
}

fn describe_repair(
    kind: &str,
    outcome: Result<RepairReport, crate::error::PersistenceError>,
) -> String {
    match outcome {
        Ok(report) if !report.repaired => format!("{kind}: no problems found"),
        Ok(report) => {
            let mut text = format!("{kind}: fixed {} issue(s)", report.issues.len());
            for issue in report.issues.iter().take(10) {
                text.push_str("\n- ");
                text.push_str(issue);
            }
            text
        }
        Err(e) => format!("{kind} repair failed: {e}"),
    }
}
