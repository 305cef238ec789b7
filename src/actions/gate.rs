//! Action gate
//!
//! Authorizes requested actions; never executes them. Checks run in a fixed
//! order and the first failure wins:
//!
//! 1. target is protected or an admin
//! 2. target could not be resolved to a user id
//! 3. capability disabled
//! 4. parameter out of bounds (timeouts may be clamped instead)
//! 5. hourly counter for the acting scope exhausted
//!
//! The counter is checked and incremented under one lock, so it moves exactly
//! once per allow and never on a deny.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use super::request::{ActionKind, ActionParams, ActionRequest};
use crate::channels::DISCORD_MESSAGE_LIMIT;
use crate::clock::Clock;
use crate::config::{ActionRateScope, SafetyConfig};

/// Authorization records kept for the status command
const RECORD_CAPACITY: usize = 50;

/// Length of one action rate window
const RATE_WINDOW: Duration = Duration::hours(1);

/// Longest nickname Discord accepts
const MAX_NICKNAME_CHARS: usize = 32;

/// Most images a single search may post
const MAX_IMAGE_COUNT: u32 = 5;

/// Who asked, and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user_id: String,
    pub display_name: String,
    pub channel_id: String,
}

/// Why a request was denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Target is protected or an admin
    ProtectedTarget,
    /// Target did not resolve to a known user
    UnknownTarget,
    /// Capability switched off
    CapabilityDisabled(ActionKind),
    /// Parameter outside its allowed range
    OutOfBounds(String),
    /// Hourly limit reached
    RateLimited,
}

impl DenyReason {
    /// Stable label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ProtectedTarget => "protected-target",
            Self::UnknownTarget => "unknown-target",
            Self::CapabilityDisabled(_) => "capability-disabled",
            Self::OutOfBounds(_) => "out-of-bounds",
            Self::RateLimited => "rate-limit",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapabilityDisabled(kind) => write!(f, "capability-disabled ({kind})"),
            Self::OutOfBounds(detail) => write!(f, "out-of-bounds ({detail})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A request that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedAction {
    pub kind: ActionKind,
    /// Resolved user id for targeted actions
    pub target_id: Option<String>,
    /// Parameters after clamping
    pub params: ActionParams,
    pub reason: Option<String>,
    pub requester: Requester,
    /// Whether a parameter was reduced to its bound
    pub clamped: bool,
}

/// Gate verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allow(AuthorizedAction),
    Deny(DenyReason),
}

impl Authorization {
    /// Whether the request was allowed
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// One gate decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    pub at: DateTime<Utc>,
    pub requester_id: String,
    pub kind: ActionKind,
    pub target_id: Option<String>,
    /// `allow` or the deny label
    pub outcome: String,
    pub clamped: bool,
}

/// Hourly counter for one scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCounter {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

/// Action gate
pub struct ActionGate {
    config: SafetyConfig,
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, RateLimitCounter>>,
    records: Mutex<VecDeque<AuthorizationRecord>>,
}

impl std::fmt::Debug for ActionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ActionGate {
    /// Create a gate
    #[must_use]
    pub fn new(config: SafetyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            counters: Mutex::new(HashMap::new()),
            records: Mutex::new(VecDeque::with_capacity(RECORD_CAPACITY)),
        }
    }

    /// Whether `user_id` may run admin commands
    #[must_use]
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.config.admin_user_ids.contains(user_id)
    }

    /// Authorize `request`, whose target has already been resolved to `target_id`
    pub fn authorize(
        &self,
        request: &ActionRequest,
        target_id: Option<&str>,
        requester: &Requester,
    ) -> Authorization {
        let verdict = self.check(request, target_id, requester);
        self.record(request.kind, target_id, requester, &verdict);
        verdict
    }

    fn check(
        &self,
        request: &ActionRequest,
        target_id: Option<&str>,
        requester: &Requester,
    ) -> Authorization {
        if let Some(target) = target_id
            && (self.config.protected_user_ids.contains(target)
                || self.config.admin_user_ids.contains(target))
        {
            return Authorization::Deny(DenyReason::ProtectedTarget);
        }

        if request.kind.is_targeted() && target_id.is_none() {
            return Authorization::Deny(DenyReason::UnknownTarget);
        }

        let enabled = match request.kind {
            ActionKind::Ban => self.config.enable_bans,
            ActionKind::Timeout => self.config.enable_timeouts,
            ActionKind::Nickname => self.config.enable_nicknames,
            ActionKind::Dm | ActionKind::VoiceJoin | ActionKind::ImageSearch => true,
        };
        if !enabled {
            return Authorization::Deny(DenyReason::CapabilityDisabled(request.kind));
        }

        let (params, clamped) = match self.bounded(&request.params) {
            Ok(bounded) => bounded,
            Err(detail) => return Authorization::Deny(DenyReason::OutOfBounds(detail)),
        };

        if !self.take_rate_slot(&requester.user_id) {
            return Authorization::Deny(DenyReason::RateLimited);
        }

        Authorization::Allow(AuthorizedAction {
            kind: request.kind,
            target_id: target_id.map(ToString::to_string),
            params,
            reason: request.reason.clone(),
            requester: requester.clone(),
            clamped,
        })
    }

    /// Apply parameter bounds; returns the params to use and whether they were clamped
    fn bounded(&self, params: &ActionParams) -> Result<(ActionParams, bool), String> {
        match params {
            ActionParams::Timeout { minutes } => {
                let max = self.config.max_timeout_minutes;
                if *minutes <= 0 {
                    Err(format!("timeout of {minutes} minutes"))
                } else if *minutes > max {
                    if self.config.clamp_timeouts {
                        Ok((ActionParams::Timeout { minutes: max }, true))
                    } else {
                        Err(format!("timeout of {minutes} minutes exceeds {max}"))
                    }
                } else {
                    Ok((params.clone(), false))
                }
            }
            ActionParams::Nickname { nickname } => {
                let len = nickname.trim().chars().count();
                if len == 0 || len > MAX_NICKNAME_CHARS {
                    Err(format!("nickname of {len} characters"))
                } else {
                    Ok((params.clone(), false))
                }
            }
            ActionParams::Dm { message } => {
                let len = message.trim().chars().count();
                if len == 0 || len > DISCORD_MESSAGE_LIMIT {
                    Err(format!("direct message of {len} characters"))
                } else {
                    Ok((params.clone(), false))
                }
            }
            ActionParams::ImageSearch { query, count } => {
                if query.trim().is_empty() || *count == 0 {
                    Err("empty image search".to_string())
                } else if *count > MAX_IMAGE_COUNT {
                    Ok((
                        ActionParams::ImageSearch {
                            query: query.clone(),
                            count: MAX_IMAGE_COUNT,
                        },
                        true,
                    ))
                } else {
                    Ok((params.clone(), false))
                }
            }
            ActionParams::Ban | ActionParams::VoiceJoin => Ok((params.clone(), false)),
        }
    }

    fn scope_key(&self, requester_id: &str) -> String {
        match self.config.action_rate_scope {
            ActionRateScope::Requester => format!("user:{requester_id}"),
            ActionRateScope::Global => "global".to_string(),
        }
    }

    /// Check and take one slot in the hourly window
    fn take_rate_slot(&self, requester_id: &str) -> bool {
        let now = self.clock.now();
        let key = self.scope_key(requester_id);
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(key).or_insert(RateLimitCounter {
            window_start: now,
            count: 0,
        });

        if now - counter.window_start >= RATE_WINDOW {
            counter.window_start = now;
            counter.count = 0;
        }
        if counter.count >= self.config.max_actions_per_hour {
            return false;
        }
        counter.count += 1;
        true
    }

    /// Drop counters whose hourly window has closed
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let before = counters.len();
        counters.retain(|_, counter| now - counter.window_start < RATE_WINDOW);
        let removed = before - counters.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = counters.len(), "expired action rate counters");
        }
    }

    /// Current counter for the scope `requester_id` acts in
    #[must_use]
    pub fn counter(&self, requester_id: &str) -> Option<RateLimitCounter> {
        let key = self.scope_key(requester_id);
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied()
    }

    fn record(
        &self,
        kind: ActionKind,
        target_id: Option<&str>,
        requester: &Requester,
        verdict: &Authorization,
    ) {
        let (outcome, clamped) = match verdict {
            Authorization::Allow(action) => ("allow".to_string(), action.clamped),
            Authorization::Deny(reason) => (reason.to_string(), false),
        };

        tracing::info!(
            requester_id = %requester.user_id,
            channel_id = %requester.channel_id,
            action = %kind,
            target_id = ?target_id,
            outcome = %outcome,
            clamped,
            "action authorization"
        );

        let record = AuthorizationRecord {
            at: self.clock.now(),
            requester_id: requester.user_id.clone(),
            kind,
            target_id: target_id.map(ToString::to_string),
            outcome,
            clamped,
        };
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == RECORD_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent authorization records, oldest first
    #[must_use]
    pub fn recent_records(&self, n: usize) -> Vec<AuthorizationRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }
}
