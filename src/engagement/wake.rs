//! Per-channel wake state
//!
//! `ASLEEP --(wake word)--> AWAKE --(timeout | reset)--> ASLEEP`
//!
//! Expiry is resolved lazily against the injected clock on every access;
//! there are no timers. The stored status is never trusted on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Conversation status of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeStatus {
    /// Only mentions (or random draws) get a reply
    Asleep,
    /// Every message gets a reply until the window lapses
    Awake,
}

/// Wake state for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeState {
    pub channel_id: String,
    pub status: WakeStatus,
    pub last_activity: DateTime<Utc>,
    /// Whether the current window was opened by the wake word
    pub activated_by_word: bool,
    /// Bumped on every reset; in-flight turns compare against it
    pub epoch: u64,
}

impl WakeState {
    fn asleep(channel_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            status: WakeStatus::Asleep,
            last_activity: now,
            activated_by_word: false,
            epoch: 0,
        }
    }

    /// Whether the window is open at `now`
    #[must_use]
    pub fn is_awake_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.status != WakeStatus::Awake {
            return false;
        }
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return true;
        };
        now - self.last_activity < timeout
    }
}

/// State change applied by [`WakeStateStore::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Leave the state alone
    None,
    /// Open or re-arm the window
    Activate,
    /// Refresh an open window; no-op when asleep
    Touch,
}

#[derive(Debug, Clone, Copy)]
struct WakeSettings {
    enabled: bool,
    timeout: Duration,
}

/// Store of wake state for every channel seen
pub struct WakeStateStore {
    clock: Arc<dyn Clock>,
    settings: RwLock<WakeSettings>,
    states: Mutex<HashMap<String, WakeState>>,
}

impl std::fmt::Debug for WakeStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeStateStore")
            .field("enabled", &self.enabled())
            .field("timeout", &self.timeout())
            .finish_non_exhaustive()
    }
}

impl WakeStateStore {
    /// Create a store
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, enabled: bool, timeout: Duration) -> Self {
        Self {
            clock,
            settings: RwLock::new(WakeSettings { enabled, timeout }),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn settings(&self) -> WakeSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether wake-word mode is on
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.settings().enabled
    }

    /// Turn wake-word mode on or off
    ///
    /// Turning it off does not close windows that are already open.
    pub fn set_enabled(&self, enabled: bool) {
        self.settings.write().unwrap_or_else(PoisonError::into_inner).enabled = enabled;
        tracing::info!(enabled, "wake word mode changed");
    }

    /// Current conversation window length
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.settings().timeout
    }

    /// Change the window length; applies to open windows on next access
    pub fn set_timeout(&self, timeout: Duration) {
        self.settings.write().unwrap_or_else(PoisonError::into_inner).timeout = timeout;
        tracing::info!(timeout_secs = timeout.as_secs(), "conversation timeout changed");
    }

    /// Run `f` on the channel's state after resolving expiry
    fn with_state<T>(&self, channel_id: &str, f: impl FnOnce(&mut WakeState, DateTime<Utc>) -> T) -> T {
        let now = self.clock.now();
        let timeout = self.timeout();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(channel_id.to_string())
            .or_insert_with(|| WakeState::asleep(channel_id, now));

        if state.status == WakeStatus::Awake && !state.is_awake_at(now, timeout) {
            tracing::debug!(channel_id, "conversation window lapsed");
            state.status = WakeStatus::Asleep;
            state.activated_by_word = false;
        }

        f(state, now)
    }

    /// Decide and apply a transition atomically
    ///
    /// `decide` sees the expiry-resolved state and whether wake-word mode is
    /// on; the returned [`Transition`] is applied before the lock is released.
    pub fn transition<T>(
        &self,
        channel_id: &str,
        decide: impl FnOnce(&WakeState, bool) -> (T, Transition),
    ) -> T {
        let enabled = self.enabled();
        self.with_state(channel_id, |state, now| {
            let (out, transition) = decide(state, enabled);
            match transition {
                Transition::None => {}
                Transition::Activate => {
                    if state.status == WakeStatus::Asleep {
                        tracing::info!(channel_id, "channel awake");
                    }
                    state.status = WakeStatus::Awake;
                    state.activated_by_word = true;
                    state.last_activity = now;
                }
                Transition::Touch => {
                    if state.status == WakeStatus::Awake {
                        state.last_activity = now;
                    }
                }
            }
            out
        })
    }

    /// Snapshot of the channel's state, created ASLEEP on first access
    #[must_use]
    pub fn get(&self, channel_id: &str) -> WakeState {
        self.with_state(channel_id, |state, _| state.clone())
    }

    /// Open (or re-arm) the conversation window
    pub fn activate(&self, channel_id: &str) -> WakeState {
        self.transition(channel_id, |_, _| ((), Transition::Activate));
        self.get(channel_id)
    }

    /// Refresh the window if it is open; returns whether it was
    pub fn touch(&self, channel_id: &str) -> bool {
        self.transition(channel_id, |state, _| {
            (state.status == WakeStatus::Awake, Transition::Touch)
        })
    }

    /// Close the window and supersede any in-flight turn
    pub fn reset(&self, channel_id: &str) {
        self.with_state(channel_id, |state, now| {
            state.status = WakeStatus::Asleep;
            state.activated_by_word = false;
            state.last_activity = now;
            state.epoch += 1;
        });
        tracing::debug!(channel_id, "wake state reset");
    }

    /// Channel went away (e.g. deleted); same as a reset
    pub fn forget(&self, channel_id: &str) {
        self.reset(channel_id);
        tracing::info!(channel_id, "channel forgotten");
    }

    /// Whether the window is open now
    #[must_use]
    pub fn is_awake(&self, channel_id: &str) -> bool {
        self.with_state(channel_id, |state, _| state.status == WakeStatus::Awake)
    }

    /// Current turn epoch for the channel
    #[must_use]
    pub fn epoch(&self, channel_id: &str) -> u64 {
        self.with_state(channel_id, |state, _| state.epoch)
    }

    /// Whether a turn started at `epoch` is still current
    #[must_use]
    pub fn is_current(&self, channel_id: &str, epoch: u64) -> bool {
        self.epoch(channel_id) == epoch
    }

    /// Channels with an open window, sorted
    #[must_use]
    pub fn awake_channels(&self) -> Vec<String> {
        let now = self.clock.now();
        let timeout = self.timeout();
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut awake: Vec<String> = states
            .values()
            .filter(|s| s.is_awake_at(now, timeout))
            .map(|s| s.channel_id.clone())
            .collect();
        awake.sort();
        awake
    }
}
