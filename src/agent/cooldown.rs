//! Per-user reply cooldown

use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

/// At most one reply per user per period; a zero period disables the check
pub struct Cooldown {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl std::fmt::Debug for Cooldown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cooldown")
            .field("enabled", &self.limiter.is_some())
            .finish()
    }
}

impl Cooldown {
    /// Create a cooldown of `period` per user
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            limiter: Quota::with_period(period).map(RateLimiter::keyed),
        }
    }

    /// Take the user's slot; `false` while they are cooling down
    pub fn check(&self, user_id: &str) -> bool {
        self.limiter
            .as_ref()
            .is_none_or(|limiter| limiter.check_key(&user_id.to_string()).is_ok())
    }

    /// Drop state for users whose cooldown has fully elapsed
    pub fn sweep(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
    }
}
