//! Execution seam for authorized actions

use async_trait::async_trait;

use super::gate::AuthorizedAction;
use crate::Result;

/// Where an action runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionScope {
    /// Guild the request came from (absent in direct messages)
    pub guild_id: Option<String>,
    pub channel_id: String,
}

/// Carries out actions the gate has already allowed
///
/// Implementations never re-check policy; they only talk to the platform.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Perform `action`, returning a short human-readable summary
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Action`] if the platform rejects the action or
    /// it is not supported
    async fn execute(&self, action: &AuthorizedAction, scope: &ExecutionScope) -> Result<String>;
}
