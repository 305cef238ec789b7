//! Scribble - a conversational chat agent
//!
//! Decides per message whether to engage, keeps a rolling "awake" window per
//! channel, remembers facts and builds profiles of participants, and can
//! request a small, gated set of moderation actions.
//!
//! # Architecture
//!
//! ```text
//! incoming message
//!      │
//!      ▼
//! ┌────────────┐   reads/mutates   ┌──────────────────┐
//! │ Classifier │ ────────────────► │ Wake-state store │
//! └─────┬──────┘                   └──────────────────┘
//!       │ respond
//!       ▼
//! ┌───────────────────┐  reads  ┌──────────────┐ ┌───────────────┐
//! │ Context assembler │ ──────► │ Memory store │ │ Dossier store │
//! └─────┬─────────────┘         └──────────────┘ └───────────────┘
//!       │
//!       ▼
//!   generation ──► reply + action requests ──► Action gate ──► executor
//!       │
//!       └──► memory / dossier updates
//! ```

pub mod actions;
pub mod admin;
pub mod agent;
pub mod channels;
pub mod clock;
pub mod config;
pub mod context;
pub mod daemon;
pub mod engagement;
pub mod error;
pub mod generation;
pub mod similarity;
pub mod store;

pub use agent::{Agent, Collaborators, TurnOutcome};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
