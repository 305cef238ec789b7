//! Context assembly for generation turns
//!
//! Combines:
//! - Channel history (recent messages, from an in-process ring)
//! - Memories (global + addressed user)
//! - Dossiers (addressed user, then other participants)

mod assembler;
mod history;

pub use assembler::{AssemblerConfig, ContextAssembler, ContextPackage, Participant};
pub use history::{ChannelHistory, HistoryMessage};
