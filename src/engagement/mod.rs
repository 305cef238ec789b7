//! Engagement: whether the agent takes a turn for a message
//!
//! The [`Classifier`] reads and mutates per-channel [`WakeStateStore`]
//! state; the [`BlacklistSet`] is consulted before anything else.

mod blacklist;
mod classifier;
mod wake;

pub use blacklist::BlacklistSet;
pub use classifier::{Classifier, Decision, IgnoreReason, Signals, decide};
pub use wake::{Transition, WakeState, WakeStateStore, WakeStatus};
