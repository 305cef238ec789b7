//! Requested actions: parsing, authorization, execution

pub mod executor;
pub mod gate;
pub mod request;

pub use executor::{ActionExecutor, ExecutionScope};
pub use gate::{
    ActionGate, Authorization, AuthorizationRecord, AuthorizedAction, DenyReason, RateLimitCounter,
    Requester,
};
pub use request::{ActionKind, ActionParams, ActionRequest};
