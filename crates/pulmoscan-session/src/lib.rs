//! Client-side session and authorization lifecycle for PulmoScan Pro.
//!
//! [`SessionManager`] is the entry point: it logs in, keeps the access token
//! fresh (on demand and in the background), sends authorized API requests,
//! and answers "who is signed in, and may they see this?".

pub mod api;
pub mod auth;
pub mod config;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, AuthorizedClient, RequestSpec};
pub use auth::{GuardDecision, Identity, Role, SessionEvent};
pub use config::{Config, StorageKind};
pub use session::{LoginOutcome, SessionManager};
