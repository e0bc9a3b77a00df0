//! Session state and authorization.
//!
//! This module provides:
//! - `codec`: token claim decoding and expiry checks
//! - `CredentialStore`: the single credential slot, persisted via `SessionStorage`
//! - `RefreshCoordinator`: single-flight token refresh
//! - `RenewalTimer`: background renewal ahead of expiry
//! - `AuthorizationView`: decoded identity and role guards

pub mod codec;
pub mod events;
pub mod refresh;
pub mod renewal;
pub mod storage;
pub mod store;
pub mod view;

pub use codec::{Claims, DecodeError, Role};
pub use events::{SessionEvent, SessionEvents};
pub use refresh::{RefreshCoordinator, SessionError};
pub use renewal::{RenewalHandle, RenewalPolicy, RenewalTimer};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, SessionStorage};
pub use store::{CredentialPair, CredentialStore, Subscription};
pub use view::{guard, has_any_role, AuthorizationView, GuardDecision, Identity};
