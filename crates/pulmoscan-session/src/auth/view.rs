//! Read-only identity projection and role guards.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::codec::{self, Claims, Role};
use super::store::{CredentialPair, CredentialStore, Subscription};

/// The signed-in user, as described by the current access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub is_staff: bool,
}

impl Identity {
    pub fn has_role(&self, role: Role) -> bool {
        self.role == role
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.subject_id,
            username: claims.username,
            email: claims.email,
            role: claims.role,
            is_staff: claims.is_staff,
        }
    }
}

/// Outcome of guarding a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    RedirectToLogin,
    RedirectToUnauthorized,
    Permit,
}

pub fn has_any_role(identity: Option<&Identity>, allowed: &[Role]) -> bool {
    identity.is_some_and(|id| allowed.contains(&id.role))
}

pub fn guard(identity: Option<&Identity>, allowed: &[Role]) -> GuardDecision {
    match identity {
        None => GuardDecision::RedirectToLogin,
        Some(id) if allowed.contains(&id.role) => GuardDecision::Permit,
        Some(_) => GuardDecision::RedirectToUnauthorized,
    }
}

fn identity_of(pair: Option<&CredentialPair>) -> Option<Identity> {
    match codec::decode(&pair?.access) {
        Ok(claims) => Some(claims.into()),
        Err(e) => {
            debug!(error = %e, "Access token does not decode; no identity");
            None
        }
    }
}

/// Identity derived from the store on every call, never cached.
#[derive(Clone)]
pub struct AuthorizationView {
    store: Arc<CredentialStore>,
}

impl AuthorizationView {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    pub fn current_user(&self) -> Option<Identity> {
        identity_of(self.store.get().as_ref())
    }

    /// Call `listener` with the re-derived identity after every store change.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<Identity>) + Send + Sync + 'static,
    {
        self.store.subscribe(move |pair| listener(identity_of(pair)))
    }

    pub fn has_any_role(&self, allowed: &[Role]) -> bool {
        has_any_role(self.current_user().as_ref(), allowed)
    }

    pub fn guard(&self, allowed: &[Role]) -> GuardDecision {
        guard(self.current_user().as_ref(), allowed)
    }
}
