//! Token minting and a scripted authorization server for unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::sync::Notify;

use crate::api::{AuthApi, AuthApiError, RefreshedTokens};
use crate::auth::{Claims, CredentialPair, Role};

const SIGNING_SECRET: &[u8] = b"test-signing-secret";

pub(crate) const STUB_PASSWORD: &str = "correct horse";

static NEXT_JTI: AtomicU64 = AtomicU64::new(1);

fn next_jti() -> String {
    NEXT_JTI.fetch_add(1, Ordering::Relaxed).to_string()
}

fn whole_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

pub(crate) fn claims_for(role: Role, expires_at: DateTime<Utc>) -> Claims {
    Claims {
        subject_id: "17".to_string(),
        username: format!("{}-user", role),
        email: format!("{}@pulmoscan.test", role),
        role,
        is_staff: role == Role::Admin,
        expires_at: whole_seconds(expires_at),
        token_type: Some("access".to_string()),
        issued_at: Some(whole_seconds(Utc::now())),
        jti: Some(next_jti()),
    }
}

pub(crate) fn issue(claims: &Claims) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(SIGNING_SECRET),
    )
    .expect("test token should encode")
}

pub(crate) fn refresh_token(expires_at: DateTime<Utc>) -> String {
    let claims = serde_json::json!({
        "token_type": "refresh",
        "exp": expires_at.timestamp(),
        "jti": next_jti(),
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SIGNING_SECRET),
    )
    .expect("test token should encode")
}

pub(crate) fn pair_expiring_in(role: Role, lifetime: Duration) -> CredentialPair {
    let now = Utc::now();
    CredentialPair::new(
        issue(&claims_for(role, now + lifetime)),
        refresh_token(now + Duration::days(1)),
    )
}

pub(crate) fn pair_with_expired_refresh(role: Role) -> CredentialPair {
    let now = Utc::now();
    CredentialPair::new(
        issue(&claims_for(role, now - Duration::hours(2))),
        refresh_token(now - Duration::hours(1)),
    )
}

pub(crate) fn opaque_pair() -> CredentialPair {
    CredentialPair::new("opaque-access-token", "opaque-refresh-token")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshBehavior {
    Rotate,
    AccessOnly,
    Reject,
    Panic,
}

/// Scripted [`AuthApi`] that counts calls.
pub(crate) struct StubAuthApi {
    role: Role,
    lifetime: Duration,
    refresh: Mutex<RefreshBehavior>,
    delay: std::time::Duration,
    gate: Option<Arc<Notify>>,
    obtain_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

impl StubAuthApi {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            lifetime: Duration::minutes(5),
            refresh: Mutex::new(RefreshBehavior::Rotate),
            delay: std::time::Duration::ZERO,
            gate: None,
            obtain_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_refresh(self, behavior: RefreshBehavior) -> Self {
        *self.refresh.lock().unwrap() = behavior;
        self
    }

    pub(crate) fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Lifetime of access tokens handed out by obtain and refresh.
    pub(crate) fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Refresh exchanges block until the returned gate is notified.
    pub(crate) fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub(crate) fn set_refresh(&self, behavior: RefreshBehavior) {
        *self.refresh.lock().unwrap() = behavior;
    }

    pub(crate) fn obtain_calls(&self) -> usize {
        self.obtain_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    fn issue_access(&self) -> String {
        issue(&claims_for(self.role, Utc::now() + self.lifetime))
    }
}

#[async_trait]
impl AuthApi for StubAuthApi {
    async fn obtain(
        &self,
        _username: &str,
        password: &str,
    ) -> Result<CredentialPair, AuthApiError> {
        self.obtain_calls.fetch_add(1, Ordering::SeqCst);
        if password != STUB_PASSWORD {
            return Err(AuthApiError::Rejected {
                status: 401,
                detail: "No active account found with the given credentials".to_string(),
            });
        }
        Ok(CredentialPair::new(
            self.issue_access(),
            refresh_token(Utc::now() + Duration::days(1)),
        ))
    }

    async fn refresh(&self, _refresh: &str) -> Result<RefreshedTokens, AuthApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = *self.refresh.lock().unwrap();
        match behavior {
            RefreshBehavior::Rotate => Ok(RefreshedTokens {
                access: self.issue_access(),
                refresh: Some(refresh_token(Utc::now() + Duration::days(1))),
            }),
            RefreshBehavior::AccessOnly => Ok(RefreshedTokens {
                access: self.issue_access(),
                refresh: None,
            }),
            RefreshBehavior::Reject => Err(AuthApiError::Rejected {
                status: 401,
                detail: "Token is invalid or expired".to_string(),
            }),
            RefreshBehavior::Panic => panic!("refresh exchange crashed"),
        }
    }

    async fn revoke(&self, _pair: &CredentialPair) -> Result<(), AuthApiError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
