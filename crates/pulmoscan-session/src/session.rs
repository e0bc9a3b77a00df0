//! The session manager collaborators talk to.
//!
//! Screens and route guards never touch the credential store. They call
//! `login`, `logout`, `current_user`, `has_role`/`guard`, send requests through
//! `client()`, and listen on `events()` to react to an expired session.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::{AuthApi, AuthApiError, AuthorizedClient, HttpAuthApi};
use crate::auth::{
    codec, AuthorizationView, CredentialStore, GuardDecision, Identity, RefreshCoordinator,
    RenewalHandle, RenewalPolicy, RenewalTimer, Role, SessionEvent, SessionEvents,
    SessionStorage, Subscription,
};
use crate::config::Config;

const LOGIN_FAILED: &str = "Something went wrong during login!";
const CONNECT_FAILED: &str = "Could not connect to the server or an unexpected error occurred.";

/// Result of a login attempt, suitable for showing on a login form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LoginOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoginOutcome {
    fn succeeded() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

struct Inner {
    store: Arc<CredentialStore>,
    api: Arc<dyn AuthApi>,
    coordinator: RefreshCoordinator,
    client: AuthorizedClient,
    view: AuthorizationView,
    events: SessionEvents,
    renewal: RenewalPolicy,
}

/// Clone is cheap - all clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Build a manager talking HTTP to the configured server, restoring any
    /// session persisted in `storage`.
    pub fn new(config: &Config, storage: Arc<dyn SessionStorage>) -> Result<Self> {
        let http = Self::http_client(config)?;
        let api = HttpAuthApi::new(http.clone(), &config.auth_base()?)?;
        Self::build(config, storage, Arc::new(api), http)
    }

    /// Build a manager with a custom authorization exchange.
    pub fn with_auth_api(
        config: &Config,
        storage: Arc<dyn SessionStorage>,
        api: Arc<dyn AuthApi>,
    ) -> Result<Self> {
        let http = Self::http_client(config)?;
        Self::build(config, storage, api, http)
    }

    fn http_client(config: &Config) -> Result<Client> {
        Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")
    }

    fn build(
        config: &Config,
        storage: Arc<dyn SessionStorage>,
        api: Arc<dyn AuthApi>,
        http: Client,
    ) -> Result<Self> {
        let store = Arc::new(CredentialStore::load(storage));
        let events = SessionEvents::new();
        let coordinator = RefreshCoordinator::new(store.clone(), api.clone(), events.clone());
        let client = AuthorizedClient::new(
            http,
            config.api_base()?,
            coordinator.clone(),
            store.clone(),
            events.clone(),
            config.request_skew(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                view: AuthorizationView::new(store.clone()),
                store,
                api,
                coordinator,
                client,
                events,
                renewal: config.renewal_policy(),
            }),
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> LoginOutcome {
        let pair = match self.inner.api.obtain(username, password).await {
            Ok(pair) => pair,
            Err(AuthApiError::Rejected { status, detail }) => {
                warn!(username, status, "Login rejected");
                let reason = if detail.trim().is_empty() {
                    LOGIN_FAILED.to_string()
                } else {
                    detail
                };
                return LoginOutcome::failed(reason);
            }
            Err(AuthApiError::Network(e)) => {
                warn!(username, error = %e, "Login request failed");
                return LoginOutcome::failed(CONNECT_FAILED);
            }
            Err(e @ AuthApiError::InvalidResponse(_)) => {
                warn!(username, error = %e, "Login response unreadable");
                return LoginOutcome::failed(CONNECT_FAILED);
            }
        };

        let claims = match codec::decode(&pair.access) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(username, error = %e, "Login returned an access token that does not decode");
                return LoginOutcome::failed(LOGIN_FAILED);
            }
        };

        self.inner.store.set(pair);
        info!(username = %claims.username, role = %claims.role, "Logged in");
        self.inner.events.emit(SessionEvent::LoggedIn {
            username: claims.username,
            role: claims.role,
        });
        LoginOutcome::succeeded()
    }

    /// End the session locally, then ask the server to revoke the refresh
    /// token. The local session is gone even if revocation fails.
    pub async fn logout(&self) {
        let Some(pair) = self.inner.store.take() else {
            return;
        };
        info!("Logged out");
        self.inner.events.emit(SessionEvent::LoggedOut);

        if let Err(e) = self.inner.api.revoke(&pair).await {
            warn!(error = %e, "Failed to revoke refresh token");
        }
    }

    /// On startup, refresh a restored session once so the first screen sees
    /// current claims. Returns the identity if the session survived.
    pub async fn bootstrap(&self) -> Option<Identity> {
        if self.inner.store.is_empty() {
            return None;
        }
        match self.inner.coordinator.force_refresh().await {
            Ok(_) => self.current_user(),
            Err(e) => {
                info!(error = %e, "Restored session could not be refreshed");
                None
            }
        }
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.inner.view.current_user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_user().is_some()
    }

    pub fn has_role(&self, allowed: &[Role]) -> bool {
        self.inner.view.has_any_role(allowed)
    }

    pub fn guard(&self, allowed: &[Role]) -> GuardDecision {
        self.inner.view.guard(allowed)
    }

    /// Call `listener` with the new identity whenever the session changes.
    pub fn on_identity_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<Identity>) + Send + Sync + 'static,
    {
        self.inner.view.on_change(listener)
    }

    pub fn client(&self) -> AuthorizedClient {
        self.inner.client.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Start background renewal using the configured policy.
    pub fn start_renewal(&self) -> RenewalHandle {
        RenewalTimer::spawn(
            self.inner.coordinator.clone(),
            self.inner.store.clone(),
            self.inner.renewal,
        )
    }
}
