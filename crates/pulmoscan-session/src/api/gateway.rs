//! Authorized request gateway.
//!
//! Every call to the PulmoScan API goes through [`AuthorizedClient::send`],
//! which makes sure the access token is fresh, attaches it as a bearer
//! credential and maps auth failures onto the session:
//! - 401 tears the session down and surfaces `Unauthenticated` (no retry)
//! - 403 surfaces `Forbidden` and leaves the session alone

use std::sync::Arc;

use chrono::Duration;
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::auth::{CredentialStore, RefreshCoordinator, SessionEvent, SessionEvents};

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn url(&self, base: &Url) -> Result<Url, ApiError> {
        base.join(self.path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidRequest(format!("{}: {}", self.path, e)))
    }
}

/// HTTP client for the PulmoScan API that carries the session.
/// Clone is cheap - all state is shared.
#[derive(Clone)]
pub struct AuthorizedClient {
    client: Client,
    base_url: Url,
    coordinator: RefreshCoordinator,
    store: Arc<CredentialStore>,
    events: SessionEvents,
    skew: Duration,
}

impl AuthorizedClient {
    pub fn new(
        client: Client,
        base_url: Url,
        coordinator: RefreshCoordinator,
        store: Arc<CredentialStore>,
        events: SessionEvents,
        skew: Duration,
    ) -> Self {
        Self {
            client,
            base_url,
            coordinator,
            store,
            events,
            skew,
        }
    }

    /// Send `spec` with a fresh bearer token. Non-success statuses are
    /// returned as errors.
    pub async fn send(&self, spec: RequestSpec) -> Result<Response, ApiError> {
        let url = spec.url(&self.base_url)?;

        let pair = self.coordinator.ensure_fresh(self.skew).await.map_err(|e| {
            debug!(error = %e, path = %spec.path, "No usable session; request not sent");
            ApiError::Unauthenticated
        })?;

        let mut request = self
            .client
            .request(spec.method.clone(), url)
            .bearer_auth(&pair.access);
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        if let Some(ref body) = spec.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = ApiError::from_status(status, &body);
        match error {
            ApiError::Unauthenticated => self.teardown(&pair.access, &spec),
            ApiError::Forbidden(_) => {
                info!(method = %spec.method, path = %spec.path, "Request forbidden for current role")
            }
            _ => warn!(method = %spec.method, path = %spec.path, status = %status, "Request failed"),
        }
        Err(error)
    }

    /// Send `spec` and parse the JSON response body.
    pub async fn send_json<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, ApiError> {
        let path = spec.path.clone();
        let response = self.send(spec).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(RequestSpec::get(path)).await
    }

    // Only the pair that was rejected is cleared; a pair rotated in the
    // meantime stays. Concurrent 401s announce the teardown once.
    fn teardown(&self, rejected_access: &str, spec: &RequestSpec) {
        if self.store.clear_if_access(rejected_access) {
            warn!(method = %spec.method, path = %spec.path, "Credential rejected by server; session ended");
            self.events.emit(SessionEvent::Expired {
                reason: "credential rejected by server".to_string(),
            });
        } else {
            debug!(path = %spec.path, "Credential rejected but session already changed");
        }
    }
}
