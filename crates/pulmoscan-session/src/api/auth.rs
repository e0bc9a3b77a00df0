//! Exchanges with the authorization server: obtain, refresh and revoke.
//!
//! Endpoints, relative to the configured auth base:
//! - `POST token/` with `{username, password}` returns `{access, refresh}`
//! - `POST token/refresh/` with `{refresh}` returns `{access, refresh?}`
//! - `POST logout/` with `{refresh}` blacklists the refresh token (205)

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{truncate_body, AuthApiError};
use crate::auth::CredentialPair;

/// Result of a refresh exchange. Servers that do not rotate refresh tokens
/// return only `access`.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl RefreshedTokens {
    /// The complete replacement pair, keeping `previous_refresh` when the
    /// server did not rotate it.
    pub fn into_pair(self, previous_refresh: &str) -> CredentialPair {
        let refresh = self
            .refresh
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| previous_refresh.to_string());
        CredentialPair::new(self.access, refresh)
    }
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange username and password for a credential pair.
    async fn obtain(&self, username: &str, password: &str)
        -> Result<CredentialPair, AuthApiError>;

    /// Exchange a refresh token for new tokens.
    async fn refresh(&self, refresh: &str) -> Result<RefreshedTokens, AuthApiError>;

    /// Ask the server to blacklist the pair's refresh token.
    async fn revoke(&self, pair: &CredentialPair) -> Result<(), AuthApiError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

/// [`AuthApi`] over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthApi {
    client: Client,
    token_url: Url,
    refresh_url: Url,
    logout_url: Url,
}

impl HttpAuthApi {
    pub fn new(client: Client, auth_base: &Url) -> Result<Self> {
        Ok(Self {
            client,
            token_url: auth_base.join("token/").context("Invalid token endpoint")?,
            refresh_url: auth_base
                .join("token/refresh/")
                .context("Invalid refresh endpoint")?,
            logout_url: auth_base.join("logout/").context("Invalid logout endpoint")?,
        })
    }

    async fn rejection(response: Response) -> AuthApiError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.detail)
            .unwrap_or_else(|| truncate_body(&body));
        AuthApiError::Rejected { status, detail }
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn obtain(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialPair, AuthApiError> {
        let response = self
            .client
            .post(self.token_url.clone())
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        response
            .json::<CredentialPair>()
            .await
            .map_err(|e| AuthApiError::InvalidResponse(e.to_string()))
    }

    async fn refresh(&self, refresh: &str) -> Result<RefreshedTokens, AuthApiError> {
        let response = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        response
            .json::<RefreshedTokens>()
            .await
            .map_err(|e| AuthApiError::InvalidResponse(e.to_string()))
    }

    async fn revoke(&self, pair: &CredentialPair) -> Result<(), AuthApiError> {
        let response = self
            .client
            .post(self.logout_url.clone())
            .bearer_auth(&pair.access)
            .json(&RefreshRequest {
                refresh: &pair.refresh,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        debug!(status = %response.status(), "Refresh token revoked");
        Ok(())
    }
}
