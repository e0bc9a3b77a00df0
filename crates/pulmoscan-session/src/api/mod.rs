//! HTTP side of the session.
//!
//! - `HttpAuthApi` talks to the authorization server (login, refresh, logout)
//! - `AuthorizedClient` sends PulmoScan API requests with a fresh bearer token
//!
//! Tokens are JWTs issued by the `auth/token/` endpoint.

pub mod auth;
pub mod error;
pub mod gateway;

pub use auth::{AuthApi, HttpAuthApi, RefreshedTokens};
pub use error::{ApiError, AuthApiError};
pub use gateway::{AuthorizedClient, RequestSpec};
