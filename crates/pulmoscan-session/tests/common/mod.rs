//! In-process PulmoScan API for integration tests.
//!
//! Serves the authorization endpoints under `/api/auth/` and a few protected
//! routes that verify bearer tokens the way the real server does.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{json, Value};

use pulmoscan_session::auth::{CredentialPair, MemoryStorage};
use pulmoscan_session::{Config, SessionManager, StorageKind};

pub const SECRET: &[u8] = b"integration-secret";
pub const PASSWORD: &str = "inhale-exhale";

static NEXT_JTI: AtomicU64 = AtomicU64::new(1);

type Rejection = (StatusCode, Json<Value>);

fn detail(status: StatusCode, message: &str) -> Rejection {
    (status, Json(json!({ "detail": message })))
}

pub fn mint_access(username: &str, role: &str, lifetime: Duration) -> String {
    let now = Utc::now();
    let claims = json!({
        "token_type": "access",
        "user_id": 42,
        "username": username,
        "email": format!("{}@pulmoscan.test", username),
        "role": role,
        "is_staff": role == "admin",
        "iat": now.timestamp(),
        "exp": (now + lifetime).timestamp(),
        "jti": NEXT_JTI.fetch_add(1, Ordering::Relaxed).to_string(),
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET))
        .expect("access token should encode")
}

pub fn mint_refresh(username: &str, role: &str, lifetime: Duration) -> String {
    let claims = json!({
        "token_type": "refresh",
        "username": username,
        "role": role,
        "exp": (Utc::now() + lifetime).timestamp(),
        "jti": NEXT_JTI.fetch_add(1, Ordering::Relaxed).to_string(),
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET))
        .expect("refresh token should encode")
}

/// A stored pair whose access token expired `ago` ago.
pub fn expired_pair(username: &str, role: &str, ago: Duration) -> CredentialPair {
    CredentialPair::new(
        mint_access(username, role, -ago),
        mint_refresh(username, role, Duration::days(1)),
    )
}

fn verify(token: &str) -> Option<Value> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    decode::<Value>(token, &DecodingKey::from_secret(SECRET), &validation)
        .ok()
        .map(|data| data.claims)
}

#[derive(Default)]
pub struct MockServer {
    pub reject_refresh: AtomicBool,
    pub refresh_delay_ms: AtomicU64,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    pub last_bearer: Mutex<Option<String>>,
}

impl MockServer {
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    pub fn last_bearer(&self) -> Option<String> {
        self.last_bearer.lock().unwrap().clone()
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<Value, Rejection> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                detail(StatusCode::UNAUTHORIZED, "Authentication credentials were not provided.")
            })?;
        *self.last_bearer.lock().unwrap() = Some(token.to_string());
        verify(token)
            .filter(|claims| claims["token_type"] == "access")
            .ok_or_else(|| detail(StatusCode::UNAUTHORIZED, "Given token not valid for any token type"))
    }
}

async fn obtain(Json(body): Json<Value>) -> Result<Json<Value>, Rejection> {
    let username = body["username"].as_str().unwrap_or_default();
    if body["password"] != PASSWORD {
        return Err(detail(
            StatusCode::UNAUTHORIZED,
            "No active account found with the given credentials",
        ));
    }
    // Usernames double as roles so tests choose who signs in.
    let role = match username {
        "admin" | "doctor" | "pharmacist" => username,
        _ => "N/A",
    };
    Ok(Json(json!({
        "access": mint_access(username, role, Duration::minutes(5)),
        "refresh": mint_refresh(username, role, Duration::days(1)),
    })))
}

async fn refresh(
    State(server): State<Arc<MockServer>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, Rejection> {
    server.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = server.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(StdDuration::from_millis(delay)).await;
    }
    if server.reject_refresh.load(Ordering::SeqCst) {
        return Err(detail(StatusCode::UNAUTHORIZED, "Token is invalid or expired"));
    }
    let claims = body["refresh"]
        .as_str()
        .and_then(verify)
        .filter(|claims| claims["token_type"] == "refresh")
        .ok_or_else(|| detail(StatusCode::UNAUTHORIZED, "Token is invalid or expired"))?;

    let username = claims["username"].as_str().unwrap_or_default();
    let role = claims["role"].as_str().unwrap_or("N/A");
    Ok(Json(json!({
        "access": mint_access(username, role, Duration::minutes(5)),
        "refresh": mint_refresh(username, role, Duration::days(1)),
    })))
}

async fn logout(State(server): State<Arc<MockServer>>, Json(body): Json<Value>) -> StatusCode {
    if body["refresh"].as_str().and_then(verify).is_none() {
        return StatusCode::BAD_REQUEST;
    }
    server.revoke_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::RESET_CONTENT
}

async fn medicines(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Rejection> {
    server.authorize(&headers)?;
    Ok(Json(json!([
        { "id": 1, "name": "Salbutamol", "stock": 120 },
        { "id": 2, "name": "Budesonide", "stock": 45 },
    ])))
}

async fn admin_users(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Rejection> {
    let claims = server.authorize(&headers)?;
    if claims["role"] != "admin" {
        return Err(detail(
            StatusCode::FORBIDDEN,
            "You do not have permission to perform this action.",
        ));
    }
    Ok(Json(json!([{ "id": 42, "username": "admin" }])))
}

/// Rejects every credential, like a server whose signing key rotated.
async fn revoked(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Rejection> {
    server.authorize(&headers)?;
    Err(detail(StatusCode::UNAUTHORIZED, "Token is blacklisted"))
}

pub async fn spawn_server() -> anyhow::Result<(SocketAddr, Arc<MockServer>)> {
    let server = Arc::new(MockServer::default());
    let router = Router::new()
        .route("/api/auth/token/", post(obtain))
        .route("/api/auth/token/refresh/", post(refresh))
        .route("/api/auth/logout/", post(logout))
        .route("/api/medicines/", get(medicines))
        .route("/api/admin/users/", get(admin_users))
        .route("/api/revoked/", get(revoked))
        .with_state(Arc::clone(&server));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, server))
}

pub fn config_for(addr: SocketAddr) -> Config {
    Config {
        api_base_url: format!("http://{}/api/", addr),
        storage: StorageKind::Memory,
        ..Config::default()
    }
}

/// A session against a fresh server, optionally restoring `pair`.
pub async fn session_with(
    pair: Option<&CredentialPair>,
) -> (SessionManager, Arc<MockServer>, Arc<MemoryStorage>) {
    let (addr, server) = spawn_server().await.expect("mock server should start");
    let storage = Arc::new(match pair {
        Some(pair) => MemoryStorage::with_value(serde_json::to_string(pair).unwrap()),
        None => MemoryStorage::new(),
    });
    let session = SessionManager::new(&config_for(addr), storage.clone())
        .expect("session should build");
    (session, server, storage)
}

pub fn stored_pair(storage: &MemoryStorage) -> Option<CredentialPair> {
    storage
        .value()
        .map(|raw| serde_json::from_str(&raw).expect("stored pair should parse"))
}
