//! Token claim decoding.
//!
//! Access and refresh tokens are JWTs issued by the PulmoScan authorization
//! server. The client only reads the payload segment; the signature is checked
//! by the server on every call, so nothing here verifies it.

use std::fmt;
use std::str::FromStr;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// base64url that accepts payloads with or without `=` padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token must have 3 dot-separated segments, found {0}")]
    Segments(usize),

    #[error("token payload is not valid base64url: {0}")]
    Base64(String),

    #[error("token claims are invalid: {0}")]
    Claims(String),
}

/// Roles the authorization server can place in a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Pharmacist,
    /// Anything outside the known set, including the server's `"N/A"`
    /// fallback for accounts without a profile. No guard grants it.
    #[serde(other)]
    Unassigned,
}

impl Role {
    /// Roles that can be granted access by a guard.
    pub const ASSIGNABLE: [Role; 3] = [Role::Admin, Role::Doctor, Role::Pharmacist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Pharmacist => "pharmacist",
            Role::Unassigned => "unassigned",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "doctor" => Ok(Role::Doctor),
            "pharmacist" => Ok(Role::Pharmacist),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "user_id", deserialize_with = "string_or_number")]
    pub subject_id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(rename = "exp", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(
        rename = "iat",
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

#[derive(Deserialize)]
struct ExpiryOnly {
    #[serde(with = "chrono::serde::ts_seconds")]
    exp: DateTime<Utc>,
}

// Django emits `user_id` as an integer; some deployments stringify it.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

fn payload(token: &str) -> Result<Vec<u8>, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::Segments(segments.len()));
    }
    PAYLOAD_ENGINE
        .decode(segments[1])
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// Decode the claims of an access token.
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let bytes = payload(token)?;
    serde_json::from_slice(&bytes).map_err(|e| DecodeError::Claims(e.to_string()))
}

/// Read only the expiry of a token. Refresh tokens may not carry the full
/// identity claim set, so they are checked with this instead of [`decode`].
pub fn decode_expiry(token: &str) -> Result<DateTime<Utc>, DecodeError> {
    let bytes = payload(token)?;
    serde_json::from_slice::<ExpiryOnly>(&bytes)
        .map(|e| e.exp)
        .map_err(|e| DecodeError::Claims(e.to_string()))
}

/// Time remaining until `claims` expire. Negative once expired.
pub fn time_to_expiry(claims: &Claims, now: DateTime<Utc>) -> Duration {
    claims.expires_at - now
}

/// Whether the token expires within `skew` of `now`.
pub fn is_expiring(claims: &Claims, now: DateTime<Utc>, skew: Duration) -> bool {
    time_to_expiry(claims, now) <= skew
}
