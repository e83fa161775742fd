use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired at {0}")]
    Expired(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Restaurant,
    Driver,
    Admin,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Authenticated session identity, created at login and dropped at logout.
///
/// Claims are read from the bearer token without verifying the signature;
/// the server verifies the token during the channel handshake.
#[derive(Clone)]
pub struct Session {
    pub user_id: Arc<str>,
    pub role: Role,
    pub expires_at: Option<u64>,
    token: Arc<str>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn from_token(token: &str) -> Result<Self, AuthError> {
        let claims = decode_claims(token)?;

        if claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty sub".into()));
        }

        if let Some(exp) = claims.exp {
            if exp <= unix_now() {
                return Err(AuthError::Expired(exp));
            }
        }

        Ok(Self {
            user_id: Arc::from(claims.sub.as_str()),
            role: claims.role.unwrap_or(Role::Customer),
            expires_at: claims.exp,
            token: Arc::from(token),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

fn decode_claims(token: &str) -> Result<Claims, AuthError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Invalid("malformed JWT".into()));
    }

    let payload_bytes = base64_url_decode(parts[1])
        .map_err(|e| AuthError::Invalid(format!("base64 decode error: {e}")))?;

    serde_json::from_slice(&payload_bytes)
        .map_err(|e| AuthError::Invalid(format!("invalid claims: {e}")))
}

fn base64_url_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| e.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
pub(crate) fn test_token(sub: &str, role: &str, exp: Option<u64>) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let mut claims = serde_json::json!({ "sub": sub, "role": role });
    if let Some(exp) = exp {
        claims["exp"] = exp.into();
    }
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}
