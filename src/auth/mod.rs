//! # Broker Token Issuance
//!
//! Short-lived signed bearer tokens for the broker handshake. Tokens are
//! scoped to the system principal with an audience of the broker itself and a
//! TTL measured in minutes, so a leaked token goes stale quickly.

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// JWT claims for the system principal connecting to the broker
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SystemClaims {
    /// Subject (the system principal)
    pub sub: String,
    /// Token audience (the broker)
    pub aud: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at time (Unix timestamp)
    pub iat: i64,
    /// Token type tag
    pub token_type: String,
}

/// Issues signed bearer tokens for broker connections
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, subject: &str) -> Result<String, AuthError>;
}

/// HS256 token issuer backed by a shared secret
pub struct JwtTokenIssuer {
    encoding_key: EncodingKey,
    audience: String,
    ttl_minutes: i64,
}

impl JwtTokenIssuer {
    pub fn new(secret: &str, audience: impl Into<String>, ttl_minutes: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            audience: audience.into(),
            ttl_minutes: ttl_minutes as i64,
        }
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(&self, subject: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let expiry = now + Duration::minutes(self.ttl_minutes);

        let claims = SystemClaims {
            sub: subject.to_string(),
            aud: self.audience.clone(),
            exp: expiry.timestamp(),
            iat: now.timestamp(),
            token_type: "system".to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        debug!(
            subject = %subject,
            expiry_timestamp = expiry.timestamp(),
            "issued broker bearer token"
        );
        Ok(token)
    }
}

/// Token issuance errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}
