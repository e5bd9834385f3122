use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

use crate::{collaborators::CredentialVerifier, error::AuthError};

#[derive(Debug, Clone)]
pub struct JwtAuthority {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    id: i64,
    iat: i64,
    exp: i64,
}

impl JwtAuthority {
    pub fn new(secret: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_seconds,
        }
    }

    pub fn mint(&self, user_id: UserId) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.ttl_seconds);
        let claims = Claims {
            id: user_id.0,
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }

    pub fn decode_user(&self, token: &str) -> Result<UserId, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| AuthError::Invalid(e.to_string()))?;
        Ok(UserId(data.claims.id))
    }
}

#[async_trait]
impl CredentialVerifier for JwtAuthority {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.decode_user(token)
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
