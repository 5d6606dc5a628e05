//! Request authentication.
//!
//! Herald does not issue tokens — registration and login belong to the
//! account subsystem, which shares the HS256 secret with this server. The
//! boundary here only *verifies* bearer tokens and resolves the caller to a
//! local identity.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use herald_common::error::HeraldError;
use herald_common::models::Identity;

use crate::AppState;

/// JWT claims embedded in access tokens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (identity ID)
    pub sub: String,
    /// Full handle at issuance time
    pub handle: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// Validate and decode a bearer token.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/// Mint an access token for an identity. Used by the account subsystem's
/// tooling and the test suite; the messaging server itself never issues.
pub fn generate_access_token(
    identity: &Identity,
    secret: &str,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: identity.id.to_string(),
        handle: identity.handle().to_string(),
        iat: now.timestamp(),
        exp: now.timestamp() + ttl_secs,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

/// Extractor: the authenticated local identity behind the bearer token.
pub struct AuthIdentity(pub Identity);

impl FromRequestParts<Arc<AppState>> for AuthIdentity {
    type Rejection = HeraldError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(HeraldError::Unauthorized)?;
        let token = header.strip_prefix("Bearer ").ok_or(HeraldError::Unauthorized)?;

        let claims = validate_token(token, &state.config.auth.jwt_secret)
            .map_err(|_| HeraldError::Unauthorized)?;
        let id = Uuid::parse_str(&claims.sub).map_err(|_| HeraldError::Unauthorized)?;

        // Only local accounts hold sessions on this node.
        let identity = state
            .db
            .identities
            .find_by_id(id)
            .await?
            .filter(|i| i.is_local)
            .ok_or(HeraldError::Unauthorized)?;

        Ok(AuthIdentity(identity))
    }
}
