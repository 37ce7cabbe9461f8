//! Credential handling.
//!
//! WebSocket clients present the identity provider's RS256 access token, the
//! same one the REST API accepts. Only the public key is loaded here; this
//! service never mints tokens. The token subject is the provider's user id
//! and is mapped to an internal user through the [`UserDirectory`].
//! Internal callers (write-path controllers) authenticate with a shared
//! bearer token when one is configured.

use crate::error::{AppError, RealtimeError};
use crate::models::Identity;
use crate::services::UserDirectory;
use actix_web::HttpRequest;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;

/// Resolves a client credential to a user identity. Called once per
/// connection, during the handshake.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, credential: &str) -> Result<Identity, RealtimeError>;
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    token_type: Option<String>,
}

/// Claims that survived signature, expiry, audience and issuer checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: String,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
    users: Arc<dyn UserDirectory>,
}

impl JwtIdentityResolver {
    /// RS256 only. No symmetric fallback. Without an audience the `aud`
    /// claim is not checked.
    pub fn from_rsa_pem(public_key_pem: &str, users: Arc<dyn UserDirectory>) -> anyhow::Result<Self> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .context("invalid RSA public key PEM")?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        Ok(Self {
            key,
            validation,
            users,
        })
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedToken, RealtimeError> {
        let data = decode::<AccessClaims>(token, &self.key, &self.validation)
            .map_err(|e| RealtimeError::AuthenticationFailure(format!("invalid token: {e}")))?;
        let claims = data.claims;

        if claims.token_type.as_deref() == Some("refresh") {
            return Err(RealtimeError::AuthenticationFailure(
                "refresh tokens cannot open realtime sessions".into(),
            ));
        }
        if claims.sub.trim().is_empty() {
            return Err(RealtimeError::AuthenticationFailure("token has no subject".into()));
        }

        Ok(VerifiedToken {
            subject: claims.sub,
            expires_at: Utc.timestamp_opt(claims.exp, 0).single(),
        })
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve_identity(&self, credential: &str) -> Result<Identity, RealtimeError> {
        let token = self.verify(credential)?;
        let user_id = self
            .users
            .user_for_subject(&token.subject)
            .await?
            .ok_or_else(|| {
                RealtimeError::AuthenticationFailure("no user linked to token subject".into())
            })?;

        Ok(Identity {
            user_id,
            expires_at: token.expires_at,
        })
    }
}

/// `Authorization: Bearer <token>` value, if present.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Guard for the internal API. With no token configured every caller is
/// accepted (the API is expected to sit behind the cluster network).
pub fn require_internal_token(req: &HttpRequest, expected: Option<&str>) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match bearer_token(req) {
        Some(token) if token == expected => Ok(()),
        Some(_) => {
            tracing::warn!(path = req.path(), "internal API call with wrong token");
            Err(AppError::Unauthorized)
        }
        None => Err(AppError::Unauthorized),
    }
}
