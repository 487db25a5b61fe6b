//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `AuthUser` - End-user authentication via HS256 bearer JWT
//! - `AdminAuth` - Operator authentication via the `x-admin-key` header

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use muse_core::{Caller, UserId};

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// JWT claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Expiration time.
    pub exp: i64,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Plan and role flags.
    #[serde(default)]
    pub app_metadata: AppMetadata,
}

/// Role flags carried in the token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Operator account.
    #[serde(default)]
    pub is_admin: bool,
    /// Paid subscriber.
    #[serde(default)]
    pub is_premium: bool,
}

/// An authenticated user extracted from a bearer JWT.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user ID.
    pub user_id: UserId,
    /// Identity and plan flags used by the eligibility gate.
    pub caller: Caller,
}

impl AuthUser {
    /// Verify `token` against the configured secret.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Unauthorized` if no secret is configured or the
    /// token is invalid, expired, or carries a malformed subject.
    pub fn from_token(token: &str, secret: &str, audience: Option<&str>) -> Result<Self, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let claims = decode::<JwtClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            ApiError::Unauthorized
        })?
        .claims;

        let user_id = claims
            .sub
            .parse::<UserId>()
            .map_err(|_| ApiError::Unauthorized)?;

        Ok(Self {
            user_id,
            caller: Caller {
                user_id,
                is_admin: claims.app_metadata.is_admin,
                is_premium: claims.app_metadata.is_premium,
            },
        })
    }
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let token = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or(ApiError::Unauthorized)?;

            let secret = state.config.auth_jwt_secret.as_deref().ok_or_else(|| {
                tracing::warn!("AUTH_JWT_SECRET not set - rejecting user request");
                ApiError::Unauthorized
            })?;

            Self::from_token(token, secret, state.config.auth_audience.as_deref())
        })
    }
}

/// Operator authentication via API key.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let api_key = parts
                .headers
                .get("x-admin-key")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            let expected_key = state
                .config
                .admin_api_key
                .as_deref()
                .ok_or(ApiError::Forbidden)?;

            if !constant_time_eq(api_key, expected_key) {
                return Err(ApiError::Unauthorized);
            }

            Ok(AdminAuth)
        })
    }
}
