//! Network side of authentication
//!
//! [`AuthBackend`] is the seam between the session lifecycle and whatever
//! issues tokens. [`HttpAuthBackend`] talks to a JSON API through
//! [`ApiClient`].

use crate::error::AppError;
use crate::http::ApiClient;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Lifetime assumed when a token response carries no expiry
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A bearer token and the instant it stops working
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Token response as sent by the server
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token", alias = "accessToken")]
    token: String,
    #[serde(default, alias = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_grant(self, now: DateTime<Utc>) -> Result<TokenGrant, AppError> {
        if self.token.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Token response has an empty token".to_string(),
            ));
        }
        let expires_at = self.expires_at.unwrap_or_else(|| {
            now + Duration::seconds(self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
        });
        Ok(TokenGrant {
            token: self.token,
            expires_at,
        })
    }
}

/// Parse a token response body, normalizing the expiry to an absolute instant
pub fn parse_token_response(body: Value, now: DateTime<Utc>) -> Result<TokenGrant, AppError> {
    serde_json::from_value::<TokenResponse>(body)?.into_grant(now)
}

pub trait AuthBackend: Send + Sync {
    fn login(&self, credentials: &Credentials) -> BoxFuture<'static, Result<TokenGrant, AppError>>;
    fn refresh(&self, token: &str) -> BoxFuture<'static, Result<TokenGrant, AppError>>;
    fn fetch_profile(&self, token: &str) -> BoxFuture<'static, Result<Value, AppError>>;
}

/// Endpoint paths relative to the API base URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPaths {
    pub login: String,
    pub refresh: String,
    pub profile: String,
}

impl Default for AuthPaths {
    fn default() -> Self {
        Self {
            login: "auth/login".to_string(),
            refresh: "auth/refresh".to_string(),
            profile: "auth/me".to_string(),
        }
    }
}

pub struct HttpAuthBackend {
    api: Arc<ApiClient>,
    paths: AuthPaths,
}

impl HttpAuthBackend {
    pub fn new(api: Arc<ApiClient>, paths: AuthPaths) -> Self {
        Self { api, paths }
    }
}

impl AuthBackend for HttpAuthBackend {
    fn login(&self, credentials: &Credentials) -> BoxFuture<'static, Result<TokenGrant, AppError>> {
        let api = Arc::clone(&self.api);
        let path = self.paths.login.clone();
        let body = json!({
            "username": credentials.username,
            "password": credentials.password,
        });
        async move {
            debug!("Logging in via {}", path);
            let response = api.post_json(&path, &body, None).await?;
            parse_token_response(response, Utc::now())
        }
        .boxed()
    }

    fn refresh(&self, token: &str) -> BoxFuture<'static, Result<TokenGrant, AppError>> {
        let api = Arc::clone(&self.api);
        let path = self.paths.refresh.clone();
        let token = token.to_string();
        async move {
            let response = api.post_json(&path, &json!({}), Some(&token)).await?;
            parse_token_response(response, Utc::now())
        }
        .boxed()
    }

    fn fetch_profile(&self, token: &str) -> BoxFuture<'static, Result<Value, AppError>> {
        let api = Arc::clone(&self.api);
        let path = self.paths.profile.clone();
        let token = token.to_string();
        async move { api.get_direct(&path, Some(&token)).await }.boxed()
    }
}
