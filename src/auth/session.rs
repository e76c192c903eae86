//! Persisted session state
//!
//! Four keys make up a session in the key-value store:
//! `token`, `token_expires` (RFC 3339), `user` (JSON) and
//! `user_cache_time` (epoch milliseconds).

use crate::auth::storage::KeyValueStore;
use crate::error::AppError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub const KEY_TOKEN: &str = "token";
pub const KEY_TOKEN_EXPIRES: &str = "token_expires";
pub const KEY_USER: &str = "user";
pub const KEY_USER_CACHE_TIME: &str = "user_cache_time";

const ALL_KEYS: [&str; 4] = [KEY_TOKEN, KEY_TOKEN_EXPIRES, KEY_USER, KEY_USER_CACHE_TIME];

/// In-memory mirror of the persisted session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionAuthState {
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cached_user: Option<Value>,
    pub cached_at: Option<DateTime<Utc>>,
}

impl SessionAuthState {
    /// Read the session from `store`. Unparseable values are dropped with a
    /// warning rather than failing the load.
    pub fn load(store: &dyn KeyValueStore) -> Result<Self, AppError> {
        let token = store.get(KEY_TOKEN)?;

        let expires_at = store.get(KEY_TOKEN_EXPIRES)?.and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| warn!("Ignoring malformed {}: {}", KEY_TOKEN_EXPIRES, e))
                .ok()
        });

        let cached_user = store.get(KEY_USER)?.and_then(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| warn!("Ignoring malformed {}: {}", KEY_USER, e))
                .ok()
        });

        let cached_at = store.get(KEY_USER_CACHE_TIME)?.and_then(|raw| {
            raw.parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        });

        Ok(Self {
            token,
            expires_at,
            cached_user,
            cached_at,
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Whether the cached user is younger than `ttl`
    pub fn user_is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match (&self.cached_user, self.cached_at) {
            (Some(_), Some(at)) => now - at < ttl,
            _ => false,
        }
    }

    pub fn save_token(
        &mut self,
        store: &dyn KeyValueStore,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        store.set(KEY_TOKEN, token)?;
        store.set(KEY_TOKEN_EXPIRES, &expires_at.to_rfc3339())?;
        self.token = Some(token.to_string());
        self.expires_at = Some(expires_at);
        Ok(())
    }

    pub fn save_user(
        &mut self,
        store: &dyn KeyValueStore,
        user: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        store.set(KEY_USER, &serde_json::to_string(user)?)?;
        store.set(KEY_USER_CACHE_TIME, &at.timestamp_millis().to_string())?;
        self.cached_user = Some(user.clone());
        self.cached_at = Some(at);
        Ok(())
    }

    pub fn evict_user(&mut self, store: &dyn KeyValueStore) -> Result<(), AppError> {
        self.cached_user = None;
        self.cached_at = None;
        store.remove(KEY_USER)?;
        store.remove(KEY_USER_CACHE_TIME)?;
        Ok(())
    }

    /// Forget everything. Every key is attempted even if an earlier removal
    /// fails; the first failure is returned.
    pub fn clear(&mut self, store: &dyn KeyValueStore) -> Result<(), AppError> {
        *self = Self::default();

        let mut first_err = None;
        for key in ALL_KEYS {
            if let Err(e) = store.remove(key) {
                warn!("Failed to remove {} from session store: {}", key, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
