//! Token lifecycle under concurrent callers
//!
//! Expiry and user-cache checks are local and synchronous. Refresh and
//! profile fetches go through a [`RequestGateway`] keyed by fixed
//! signatures, so any number of callers racing at start-up share a single
//! round trip. A failed refresh drops the whole session.
//!
//! Every login and clear starts a new session epoch. Producers remember the
//! epoch they were issued under and never write back into a later session.

use crate::auth::backend::{AuthBackend, Credentials, TokenGrant};
use crate::auth::session::SessionAuthState;
use crate::auth::storage::KeyValueStore;
use crate::clock::{Clock, SystemClock};
use crate::error::AppError;
use crate::gateway::cache::CachePolicy;
use crate::gateway::signature::{TOKEN_REFRESH, USER_PROFILE};
use crate::gateway::RequestGateway;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Refresh when the token expires within this window
pub const REFRESH_BUFFER_SECS: i64 = 600;

/// How long a fetched user profile is trusted
pub const USER_CACHE_TTL_SECS: i64 = 300;

/// Window in seconds used by [`AuthLifecycle::is_token_usable`], the
/// lightweight "can I send this token right now" check. Kept apart from the
/// refresh buffer; the two are configured independently.
pub const QUICK_CHECK_BUFFER_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub refresh_buffer: Duration,
    pub user_cache_ttl: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::seconds(REFRESH_BUFFER_SECS),
            user_cache_ttl: Duration::seconds(USER_CACHE_TTL_SECS),
        }
    }
}

/// `now + buffer >= expires_at`; a missing expiry is treated as expired
pub fn near_expiry(now: DateTime<Utc>, expires_at: Option<DateTime<Utc>>, buffer: Duration) -> bool {
    match expires_at {
        Some(expires_at) => now + buffer >= expires_at,
        None => true,
    }
}

/// Outcomes shared through the auth gateway
#[derive(Debug, Clone)]
enum AuthPayload {
    Token(TokenGrant),
    Profile(Value),
}

/// Auth calls are deduplicated within one session only
fn session_signature(base: &str, epoch: u64) -> String {
    format!("{}#{}", base, epoch)
}

/// Snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub logged_in: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub near_expiry: bool,
    pub token_usable: bool,
    pub user_cached: bool,
    pub last_check: Option<DateTime<Utc>>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn AuthBackend>,
    gateway: RequestGateway<AuthPayload>,
    clock: Arc<dyn Clock>,
    settings: AuthSettings,
    state: RwLock<SessionAuthState>,
    epoch: AtomicU64,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

impl Inner {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a new epoch with an empty session. Caller holds the state lock.
    fn reset(&self, state: &mut SessionAuthState) -> Result<(), AppError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.last_check.lock() = None;
        state.clear(self.store.as_ref())
    }

    fn clear_state(&self) -> Result<(), AppError> {
        self.reset(&mut self.state.write())
    }

    /// Clear only if no login or clear happened since `epoch`
    fn clear_state_at(&self, epoch: u64) -> Result<(), AppError> {
        let mut state = self.state.write();
        if self.epoch() != epoch {
            debug!("Session already replaced, nothing to clear");
            return Ok(());
        }
        self.reset(&mut state)
    }

    /// Run `update` on the session issued under `epoch`. A session that has
    /// since been cleared or replaced is left alone.
    fn update_session<R>(
        &self,
        epoch: u64,
        update: impl FnOnce(&mut SessionAuthState, &dyn KeyValueStore) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        let mut state = self.state.write();
        if self.epoch() != epoch {
            return Err(AppError::Unauthorized(
                "Session ended while the request was in flight".to_string(),
            ));
        }
        update(&mut state, self.store.as_ref())
    }

    fn current_token(&self) -> Result<String, AppError> {
        self.state
            .read()
            .token
            .clone()
            .ok_or_else(|| AppError::Unauthorized("Not logged in".to_string()))
    }
}

/// Owns the session state; cheap to clone
#[derive(Clone)]
pub struct AuthLifecycle {
    inner: Arc<Inner>,
}

impl AuthLifecycle {
    /// Load any persisted session from `store`
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn AuthBackend>,
        settings: AuthSettings,
    ) -> Result<Self, AppError> {
        Self::with_clock(store, backend, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn AuthBackend>,
        settings: AuthSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let state = SessionAuthState::load(store.as_ref())?;
        let gateway = RequestGateway::with_clock("auth", CachePolicy::default(), Arc::clone(&clock));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                backend,
                gateway,
                clock,
                settings,
                state: RwLock::new(state),
                epoch: AtomicU64::new(0),
                last_check: Mutex::new(None),
            }),
        })
    }

    /// Exchange credentials for a token and start a fresh session
    pub async fn login(&self, credentials: &Credentials) -> Result<TokenGrant, AppError> {
        let grant = self.inner.backend.login(credentials).await?;
        {
            let mut state = self.inner.state.write();
            self.inner.reset(&mut state)?;
            state.save_token(self.inner.store.as_ref(), &grant.token, grant.expires_at)?;
        }
        info!("Logged in as {}", credentials.username);
        Ok(grant)
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.read().token.clone()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().expires_at
    }

    pub fn is_near_expiry(&self) -> bool {
        let now = self.inner.clock.now();
        let state = self.inner.state.read();
        !state.has_token() || near_expiry(now, state.expires_at, self.inner.settings.refresh_buffer)
    }

    /// Token present and not within [`QUICK_CHECK_BUFFER_SECS`] of expiring
    pub fn is_token_usable(&self) -> bool {
        let now = self.inner.clock.now();
        let buffer = Duration::seconds(QUICK_CHECK_BUFFER_SECS);
        let state = self.inner.state.read();
        state.has_token() && !near_expiry(now, state.expires_at, buffer)
    }

    /// The persisted user, if fetched within the user cache TTL. A stale
    /// entry is evicted.
    pub fn get_cached_user(&self) -> Option<Value> {
        let now = self.inner.clock.now();
        {
            let state = self.inner.state.read();
            if state.user_is_fresh(now, self.inner.settings.user_cache_ttl) {
                return state.cached_user.clone();
            }
            if state.cached_user.is_none() && state.cached_at.is_none() {
                return None;
            }
        }

        debug!("Evicting stale cached user");
        if let Err(e) = self.inner.state.write().evict_user(self.inner.store.as_ref()) {
            warn!("Failed to evict cached user: {}", e);
        }
        None
    }

    /// Refresh the token. Concurrent callers share one backend call; a
    /// failure clears the session.
    pub async fn refresh_token(&self) -> Result<String, AppError> {
        let inner = Arc::clone(&self.inner);
        let epoch = inner.epoch();
        let sig = session_signature(TOKEN_REFRESH, epoch);
        let call = self.inner.gateway.call_uncached(&sig, move || async move {
            let outcome = match inner.current_token() {
                Ok(current) => inner.backend.refresh(&current).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(grant) => {
                    inner.update_session(epoch, |state, store| {
                        state.save_token(store, &grant.token, grant.expires_at)
                    })?;
                    debug!("Token refreshed, expires {}", grant.expires_at);
                    Ok(AuthPayload::Token(grant))
                }
                Err(err) => {
                    warn!("Token refresh failed, clearing session: {}", err);
                    if let Err(e) = inner.clear_state_at(epoch) {
                        warn!("Failed to clear session: {}", e);
                    }
                    Err(err)
                }
            }
        });

        match call.await? {
            AuthPayload::Token(grant) => Ok(grant.token),
            AuthPayload::Profile(_) => Err(AppError::Internal(
                "token refresh produced a profile".to_string(),
            )),
        }
    }

    /// Fetch the user profile with the current token and cache it.
    /// Concurrent callers share one backend call.
    pub async fn fetch_profile(&self) -> Result<Value, AppError> {
        let inner = Arc::clone(&self.inner);
        let epoch = inner.epoch();
        let sig = session_signature(USER_PROFILE, epoch);
        let call = self.inner.gateway.call_uncached(&sig, move || async move {
            let token = inner.current_token()?;
            let user = inner.backend.fetch_profile(&token).await?;
            let now = inner.clock.now();
            inner.update_session(epoch, |state, store| state.save_user(store, &user, now))?;
            Ok(AuthPayload::Profile(user))
        });

        match call.await? {
            AuthPayload::Profile(user) => Ok(user),
            AuthPayload::Token(_) => Err(AppError::Internal(
                "profile fetch produced a token".to_string(),
            )),
        }
    }

    /// Make sure the session is usable and return the user.
    ///
    /// Refreshes first when the token is near expiry. A profile failure right
    /// after a refresh is retried once; a 401 on a token that was not just
    /// refreshed triggers one refresh and one retry. When the retry fails too,
    /// the session is cleared.
    pub async fn ensure_session(&self) -> Result<Value, AppError> {
        if !self.inner.state.read().has_token() {
            return Err(AppError::Unauthorized("Not logged in".to_string()));
        }
        *self.inner.last_check.lock() = Some(self.inner.clock.now());

        let mut refreshed = false;
        if self.is_near_expiry() {
            self.refresh_token().await?;
            refreshed = true;
        }

        if let Some(user) = self.get_cached_user() {
            return Ok(user);
        }

        match self.fetch_profile().await {
            Ok(user) => Ok(user),
            Err(err) if refreshed => {
                debug!("Profile fetch after refresh failed, retrying once: {}", err);
                self.retry_profile_or_clear().await
            }
            Err(AppError::Unauthorized(msg)) => {
                debug!("Profile fetch rejected ({}), refreshing and retrying", msg);
                self.refresh_token().await?;
                self.retry_profile_or_clear().await
            }
            Err(err) => Err(err),
        }
    }

    async fn retry_profile_or_clear(&self) -> Result<Value, AppError> {
        match self.fetch_profile().await {
            Ok(user) => Ok(user),
            Err(err) => {
                warn!("Profile fetch failed again, clearing session: {}", err);
                self.clear_all()?;
                Err(err)
            }
        }
    }

    /// Remove token, expiry and cached user, and forget the last check
    pub fn clear_all(&self) -> Result<(), AppError> {
        self.inner.clear_state()
    }

    pub fn logout(&self) -> Result<(), AppError> {
        self.inner.gateway.clear(None);
        self.clear_all()?;
        info!("Logged out");
        Ok(())
    }

    /// When [`ensure_session`](Self::ensure_session) last ran
    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_check.lock()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.inner.state.read().clone();
        SessionStatus {
            logged_in: state.has_token(),
            expires_at: state.expires_at,
            near_expiry: self.is_near_expiry(),
            token_usable: self.is_token_usable(),
            user_cached: state.user_is_fresh(self.inner.clock.now(), self.inner.settings.user_cache_ttl),
            last_check: self.last_check(),
        }
    }
}
