//! Process-wide wiring of gateway, API client and session lifecycle
//!
//! A [`Runtime`] can be built in isolation (tests, embedding) or installed
//! as the process-wide instance with [`init`]. Nothing is created lazily
//! behind the caller's back: until `init` runs, [`global`] is `None`.

use crate::auth::{
    open_default_store, AuthBackend, AuthLifecycle, Credentials, HttpAuthBackend, KeyValueStore,
    TokenGrant,
};
use crate::config::RuntimeConfig;
use crate::error::AppError;
use crate::gateway::{GatewayStats, RequestGateway};
use crate::http::{ApiClient, HttpRemoteSearch};
use crate::search::{Record, SearchCoordinator};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

static GLOBAL: Lazy<RwLock<Option<Arc<Runtime>>>> = Lazy::new(|| RwLock::new(None));

pub struct Runtime {
    config: RuntimeConfig,
    gateway: RequestGateway<Value>,
    api: Arc<ApiClient>,
    auth: AuthLifecycle,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build a runtime with an explicit store and auth backend
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn AuthBackend>,
    ) -> Result<Self, AppError> {
        let api = Self::api_client(&config)?;
        Self::assemble(config, api, store, backend)
    }

    /// Build a runtime talking to `config.api_base_url`, with session state in
    /// the OS keyring or the configured fallback file
    pub fn from_config(config: RuntimeConfig) -> Result<Self, AppError> {
        let api = Self::api_client(&config)?;
        let backend = Arc::new(HttpAuthBackend::new(Arc::clone(&api), config.auth.paths()));
        let store = open_default_store(config.auth.store_path.as_deref())?;
        Self::assemble(config, api, store, backend)
    }

    fn api_client(config: &RuntimeConfig) -> Result<Arc<ApiClient>, AppError> {
        let gateway = RequestGateway::new("api", config.cache.policy());
        Ok(Arc::new(ApiClient::new(
            &config.api_base_url,
            config.request_timeout(),
            gateway,
        )?))
    }

    fn assemble(
        config: RuntimeConfig,
        api: Arc<ApiClient>,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn AuthBackend>,
    ) -> Result<Self, AppError> {
        let auth = AuthLifecycle::new(store, backend, config.auth.settings())?;
        let gateway = api.gateway().clone();

        let sweeper = match (config.cache.sweep_interval(), tokio::runtime::Handle::try_current()) {
            (Some(interval), Ok(_)) => Some(gateway.spawn_sweeper(interval)),
            _ => None,
        };

        debug!("Runtime ready for {}", config.api_base_url);
        Ok(Self {
            config,
            gateway,
            api,
            auth,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn gateway(&self) -> &RequestGateway<Value> {
        &self.gateway
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn auth(&self) -> &AuthLifecycle {
        &self.auth
    }

    pub fn stats(&self) -> GatewayStats {
        self.gateway.stats()
    }

    /// Log in and attach the new token to API calls. Responses cached for
    /// the previous session are dropped.
    pub async fn login(&self, credentials: &Credentials) -> Result<TokenGrant, AppError> {
        let grant = self.auth.login(credentials).await?;
        self.api.set_bearer(Some(grant.token.clone()));
        Ok(grant)
    }

    /// GET through the gateway with the current session token attached
    pub async fn fetch(
        &self,
        path: &str,
        params: &[(&str, &str)],
        fresh: bool,
    ) -> Result<Value, AppError> {
        self.api.set_bearer(self.auth.token());
        if fresh {
            self.api.get_fresh(path, params).await
        } else {
            self.api.get(path, params).await
        }
    }

    /// Coordinator over `records`, optionally backed by `GET {remote_path}?q=`
    pub fn search_coordinator(
        &self,
        records: Vec<Record>,
        fields: Vec<String>,
        remote_path: Option<&str>,
    ) -> SearchCoordinator {
        let options = self.config.search.options();
        match remote_path {
            Some(path) => {
                self.api.set_bearer(self.auth.token());
                let remote = Arc::new(HttpRemoteSearch::new(Arc::clone(&self.api), path));
                SearchCoordinator::with_remote(records, fields, options, remote)
            }
            None => SearchCoordinator::new(records, fields, options),
        }
    }

    /// Drop every cached response and the whole session
    pub fn clear_all(&self) -> Result<(), AppError> {
        let removed = self.gateway.clear(None);
        self.api.set_bearer(None);
        self.auth.logout()?;
        info!("Cleared {} cached responses and the session", removed);
        Ok(())
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// Install `runtime` as the process-wide instance, replacing any previous one
pub fn init(runtime: Runtime) -> Arc<Runtime> {
    let runtime = Arc::new(runtime);
    if let Some(previous) = GLOBAL.write().replace(Arc::clone(&runtime)) {
        previous.stop_sweeper();
    }
    runtime
}

pub fn global() -> Option<Arc<Runtime>> {
    GLOBAL.read().clone()
}

/// Remove the process-wide instance and stop its background work
pub fn shutdown() -> Option<Arc<Runtime>> {
    let previous = GLOBAL.write().take();
    if let Some(runtime) = &previous {
        runtime.stop_sweeper();
    }
    previous
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;
    use chrono::{Duration, Utc};
    use futures::future::{BoxFuture, FutureExt};
    use serde_json::json;

    struct StaticBackend;

    impl AuthBackend for StaticBackend {
        fn login(&self, credentials: &Credentials) -> BoxFuture<'static, Result<TokenGrant, AppError>> {
            let token = format!("tok-{}", credentials.username);
            async move {
                Ok(TokenGrant {
                    token,
                    expires_at: Utc::now() + Duration::hours(1),
                })
            }
            .boxed()
        }

        fn refresh(&self, _: &str) -> BoxFuture<'static, Result<TokenGrant, AppError>> {
            async { Err(AppError::Unauthorized("no refresh".to_string())) }.boxed()
        }

        fn fetch_profile(&self, _: &str) -> BoxFuture<'static, Result<Value, AppError>> {
            async { Ok(json!({"name": "ada"})) }.boxed()
        }
    }

    fn runtime() -> Runtime {
        let mut config = RuntimeConfig::default();
        config.cache.sweep_interval_secs = 0;
        Runtime::new(config, Arc::new(MemoryStore::new()), Arc::new(StaticBackend)).unwrap()
    }

    #[tokio::test]
    async fn test_clear_all_drops_cache_and_session() {
        let rt = runtime();
        rt.auth()
            .login(&Credentials {
                username: "ada".to_string(),
                password: "pw".to_string(),
            })
            .await
            .unwrap();
        rt.gateway()
            .call("GET:/cached", || async { Ok::<_, AppError>(json!(1)) })
            .await
            .unwrap();
        assert_eq!(rt.gateway().len(), 1);

        rt.clear_all().unwrap();
        assert!(rt.gateway().is_empty());
        assert_eq!(rt.auth().token(), None);
    }

    fn credentials(username: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: "pw".to_string(),
        }
    }

    #[tokio::test]
    async fn test_switching_user_drops_cached_responses() {
        let rt = runtime();
        rt.login(&credentials("ada")).await.unwrap();
        rt.gateway()
            .call("GET:/me", || async { Ok::<_, AppError>(json!({"name": "ada"})) })
            .await
            .unwrap();
        assert!(rt.gateway().is_cached("GET:/me"));

        // Logging in again as the same user keeps the token, so the cache stays
        rt.login(&credentials("ada")).await.unwrap();
        assert!(rt.gateway().is_cached("GET:/me"));

        rt.login(&credentials("bob")).await.unwrap();
        assert_eq!(rt.auth().token().as_deref(), Some("tok-bob"));
        assert!(rt.gateway().is_empty());
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let a = runtime();
        let b = runtime();
        a.gateway()
            .call("GET:/only-a", || async { Ok::<_, AppError>(json!("a")) })
            .await
            .unwrap();
        assert!(a.gateway().is_cached("GET:/only-a"));
        assert!(!b.gateway().is_cached("GET:/only-a"));
    }

    #[tokio::test]
    async fn test_sweeper_runs_when_configured() {
        let rt = Runtime::new(
            RuntimeConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticBackend),
        )
        .unwrap();
        assert!(rt.sweeper.lock().is_some());
        rt.stop_sweeper();
        assert!(rt.sweeper.lock().is_none());
    }

    #[test]
    fn test_global_lifecycle() {
        shutdown();
        assert!(global().is_none());

        let installed = init(runtime());
        let fetched = global().unwrap();
        assert!(Arc::ptr_eq(&installed, &fetched));

        let replaced = init(runtime());
        assert!(!Arc::ptr_eq(&installed, &global().unwrap()));

        let removed = shutdown().unwrap();
        assert!(Arc::ptr_eq(&removed, &replaced));
        assert!(global().is_none());
    }

    #[test]
    fn test_search_coordinator_uses_configured_options() {
        let rt = runtime();
        let coordinator = rt.search_coordinator(
            vec![json!({"name": "alpha"}), json!({"name": "beta"})],
            vec!["name".to_string()],
            None,
        );
        let hits = coordinator.search("alp");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record["name"], "alpha");
    }
}
