//! Runtime configuration
//!
//! A single JSON file under the user config directory. Every field has a
//! default, so a missing file or a partial one both load.

use crate::auth::{AuthPaths, AuthSettings};
use crate::gateway::cache::{
    CachePolicy, DEFAULT_EVICTION_SLACK, DEFAULT_MAX_SIZE, DEFAULT_TTL_SECS,
};
use crate::search::coordinator::{DEFAULT_DEBOUNCE, DEFAULT_MIN_SEARCH_LENGTH};
use crate::search::SearchOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "datagate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub auth: AuthConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api/".to_string(),
            request_timeout_secs: 30,
            cache: CacheConfig::default(),
            search: SearchConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: i64,
    pub max_size: usize,
    pub eviction_slack: usize,
    /// 0 disables the background sweeper
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            max_size: DEFAULT_MAX_SIZE,
            eviction_slack: DEFAULT_EVICTION_SLACK,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: chrono::Duration::seconds(self.ttl_secs),
            max_size: self.max_size,
            eviction_slack: self.eviction_slack,
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub debounce_ms: u64,
    pub min_search_length: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            min_search_length: DEFAULT_MIN_SEARCH_LENGTH,
        }
    }
}

impl SearchConfig {
    pub fn options(&self) -> SearchOptions {
        SearchOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            min_search_length: self.min_search_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub refresh_buffer_secs: i64,
    pub user_cache_ttl_secs: i64,
    pub login_path: String,
    pub refresh_path: String,
    pub profile_path: String,
    /// Session file used when no OS keyring is available
    pub store_path: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let paths = AuthPaths::default();
        Self {
            refresh_buffer_secs: crate::auth::lifecycle::REFRESH_BUFFER_SECS,
            user_cache_ttl_secs: crate::auth::lifecycle::USER_CACHE_TTL_SECS,
            login_path: paths.login,
            refresh_path: paths.refresh,
            profile_path: paths.profile,
            store_path: None,
        }
    }
}

impl AuthConfig {
    pub fn settings(&self) -> AuthSettings {
        AuthSettings {
            refresh_buffer: chrono::Duration::seconds(self.refresh_buffer_secs),
            user_cache_ttl: chrono::Duration::seconds(self.user_cache_ttl_secs),
        }
    }

    pub fn paths(&self) -> AuthPaths {
        AuthPaths {
            login: self.login_path.clone(),
            refresh: self.refresh_path.clone(),
            profile: self.profile_path.clone(),
        }
    }
}

/// Get the path to the configuration file
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Cannot determine config directory")?;
    Ok(config_dir.join(APP_DIR).join("config.json"))
}

/// Load configuration from `path`, or the default location. A missing file
/// yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if !path.exists() {
        return Ok(RuntimeConfig::default());
    }

    let data = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: RuntimeConfig = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    Ok(config)
}

/// Save the configuration, creating the directory if needed
pub fn save_config(config: &RuntimeConfig, path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let data = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(&path, data).context("Failed to write config file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)?;
    }

    Ok(())
}
