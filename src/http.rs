//! HTTP transport
//!
//! Builds proxy-aware reqwest clients and routes JSON GETs through a
//! [`RequestGateway`] so identical concurrent requests share one round trip.

use crate::error::AppError;
use crate::gateway::envelope::unwrap_body;
use crate::gateway::{signature, GatewayCall, RequestGateway};
use crate::search::{Record, RemoteFuture, RemoteSearch};
use futures::future::{self, FutureExt};
use parking_lot::RwLock;
use reqwest::{Client, Proxy, RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Build a reqwest Client with the given timeout, honoring proxy env vars
///
/// Recognized env vars:
/// - HTTP_PROXY / http_proxy
/// - HTTPS_PROXY / https_proxy
/// - ALL_PROXY / all_proxy
/// - NO_PROXY / no_proxy
pub fn client_with_timeout(timeout: Duration) -> Result<Client, AppError> {
    let mut builder = Client::builder().timeout(timeout);

    let proxies = ProxySettings::from_env();
    if proxies.is_configured() {
        builder = builder.proxy(Proxy::custom(move |url: &Url| proxies.proxy_for(url)));
    }

    builder
        .user_agent(concat!("datagate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))
}

fn getenv_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq)]
enum NoProxyRule {
    Wildcard,
    /// Matches the domain and any subdomain
    Domain(String),
    /// Exact host (localhost, IP literals)
    Exact(String),
}

impl NoProxyRule {
    fn parse(token: &str) -> Self {
        if token == "*" {
            return NoProxyRule::Wildcard;
        }
        if let Some(domain) = token.strip_prefix('.') {
            return NoProxyRule::Domain(domain.to_ascii_lowercase());
        }
        let host = token.to_ascii_lowercase();
        if host == "localhost" || host.parse::<std::net::IpAddr>().is_ok() {
            NoProxyRule::Exact(host)
        } else {
            NoProxyRule::Domain(host)
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            NoProxyRule::Wildcard => true,
            NoProxyRule::Exact(ex) => host == ex,
            NoProxyRule::Domain(suffix) => {
                host == suffix
                    || host
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ProxySettings {
    http: Option<String>,
    https: Option<String>,
    bypass: Vec<NoProxyRule>,
}

impl ProxySettings {
    fn from_env() -> Self {
        let all = getenv_first(&["ALL_PROXY", "all_proxy"]);
        let no_proxy = getenv_first(&["NO_PROXY", "no_proxy"]).unwrap_or_default();
        Self {
            http: getenv_first(&["HTTP_PROXY", "http_proxy"]).or_else(|| all.clone()),
            https: getenv_first(&["HTTPS_PROXY", "https_proxy"]).or(all),
            bypass: parse_no_proxy(&no_proxy),
        }
    }

    fn is_configured(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }

    fn bypasses(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        self.bypass.iter().any(|rule| rule.matches(&host))
    }

    fn proxy_for(&self, url: &Url) -> Option<String> {
        if self.bypasses(url.host_str().unwrap_or("")) {
            return None;
        }
        match url.scheme() {
            "https" => self.https.clone().or_else(|| self.http.clone()),
            "http" => self.http.clone().or_else(|| self.https.clone()),
            _ => None,
        }
    }
}

fn parse_no_proxy(val: &str) -> Vec<NoProxyRule> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(NoProxyRule::parse)
        .collect()
}

/// Send a request and decode its JSON body through the response envelope
pub async fn send_json(request: RequestBuilder) -> Result<Value, AppError> {
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED {
        let text = response.text().await.unwrap_or_default();
        return Err(AppError::Unauthorized(format!("{} {}", status, text).trim().to_string()));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(AppError::NetworkError(format!("API error {}: {}", status, text)));
    }

    let bytes = response.bytes().await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    unwrap_body(body)
}

/// Bearer token plus a counter bumped whenever it changes
#[derive(Default)]
struct BearerSession {
    token: Option<String>,
    epoch: u64,
}

/// JSON API client whose GETs are deduplicated and cached by signature.
///
/// Cached responses belong to the bearer token they were fetched with:
/// changing the token drops the cache, and calls issued under an earlier
/// token are keyed apart so they are never joined or served afterwards.
pub struct ApiClient {
    client: Client,
    base_url: Url,
    gateway: RequestGateway<Value>,
    bearer: RwLock<BearerSession>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        gateway: RequestGateway<Value>,
    ) -> Result<Self, AppError> {
        Self::with_client(client_with_timeout(timeout)?, base_url, gateway)
    }

    pub fn with_client(
        client: Client,
        base_url: &str,
        gateway: RequestGateway<Value>,
    ) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::ValidationError(format!("Invalid base URL {:?}: {}", base_url, e)))?;
        Ok(Self {
            client,
            base_url,
            gateway,
            bearer: RwLock::new(BearerSession::default()),
        })
    }

    /// Attach `token` to subsequent GETs. A different token than before
    /// invalidates every cached response.
    pub fn set_bearer(&self, token: Option<String>) {
        {
            let mut bearer = self.bearer.write();
            if bearer.token == token {
                return;
            }
            bearer.token = token;
            bearer.epoch += 1;
        }
        let removed = self.gateway.clear(None);
        debug!("Bearer token changed, dropped {} cached responses", removed);
    }

    pub fn gateway(&self) -> &RequestGateway<Value> {
        &self.gateway
    }

    /// Resolve `path` against the base URL; absolute URLs pass through
    pub fn url_for(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::ValidationError(format!("Invalid path {:?}: {}", path, e)))
    }

    /// Cacheable GET
    pub fn get(&self, path: &str, params: &[(&str, &str)]) -> GatewayCall<Value> {
        self.get_with(path, params, true)
    }

    /// Deduplicated GET that always goes to the network once settled
    pub fn get_fresh(&self, path: &str, params: &[(&str, &str)]) -> GatewayCall<Value> {
        self.get_with(path, params, false)
    }

    fn get_with(&self, path: &str, params: &[(&str, &str)], cacheable: bool) -> GatewayCall<Value> {
        let url = match self.url_for(path) {
            Ok(url) => url,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let mut sig = match signature("GET", url.as_str(), params) {
            Ok(sig) => sig,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        let mut request = self.client.get(url).query(params);
        {
            let bearer = self.bearer.read();
            if bearer.epoch > 0 {
                sig = format!("{}#session-{}", sig, bearer.epoch);
            }
            if let Some(token) = bearer.token.as_deref() {
                request = request.bearer_auth(token);
            }
        }

        self.gateway
            .call_with(&sig, move || send_json(request), cacheable)
    }

    /// POST a JSON body. Not cached; deduplication is up to the caller.
    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<Value, AppError> {
        let url = self.url_for(path)?;
        debug!("POST {}", url);
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        send_json(request).await
    }

    /// GET with an explicit bearer token, bypassing the gateway
    pub async fn get_direct(&self, path: &str, bearer: Option<&str>) -> Result<Value, AppError> {
        let url = self.url_for(path)?;
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        send_json(request).await
    }

    /// Drop cached responses whose signature contains `pattern`
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        self.gateway.clear(pattern)
    }
}

/// Remote full-text search over `GET {path}?{param}={query}`
pub struct HttpRemoteSearch {
    api: Arc<ApiClient>,
    path: String,
    param: String,
}

impl HttpRemoteSearch {
    pub fn new(api: Arc<ApiClient>, path: impl Into<String>) -> Self {
        Self {
            api,
            path: path.into(),
            param: "q".to_string(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }
}

impl RemoteSearch for HttpRemoteSearch {
    fn search(&self, query: String, cancel: CancellationToken) -> RemoteFuture {
        // Cacheable: a superseded response may still land in the cache (bounded by TTL)
        let call = self.api.get(&self.path, &[(self.param.as_str(), query.as_str())]);
        async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(AppError::Cancelled),
                body = call => records_from(body?),
            }
        }
        .boxed()
    }
}

/// Accept a bare array, or an object wrapping one under `results` or `items`
pub fn records_from(body: Value) -> Result<Vec<Record>, AppError> {
    match body {
        Value::Array(records) => Ok(records),
        Value::Object(mut obj) => match obj.remove("results").or_else(|| obj.remove("items")) {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(AppError::ValidationError(
                "Search response has no result array".to_string(),
            )),
        },
        _ => Err(AppError::ValidationError(
            "Search response is not a list".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_proxy_rules() {
        let rules = parse_no_proxy("localhost, .internal.test ,example.com,10.0.0.1");
        assert_eq!(rules.len(), 4);

        let settings = ProxySettings {
            http: Some("http://proxy:3128".to_string()),
            https: None,
            bypass: rules,
        };
        assert!(settings.bypasses("localhost"));
        assert!(settings.bypasses("api.internal.test"));
        assert!(settings.bypasses("example.com"));
        assert!(settings.bypasses("www.example.com"));
        assert!(!settings.bypasses("notexample.com"));
        assert!(settings.bypasses("10.0.0.1"));
        assert!(!settings.bypasses("10.0.0.2"));

        let url = Url::parse("https://api.remote.test/x").unwrap();
        assert_eq!(settings.proxy_for(&url).as_deref(), Some("http://proxy:3128"));
        let url = Url::parse("https://example.com/x").unwrap();
        assert_eq!(settings.proxy_for(&url), None);
    }

    #[test]
    fn test_wildcard_no_proxy() {
        let settings = ProxySettings {
            http: Some("http://proxy".to_string()),
            https: None,
            bypass: parse_no_proxy("*"),
        };
        assert!(settings.bypasses("anything.test"));
        assert!(!settings.bypasses(""));
    }
}
