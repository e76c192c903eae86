//! Request deduplication and TTL caching
//!
//! A [`RequestGateway`] keys every outbound call by a caller-built
//! signature. For any signature there is at most one producer in flight;
//! callers that arrive while it runs share its outcome, success or failure.
//! Successful cacheable outcomes are kept for the cache TTL, failures are
//! never cached.
//!
//! Once issued, a call always runs to completion: it is driven by a spawned
//! task, so it still clears its pending slot and fills the cache even if
//! every caller has gone away.

pub mod cache;
pub mod envelope;
pub mod signature;

use crate::clock::{Clock, SystemClock};
use crate::error::{validate_signature, AppError};
use cache::{CachePolicy, ResponseCache};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub use cache::CacheEntry;
pub use envelope::Envelope;
pub use signature::{get_signature, signature};


/// Future handed back to every caller of [`RequestGateway::call`]
pub type GatewayCall<T> = BoxFuture<'static, Result<T, AppError>>;

type SharedCall<T> = Shared<GatewayCall<T>>;

/// Counters for observing gateway behaviour
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    /// Calls answered from the cache
    pub hits: u64,
    /// Calls that started a new producer
    pub invocations: u64,
    /// Calls that joined an in-flight producer
    pub deduplicated: u64,
    /// Producers that settled with an error
    pub failures: u64,
    /// Entries removed by capacity enforcement
    pub evictions: u64,
}

struct PendingCall<T> {
    id: u64,
    call: SharedCall<T>,
}

struct GatewayState<T> {
    cache: ResponseCache<T>,
    pending: HashMap<String, PendingCall<T>>,
    next_id: u64,
    stats: GatewayStats,
}

struct Inner<T> {
    namespace: String,
    clock: Arc<dyn Clock>,
    state: Mutex<GatewayState<T>>,
}

impl<T: Clone> Inner<T> {
    fn settle(&self, signature: &str, id: u64, outcome: &Result<T, AppError>, cacheable: bool) {
        let mut state = self.state.lock();
        if state.pending.get(signature).is_some_and(|p| p.id == id) {
            state.pending.remove(signature);
        }

        match outcome {
            Ok(payload) if cacheable => {
                let evicted = state.cache.insert(signature, payload.clone(), self.clock.now());
                state.stats.evictions += evicted as u64;
                trace!("[{}] cached {}", self.namespace, signature);
            }
            Ok(_) => {}
            Err(err) => {
                state.stats.failures += 1;
                debug!("[{}] {} failed: {}", self.namespace, signature, err);
            }
        }
    }
}

/// Deduplicating, caching front for async calls
pub struct RequestGateway<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestGateway<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RequestGateway<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a gateway on the wall clock. `namespace` labels log output.
    pub fn new(namespace: impl Into<String>, policy: CachePolicy) -> Self {
        Self::with_clock(namespace, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        namespace: impl Into<String>,
        policy: CachePolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace: namespace.into(),
                clock,
                state: Mutex::new(GatewayState {
                    cache: ResponseCache::new(policy),
                    pending: HashMap::new(),
                    next_id: 0,
                    stats: GatewayStats::default(),
                }),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Cacheable call
    pub fn call<F, Fut>(&self, signature: &str, producer: F) -> GatewayCall<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        self.call_with(signature, producer, true)
    }

    /// Deduplicated but never cached
    pub fn call_uncached<F, Fut>(&self, signature: &str, producer: F) -> GatewayCall<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        self.call_with(signature, producer, false)
    }

    /// Resolve `signature` from the cache, join the in-flight call for it, or
    /// start `producer`.
    ///
    /// The lookup and registration happen synchronously when this is called,
    /// not when the returned future is first polled, so calls issued back to
    /// back are deduplicated even before anything is awaited. `producer` is
    /// invoked while the gateway is locked and must not call back into it.
    pub fn call_with<F, Fut>(&self, signature: &str, producer: F, cacheable: bool) -> GatewayCall<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        if let Err(err) = validate_signature(signature) {
            return future::ready(Err(err)).boxed();
        }

        let mut state = self.inner.state.lock();

        if cacheable {
            if let Some(payload) = state.cache.get(signature, self.inner.clock.now()) {
                state.stats.hits += 1;
                trace!("[{}] cache hit {}", self.inner.namespace, signature);
                return future::ready(Ok(payload)).boxed();
            }
        }

        if let Some(pending) = state.pending.get(signature) {
            let call = pending.call.clone();
            state.stats.deduplicated += 1;
            debug!("[{}] joining in-flight {}", self.inner.namespace, signature);
            return call.boxed();
        }

        let id = state.next_id;
        state.next_id += 1;
        state.stats.invocations += 1;
        debug!("[{}] issuing {}", self.inner.namespace, signature);

        let call = track(
            Arc::downgrade(&self.inner),
            signature.to_string(),
            id,
            producer(),
            cacheable,
        );
        state.pending.insert(
            signature.to_string(),
            PendingCall {
                id,
                call: call.clone(),
            },
        );
        drop(state);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(call.clone());
            }
            Err(_) => {
                warn!(
                    "[{}] no async runtime; {} only progresses while awaited",
                    self.inner.namespace, signature
                );
            }
        }

        call.boxed()
    }

    /// Remove cache entries whose signature contains `pattern`, or all of
    /// them. In-flight calls are untouched.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let removed = self.inner.state.lock().cache.clear(pattern);
        debug!(
            "[{}] cleared {} cache entries (pattern: {:?})",
            self.inner.namespace, removed, pattern
        );
        removed
    }

    /// Drop expired cache entries now
    pub fn sweep_expired(&self) -> usize {
        let now = self.inner.clock.now();
        self.inner.state.lock().cache.sweep_expired(now)
    }

    /// Sweep expired entries every `interval` until the gateway is dropped
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let now = inner.clock.now();
                let removed = inner.state.lock().cache.sweep_expired(now);
                if removed > 0 {
                    debug!("[{}] swept {} expired entries", inner.namespace, removed);
                }
            }
        })
    }

    /// Whether a fresh entry for `signature` is cached
    pub fn is_cached(&self, signature: &str) -> bool {
        let now = self.inner.clock.now();
        self.inner.state.lock().cache.get(signature, now).is_some()
    }

    /// Number of cached entries, including not-yet-swept expired ones
    pub fn len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of calls currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn stats(&self) -> GatewayStats {
        self.inner.state.lock().stats
    }
}

/// Wrap a producer future so that settling it updates the gateway
fn track<T, Fut>(
    inner: Weak<Inner<T>>,
    signature: String,
    id: u64,
    producer: Fut,
    cacheable: bool,
) -> SharedCall<T>
where
    T: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, AppError>> + Send + 'static,
{
    async move {
        let outcome = producer.await;
        if let Some(inner) = inner.upgrade() {
            inner.settle(&signature, id, &outcome, cacheable);
        }
        outcome
    }
    .boxed()
    .shared()
}
