//! Search coordination
//!
//! Runs the fuzzy matcher synchronously over an in-memory collection and,
//! when a remote collaborator is configured, forwards the same query to it
//! after a debounce. Remote results take precedence once they arrive. A
//! newer query always wins: superseded timers and remote calls are
//! cancelled, and every write from a remote task is checked against the
//! query generation it was started for.

use super::fuzzy::{match_record, FieldHit, RecordMatch};
use super::Record;
use crate::error::{normalize_text, AppError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default delay between the last keystroke and the remote dispatch
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Default minimum query length (in characters) before filtering kicks in
pub const DEFAULT_MIN_SEARCH_LENGTH: usize = 1;

pub type RemoteFuture = BoxFuture<'static, Result<Vec<Record>, AppError>>;

/// Remote full-text search collaborator.
///
/// Implementations should stop work when `cancel` fires; the coordinator
/// also drops the returned future on supersession.
pub trait RemoteSearch: Send + Sync {
    fn search(&self, query: String, cancel: CancellationToken) -> RemoteFuture;
}

/// Adapter turning an async closure into a [`RemoteSearch`]
pub struct RemoteFn<F>(pub F);

impl<F, Fut> RemoteSearch for RemoteFn<F>
where
    F: Fn(String, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Record>, AppError>> + Send + 'static,
{
    fn search(&self, query: String, cancel: CancellationToken) -> RemoteFuture {
        Box::pin((self.0)(query, cancel))
    }
}

/// Search tuning knobs
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub debounce: Duration,
    pub min_search_length: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            min_search_length: DEFAULT_MIN_SEARCH_LENGTH,
        }
    }
}

/// Where the coordinator is in its per-query lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchPhase {
    /// Local results are final; nothing outstanding
    Idle,
    /// Waiting for the debounce timer before the remote dispatch
    Debouncing,
    /// Remote call in flight
    RemotePending,
    /// Remote results are being served
    RemoteReady,
    /// Remote call failed; serving local results
    RemoteFailed,
}

impl SearchPhase {
    pub fn is_settled(&self) -> bool {
        !matches!(self, SearchPhase::Debouncing | SearchPhase::RemotePending)
    }
}

/// Transient match annotation; never written back to the record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchInfo {
    pub score: f64,
    pub fields: Vec<FieldHit>,
}

impl From<RecordMatch> for MatchInfo {
    fn from(m: RecordMatch) -> Self {
        Self {
            score: m.score,
            fields: m.field_matches,
        }
    }
}

/// A record in the result list, with its match annotation when it matched
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub record: Record,
    #[serde(rename = "matchInfo", skip_serializing_if = "Option::is_none")]
    pub match_info: Option<MatchInfo>,
}

impl SearchHit {
    pub fn score(&self) -> f64 {
        self.match_info.as_ref().map_or(0.0, |m| m.score)
    }
}

struct State {
    records: Vec<Record>,
    query: String,
    generation: u64,
    local: Vec<SearchHit>,
    remote: Option<Vec<SearchHit>>,
    searching: bool,
    cancel: Option<CancellationToken>,
}

struct Inner {
    fields: Vec<String>,
    options: SearchOptions,
    remote: Option<Arc<dyn RemoteSearch>>,
    state: Mutex<State>,
    phase: watch::Sender<SearchPhase>,
}

/// Per-collection search state machine
#[derive(Clone)]
pub struct SearchCoordinator {
    inner: Arc<Inner>,
}

impl SearchCoordinator {
    pub fn new(records: Vec<Record>, fields: Vec<String>, options: SearchOptions) -> Self {
        Self::build(records, fields, options, None)
    }

    /// Create a coordinator that also dispatches queries to `remote`
    pub fn with_remote(
        records: Vec<Record>,
        fields: Vec<String>,
        options: SearchOptions,
        remote: Arc<dyn RemoteSearch>,
    ) -> Self {
        Self::build(records, fields, options, Some(remote))
    }

    fn build(
        records: Vec<Record>,
        fields: Vec<String>,
        options: SearchOptions,
        remote: Option<Arc<dyn RemoteSearch>>,
    ) -> Self {
        let local = unfiltered(&records);
        let (phase, _) = watch::channel(SearchPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                fields,
                options,
                remote,
                state: Mutex::new(State {
                    records,
                    query: String::new(),
                    generation: 0,
                    local,
                    remote: None,
                    searching: false,
                    cancel: None,
                }),
                phase,
            }),
        }
    }

    /// Start a new query. Local results are available immediately.
    pub fn set_query(&self, text: &str) {
        let normalized = normalize_text(text);
        let trimmed = normalized.as_str();
        let mut state = self.inner.state.lock();

        state.generation += 1;
        let generation = state.generation;
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }
        state.query = text.to_string();
        state.remote = None;
        state.searching = false;

        if trimmed.chars().count() < self.inner.options.min_search_length {
            state.local = unfiltered(&state.records);
            self.inner.phase.send_replace(SearchPhase::Idle);
            return;
        }

        state.local = rank_local(&state.records, trimmed, &self.inner.fields);
        debug!(
            "Local search for {:?}: {} of {} records matched",
            trimmed,
            state.local.len(),
            state.records.len()
        );

        let Some(remote) = self.inner.remote.clone() else {
            self.inner.phase.send_replace(SearchPhase::Idle);
            return;
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, skipping remote search");
                self.inner.phase.send_replace(SearchPhase::Idle);
                return;
            }
        };

        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        self.inner.phase.send_replace(SearchPhase::Debouncing);
        drop(state);

        handle.spawn(run_remote(
            Arc::clone(&self.inner),
            remote,
            trimmed.to_string(),
            generation,
            cancel,
        ));
    }

    /// Run a query and return the results visible right after it
    pub fn search(&self, text: &str) -> Vec<SearchHit> {
        self.set_query(text);
        self.get_results()
    }

    /// Remote results when present, otherwise local results
    pub fn get_results(&self) -> Vec<SearchHit> {
        let state = self.inner.state.lock();
        state
            .remote
            .clone()
            .unwrap_or_else(|| state.local.clone())
    }

    /// True while a remote call is in flight
    pub fn is_searching(&self) -> bool {
        self.inner.state.lock().searching
    }

    pub fn query(&self) -> String {
        self.inner.state.lock().query.clone()
    }

    pub fn phase(&self) -> SearchPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchPhase> {
        self.inner.phase.subscribe()
    }

    /// Wait until no debounce timer or remote call is outstanding
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.phase.subscribe();
        loop {
            if rx.borrow_and_update().is_settled() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drop the current query and any outstanding remote work
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }
        state.query.clear();
        state.local = unfiltered(&state.records);
        state.remote = None;
        state.searching = false;
        self.inner.phase.send_replace(SearchPhase::Idle);
    }

    /// Replace the collection and recompute local results for the current query
    pub fn set_records(&self, records: Vec<Record>) {
        let mut state = self.inner.state.lock();
        state.records = records;
        let query = normalize_text(&state.query);
        state.local = if query.chars().count() < self.inner.options.min_search_length {
            unfiltered(&state.records)
        } else {
            rank_local(&state.records, &query, &self.inner.fields)
        };
    }
}

fn unfiltered(records: &[Record]) -> Vec<SearchHit> {
    records
        .iter()
        .map(|record| SearchHit {
            record: record.clone(),
            match_info: None,
        })
        .collect()
}

/// Matching records, best first. `sort_by` is stable, so equal scores keep
/// collection order.
fn rank_local(records: &[Record], query: &str, fields: &[String]) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = records
        .iter()
        .filter_map(|record| {
            let m = match_record(record, query, fields);
            m.matched.then(|| SearchHit {
                record: record.clone(),
                match_info: Some(m.into()),
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits
}

/// Remote records keep remote order; local annotations are attached for highlighting
fn annotate(records: Vec<Record>, query: &str, fields: &[String]) -> Vec<SearchHit> {
    records
        .into_iter()
        .map(|record| {
            let m = match_record(&record, query, fields);
            SearchHit {
                match_info: m.matched.then(|| m.into()),
                record,
            }
        })
        .collect()
}

async fn run_remote(
    inner: Arc<Inner>,
    remote: Arc<dyn RemoteSearch>,
    query: String,
    generation: u64,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Debounce for {:?} superseded", query);
            return;
        }
        _ = tokio::time::sleep(inner.options.debounce) => {}
    }

    {
        let mut state = inner.state.lock();
        if state.generation != generation || cancel.is_cancelled() {
            return;
        }
        state.searching = true;
        inner.phase.send_replace(SearchPhase::RemotePending);
    }

    debug!("Dispatching remote search for {:?}", query);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        res = remote.search(query.clone(), cancel.clone()) => res,
    };

    let mut state = inner.state.lock();
    if state.generation != generation {
        debug!("Discarding stale remote response for {:?}", query);
        return;
    }

    state.searching = false;
    state.cancel = None;
    match outcome {
        Ok(records) => {
            debug!("Remote search for {:?} returned {} records", query, records.len());
            state.remote = Some(annotate(records, &query, &inner.fields));
            inner.phase.send_replace(SearchPhase::RemoteReady);
        }
        Err(AppError::Cancelled) => {
            // Results are left exactly as they were
            inner.phase.send_replace(SearchPhase::Idle);
        }
        Err(err) => {
            warn!("Remote search for {:?} failed: {}", query, err);
            state.remote = None;
            inner.phase.send_replace(SearchPhase::RemoteFailed);
        }
    }
}
