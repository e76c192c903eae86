//! Record search: fuzzy field matching, highlighting, and the query coordinator
//!
//! Records are opaque JSON objects supplied by the caller. Matching never
//! mutates them; match information travels alongside in [`SearchHit`].

pub mod coordinator;
pub mod fuzzy;
pub mod highlight;


#[cfg(test)]
mod property_tests;

pub use coordinator::{
    MatchInfo, RemoteFn, RemoteFuture, RemoteSearch, SearchCoordinator, SearchHit, SearchOptions, SearchPhase,
};
pub use fuzzy::{match_field, match_record, merge_spans, FieldMatch, MatchSpan, RecordMatch};
pub use highlight::highlight;

/// A caller-supplied record: a JSON object of field name to value
pub type Record = serde_json::Value;
