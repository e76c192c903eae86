//! datagate: client-side data-access runtime
//!
//! - [`gateway`] deduplicates identical in-flight calls and caches settled
//!   results with a TTL and hysteresis eviction
//! - [`auth`] keeps a persisted session alive, sharing refresh and profile
//!   round trips between concurrent callers
//! - [`search`] ranks records against a query and merges in debounced,
//!   cancellable remote results

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod runtime;
pub mod search;

#[cfg(test)]
mod http_tests;

pub use error::AppError;
pub use runtime::Runtime;
