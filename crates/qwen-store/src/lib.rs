//! Durable persistence for the credential-pool proxy
//!
//! A single embedded SQLite file holds three relations: the token pool,
//! per-day/per-model usage counters, and a one-row cache of the upstream
//! client version. The [`Store`] facade owns the connection pool and a
//! short-lived read cache for the hot `load_all_tokens` path.

mod error;
mod migrate;
mod store;

pub use error::{Error, Result};
pub use store::{ModelUsage, Store, UsageReport};
