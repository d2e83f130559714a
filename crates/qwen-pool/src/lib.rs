//! Credential pool for Qwen OAuth tokens
//!
//! Manages the live set of OAuth tokens with random load-balanced selection,
//! inline refresh of expired members, eviction on refresh failure, and a
//! background scheduler that sweeps the whole pool on a cadence. The SQLite
//! store is the single source of truth; the pool keeps an in-memory mirror
//! that every mutation writes through.
//!
//! Token lifecycle:
//! 1. Admin uploads a token (or completes a device flow) → row inserted,
//!    mirrored in memory
//! 2. A chat request calls `TokenPool::select_valid()` → expired members are
//!    refreshed inline, unrefreshable ones evicted, one survivor picked at
//!    random
//! 3. The scheduler reloads and sweeps the pool every N minutes so unattended
//!    deployments stay live
//! 4. Refresh failure anywhere removes the token from memory and store

pub mod error;
pub mod pool;
pub mod scheduler;
pub mod version;

pub use error::{Error, Result};
pub use pool::{PoolStatus, RefreshOutcome, RefreshResult, RefreshSummary, TokenPool, TokenStatus};
pub use scheduler::{RefreshScheduler, SchedulerStatus};
pub use version::VersionProbe;
