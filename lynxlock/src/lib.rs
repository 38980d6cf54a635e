//! Distributed mutual exclusion over a Redis-compatible key/value store.
//!
//! A named lock is acquired by at most one holder at a time across
//! arbitrary processes and expires automatically if the holder crashes.
//! On top of the atomic lock scripts this crate layers:
//!
//! - **Per-handle reentrancy**: the same handle may acquire again,
//!   tracked server-side in a sibling depth key.
//! - **Fencing tokens**: every first acquisition is stamped with a
//!   strictly increasing integer from a store-side counter, so
//!   downstream writers can reject updates from stale holders.
//! - **Bounded retry**: contended acquisitions back off exponentially
//!   with uniform jitter.
//! - **Background renewal**: one service per [`LockManager`] extends
//!   every held lease whose remaining TTL falls below its threshold.
//! - **Operational counters**: acquisitions, releases, renewals, errors
//!   by kind, plus hold- and retry-duration histograms.
//!
//! This is a single-node-Redis lock, not a quorum algorithm: safety
//! across master failover is not guaranteed, which is exactly what the
//! fencing token is for. There is no fairness across waiters, and
//! shutdown never revokes leases on the callers' behalf.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use lynxlock::{LockError, LockManager};
//! use lynxlock_memory::MemoryScriptStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), LockError> {
//! let manager = LockManager::new(Arc::new(MemoryScriptStore::new()));
//!
//! let report = manager
//!     .lock_with_token("orders:rebuild", Duration::from_secs(30), |token| async move {
//!         // Writes guarded by this lock can carry `token` so stale
//!         // holders are rejected downstream.
//!         Ok::<_, LockError>(format!("rebuilt under token {token}"))
//!     })
//!     .await?;
//! assert!(report.starts_with("rebuilt"));
//!
//! manager.shutdown(Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Against a real deployment, construct the store from
//! `lynxlock-redis` instead:
//!
//! ```ignore
//! let store = Arc::new(RedisScriptStore::new(&RedisConfig::new("redis://127.0.0.1:6379"))?);
//! let manager = LockManager::new(store);
//! ```

mod handle;
mod manager;
mod metrics;
mod options;
mod registry;
mod renewal;
mod retry;
mod token;

pub use handle::{LockHandle, LockState};
pub use manager::{LockManager, LockManagerBuilder};
pub use metrics::{DurationHistogram, HistogramSnapshot, LockMetrics, LockStats};
pub use options::{LockOptions, ManagerConfig};
pub use retry::RetryStrategy;

pub use lynxlock_store::{LockError, LockScript, ScriptReply, ScriptStore};
