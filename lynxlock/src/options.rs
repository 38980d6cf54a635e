use std::time::Duration;

use crate::retry::RetryStrategy;

/// Per-handle lock configuration.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease granted per acquire/renew.
    pub expiration: Duration,
    /// Backoff applied to contended acquisitions.
    pub retry: RetryStrategy,
    /// Whether the renewal service keeps this lock alive.
    pub renewal_enabled: bool,
    /// Fraction of `expiration` below which the remaining TTL triggers a
    /// renewal.
    pub renewal_threshold: f64,
    /// Ceiling on the reentry depth; the next acquire past it fails with
    /// `InvalidArgument`.
    pub max_reentry: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(30),
            retry: RetryStrategy::default(),
            renewal_enabled: true,
            renewal_threshold: 0.5,
            max_reentry: 1024,
        }
    }
}

impl LockOptions {
    /// Options with the given expiration and defaults everywhere else.
    pub fn with_expiration(expiration: Duration) -> Self {
        Self {
            expiration,
            ..Self::default()
        }
    }
}

/// Process-wide lock-manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Store key holding the fencing-token counter. Shared by every
    /// process that participates in the same deployment.
    pub token_key: String,
    /// Upper bound on the renewal scheduling granularity; the effective
    /// tick is `min(renewal_interval, smallest_active_expiration / 2)`.
    pub renewal_interval: Duration,
    /// Parallelism of the renewal worker pool.
    pub worker_pool_size: usize,
    /// Transport-retry ceiling for one renewal within a single tick.
    pub renewal_max_retries: u32,
    /// Backoff between transport retries within a tick.
    pub renewal_retry_backoff: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            token_key: String::from("lynx:redis:lock:token"),
            renewal_interval: Duration::from_secs(10),
            worker_pool_size: num_cpus::get().max(4),
            renewal_max_retries: 2,
            renewal_retry_backoff: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_option_defaults() {
        let opts = LockOptions::default();
        assert_eq!(opts.expiration, Duration::from_secs(30));
        assert!(opts.renewal_enabled);
        assert!((opts.renewal_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(opts.max_reentry, 1024);
    }

    #[test]
    fn manager_config_defaults() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.token_key, "lynx:redis:lock:token");
        assert_eq!(cfg.renewal_interval, Duration::from_secs(10));
        assert!(cfg.worker_pool_size >= 4);
        assert_eq!(cfg.renewal_max_retries, 2);
    }
}
