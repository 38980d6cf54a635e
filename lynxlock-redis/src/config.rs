use std::time::Duration;

/// Configuration for the Redis store adapter.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    ///
    /// Use the `rediss://` scheme for TLS connections. When `tls_enabled`
    /// is set, a `redis://` URL is automatically upgraded.
    pub url: String,

    /// Number of connections in the `deadpool-redis` pool.
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,

    /// Deadline applied to every script call; exceeding it surfaces
    /// `Unavailable`.
    pub script_timeout: Duration,

    /// Whether TLS is enabled. When `true`, a `redis://` URL is
    /// automatically upgraded to `rediss://`.
    pub tls_enabled: bool,

    /// Accept invalid certificates (dev/test only). Only applies to
    /// `rediss://` connections.
    pub tls_insecure: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
            script_timeout: Duration::from_secs(5),
            tls_enabled: false,
            tls_insecure: false,
        }
    }
}

impl RedisConfig {
    /// Create a config for the given URL with default pool settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Return the effective connection URL, upgrading to `rediss://`
    /// when TLS is enabled.
    pub fn effective_url(&self) -> String {
        if self.tls_enabled && self.url.starts_with("redis://") {
            self.url.replacen("redis://", "rediss://", 1)
        } else {
            self.url.clone()
        }
    }
}
