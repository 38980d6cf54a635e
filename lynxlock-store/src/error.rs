use thiserror::Error;

/// Errors from lock operations and store adapters.
///
/// Messages name the lock key and the failure kind; the holder value is
/// sensitive and never appears in error text or logs.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key is currently held by a different holder identity.
    #[error("lock contended: {0}")]
    Contended(String),

    /// Transport failure or timeout talking to the store.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// Bad input: empty key, non-positive TTL, reentry ceiling reached,
    /// or a handle reused after release.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Release or renew on a lease this handle does not own.
    #[error("lock not held: {0}")]
    NotHeld(String),

    /// A renew observed that the lease is gone; the handle is terminal.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// The retry engine gave up.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<LockError>,
    },

    /// Acquire attempted after shutdown was engaged.
    #[error("lock service is shutting down")]
    ShuttingDown,

    /// Shutdown drained until its deadline with locks still active.
    #[error("shutdown timed out with {active} locks still held")]
    ShutdownTimedOut { active: u64 },

    /// The store returned a reply the script contract does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server signalled script interruption (e.g. Redis BUSY).
    #[error("store busy: {0}")]
    Busy(String),
}

impl LockError {
    /// Whether the retry engine may recover this error by trying again.
    ///
    /// Only contention and transport failures are transient; everything
    /// else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contended(_) | Self::Unavailable(_))
    }

    /// Short stable label for this error kind, used as a counter key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Contended(_) => "contended",
            Self::Unavailable(_) => "unavailable",
            Self::Cancelled => "cancelled",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotHeld(_) => "not_held",
            Self::LeaseLost(_) => "lease_lost",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::ShuttingDown => "shutting_down",
            Self::ShutdownTimedOut { .. } => "shutdown_timed_out",
            Self::Protocol(_) => "protocol",
            Self::Busy(_) => "busy",
        }
    }
}
