/// The four named server-side scripts.
///
/// These are the only points at which lock state mutates. Each backend
/// supplies an atomic implementation: the Redis adapter ships Lua, the
/// in-memory adapter interprets the same contracts natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScript {
    /// `ACQUIRE(lock_key, reentry_key | holder, ttl_ms)`.
    ///
    /// Returns `1` on first acquire, `2` on reentry by the same holder
    /// (TTLs refreshed on both keys), `0` when held by someone else.
    Acquire,
    /// `RENEW(lock_key, reentry_key | holder, ttl_ms)`.
    ///
    /// Returns `1` when the holder matched and both TTLs were refreshed,
    /// `0` when the lease is lost or was never held.
    Renew,
    /// `RELEASE(lock_key, reentry_key | holder)`.
    ///
    /// Returns `-1` when the caller is not the holder, the remaining
    /// reentry depth on a partial release, `0` once both keys are
    /// deleted.
    Release,
    /// `COUNTER(counter_key)`: atomically increment and return the
    /// fencing-token counter.
    Counter,
}

impl LockScript {
    /// Stable name used for logging and backend dispatch.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Renew => "renew",
            Self::Release => "release",
            Self::Counter => "counter",
        }
    }
}

/// The sibling key holding the reentry depth for `key`.
///
/// Present only while the lock is held; deleted on full release.
pub fn reentry_key(key: &str) -> String {
    format!("{key}:reentry")
}

/// Reply from a script execution: an integer, a string, or nil.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Int(i64),
    Text(String),
    Nil,
}

impl ScriptReply {
    /// The integer value, if this reply is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}
