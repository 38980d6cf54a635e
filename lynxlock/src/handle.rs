use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use lynxlock_store::{reentry_key, LockError, LockScript, ScriptReply};

use crate::manager::Shared;
use crate::retry::RetryStrategy;
use crate::LockOptions;

const IDLE: u8 = 0;
const HELD: u8 = 1;
const RELEASED: u8 = 2;

/// Lifecycle state of a [`LockHandle`].
///
/// `Released` is terminal: a released handle must not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Held,
    Released,
}

/// Lease bookkeeping, meaningful only while the handle is Held.
#[derive(Debug, Clone, Copy)]
struct Lease {
    expires_at: Instant,
    held_since: Instant,
}

/// A per-(key, holder) lock handle.
///
/// The holder identity is generated from a cryptographic RNG at
/// construction and never reused, which is what makes the release script
/// safe: two handles for the same key can never reenter each other.
///
/// An internal mutex serializes the handle's store operations, so
/// `acquire`, `renew`, `release` and `is_locked` appear to execute in
/// program order; concurrent calls queue. Accessors never block.
pub struct LockHandle {
    key: String,
    /// `[key, key:reentry]`, the key list passed to every script.
    keys: Vec<String>,
    value: String,
    options: LockOptions,
    shared: Arc<Shared>,
    self_weak: Weak<LockHandle>,
    op: tokio::sync::Mutex<()>,
    state: AtomicU8,
    reentry: AtomicU32,
    token: OnceLock<i64>,
    lease: RwLock<Lease>,
}

impl LockHandle {
    pub(crate) fn new(key: String, options: LockOptions, shared: Arc<Shared>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new_cyclic(|weak| Self {
            keys: vec![key.clone(), reentry_key(&key)],
            key,
            value: Uuid::new_v4().to_string(),
            options,
            shared,
            self_weak: weak.clone(),
            op: tokio::sync::Mutex::new(()),
            state: AtomicU8::new(IDLE),
            reentry: AtomicU32::new(0),
            token: OnceLock::new(),
            lease: RwLock::new(Lease {
                expires_at: now,
                held_since: now,
            }),
        })
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The lease granted per acquire/renew.
    pub fn expiration(&self) -> Duration {
        self.options.expiration
    }

    /// When the current lease would expire if not renewed.
    pub fn expires_at(&self) -> Instant {
        self.lease.read().expires_at
    }

    /// The fencing token, assigned once on the first successful acquire.
    pub fn token(&self) -> Option<i64> {
        self.token.get().copied()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LockState {
        match self.state.load(Ordering::SeqCst) {
            IDLE => LockState::Idle,
            HELD => LockState::Held,
            _ => LockState::Released,
        }
    }

    /// Local reentry depth; greater than zero iff the handle is Held.
    pub fn reentry(&self) -> u32 {
        self.reentry.load(Ordering::Relaxed)
    }

    /// Per-handle options.
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    fn fail(&self, error: LockError) -> LockError {
        self.shared.metrics.record_error(&error);
        error
    }

    /// Acquire the lock, or reenter it when this handle already holds it.
    ///
    /// The first successful acquire assigns the fencing token, registers
    /// the handle with the renewal service and transitions Idle→Held.
    /// A reentry increments the server-side depth and refreshes the
    /// lease. Fails with `Contended` when a different holder owns the
    /// key.
    pub async fn acquire(&self) -> Result<(), LockError> {
        let _op = self.op.lock().await;

        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(self.fail(LockError::ShuttingDown));
        }
        match self.state() {
            LockState::Released => {
                return Err(self.fail(LockError::InvalidArgument(format!(
                    "handle for {} reused after release",
                    self.key
                ))));
            }
            LockState::Held => {
                if self.reentry.load(Ordering::Relaxed) >= self.options.max_reentry {
                    return Err(self.fail(LockError::InvalidArgument(format!(
                        "reentry ceiling {} reached for {}",
                        self.options.max_reentry, self.key
                    ))));
                }
            }
            LockState::Idle => {}
        }

        let ttl = ttl_millis(self.options.expiration).map_err(|e| self.fail(e))?;
        let args = vec![self.value.clone(), ttl];
        let reply = match self
            .shared
            .store
            .eval(LockScript::Acquire, &self.keys, &args)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };

        match int_reply(reply, LockScript::Acquire).map_err(|e| self.fail(e))? {
            1 => {
                // The lock is ours in the store but the handle is not yet
                // registered; if this future is dropped before the token
                // arrives, the guard issues a best-effort release.
                let cleanup = AcquireCleanup::new(self);
                let token = match self.shared.tokens.next_token().await {
                    Ok(token) => token,
                    Err(e) => return Err(self.fail(e)),
                };
                cleanup.disarm();

                let now = Instant::now();
                *self.lease.write() = Lease {
                    expires_at: now + self.options.expiration,
                    held_since: now,
                };
                let _ = self.token.set(token);
                self.reentry.store(1, Ordering::Relaxed);
                self.state.store(HELD, Ordering::SeqCst);
                self.shared
                    .registry
                    .insert(self.value.clone(), self.self_weak.clone());
                self.shared.metrics.increment_total_locks();
                self.shared.metrics.increment_active_locks();
                self.shared.metrics.increment_acquisitions();
                if self.options.renewal_enabled {
                    self.shared.ensure_renewal_running();
                    self.shared.renewal_wake.notify_one();
                }
                debug!(key = %self.key, token, "lock acquired");
                Ok(())
            }
            2 => {
                if self.state() != LockState::Held {
                    return Err(self.fail(LockError::Protocol(format!(
                        "reentry reply for a handle that does not hold {}",
                        self.key
                    ))));
                }
                let depth = self.reentry.fetch_add(1, Ordering::Relaxed) + 1;
                self.lease.write().expires_at = Instant::now() + self.options.expiration;
                self.shared.metrics.increment_acquisitions();
                debug!(key = %self.key, depth, "lock reentered");
                Ok(())
            }
            0 => Err(self.fail(LockError::Contended(self.key.clone()))),
            other => Err(self.fail(LockError::Protocol(format!(
                "acquire replied {other} for {}",
                self.key
            )))),
        }
    }

    /// Acquire with the given backoff strategy.
    ///
    /// Only `Contended` and `Unavailable` are retried; anything else
    /// surfaces immediately. Gives up with `RetriesExhausted` once the
    /// retry or elapsed-time budget is spent, and with `Cancelled` when
    /// manager shutdown interrupts a backoff wait.
    pub async fn acquire_with_retry(&self, strategy: &RetryStrategy) -> Result<(), LockError> {
        let started = Instant::now();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        let mut retries: u32 = 0;

        loop {
            let err = match self.acquire().await {
                Ok(()) => {
                    if retries > 0 {
                        self.shared.metrics.retry_duration.observe(started.elapsed());
                    }
                    return Ok(());
                }
                Err(err) => err,
            };
            if !err.is_retryable() {
                if retries > 0 {
                    self.shared.metrics.retry_duration.observe(started.elapsed());
                }
                return Err(err);
            }

            let delay = strategy.jittered_delay(retries);
            if retries >= strategy.max_retries
                || started.elapsed() + delay >= strategy.max_elapsed_time
            {
                self.shared.metrics.increment_retry_failures();
                if retries > 0 {
                    self.shared.metrics.retry_duration.observe(started.elapsed());
                }
                return Err(self.fail(LockError::RetriesExhausted {
                    attempts: retries + 1,
                    source: Box::new(err),
                }));
            }

            self.shared.metrics.increment_retries();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    return Err(self.fail(LockError::Cancelled));
                }
            }
            retries += 1;
        }
    }

    /// Release one level of the lock.
    ///
    /// The last release deletes the store entry and transitions
    /// Held→Released. The server is the source of truth: a reply of `-1`
    /// fails with `NotHeld` and leaves the local state unchanged.
    pub async fn release(&self) -> Result<(), LockError> {
        let _op = self.op.lock().await;

        if self.state() != LockState::Held {
            return Err(self.fail(LockError::NotHeld(self.key.clone())));
        }

        let args = vec![self.value.clone()];
        let reply = match self
            .shared
            .store
            .eval(LockScript::Release, &self.keys, &args)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };

        match int_reply(reply, LockScript::Release).map_err(|e| self.fail(e))? {
            -1 => Err(self.fail(LockError::NotHeld(self.key.clone()))),
            0 => {
                self.mark_released(false);
                self.shared.metrics.increment_releases();
                debug!(key = %self.key, "lock released");
                Ok(())
            }
            depth if depth > 0 => {
                self.reentry
                    .store(u32::try_from(depth).unwrap_or(u32::MAX), Ordering::Relaxed);
                self.shared.metrics.increment_releases();
                debug!(key = %self.key, depth, "lock partially released");
                Ok(())
            }
            other => Err(self.fail(LockError::Protocol(format!(
                "release replied {other} for {}",
                self.key
            )))),
        }
    }

    /// Extend the lease by `ttl` (the handle's expiration when `None`).
    ///
    /// A reply of `0` means the lease is gone: the handle transitions to
    /// Released and the call fails with `LeaseLost`.
    pub async fn renew(&self, ttl: Option<Duration>) -> Result<(), LockError> {
        let ttl = ttl.unwrap_or(self.options.expiration);
        let _op = self.op.lock().await;

        if self.state() != LockState::Held {
            return Err(self.fail(LockError::NotHeld(self.key.clone())));
        }

        let ttl_arg = ttl_millis(ttl).map_err(|e| self.fail(e))?;
        let args = vec![self.value.clone(), ttl_arg];
        let reply = match self
            .shared
            .store
            .eval(LockScript::Renew, &self.keys, &args)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };

        match int_reply(reply, LockScript::Renew).map_err(|e| self.fail(e))? {
            1 => {
                self.lease.write().expires_at = Instant::now() + ttl;
                self.shared.metrics.increment_renewals();
                debug!(key = %self.key, "lease renewed");
                Ok(())
            }
            0 => {
                self.mark_released(true);
                Err(self.fail(LockError::LeaseLost(self.key.clone())))
            }
            other => Err(self.fail(LockError::Protocol(format!(
                "renew replied {other} for {}",
                self.key
            )))),
        }
    }

    /// Whether the store currently maps the key to this handle's holder
    /// identity. Purely advisory; the answer may race with expiry.
    pub async fn is_locked(&self) -> Result<bool, LockError> {
        let _op = self.op.lock().await;
        let holder = self
            .shared
            .store
            .get(&self.key)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(holder.as_deref() == Some(self.value.as_str()))
    }

    /// Transition Held→Released and deregister. `expired` marks leases
    /// that lapsed rather than being released by the caller.
    fn mark_released(&self, expired: bool) {
        self.state.store(RELEASED, Ordering::SeqCst);
        self.reentry.store(0, Ordering::Relaxed);
        self.shared.registry.remove(&self.value);
        self.shared.metrics.decrement_active_locks();
        if expired {
            self.shared.metrics.increment_expirations();
        }
        let held_since = self.lease.read().held_since;
        self.shared.metrics.hold_duration.observe(held_since.elapsed());
    }

    /// One renewal-service pass over this handle.
    ///
    /// Skips (without renewing) when a user operation is in flight or
    /// the handle is no longer Held. Transport failures are retried a
    /// bounded number of times within the tick; a lost lease releases
    /// the handle without interrupting the user's ongoing work.
    pub(crate) async fn service_renew(&self) {
        let metrics = &self.shared.metrics;
        let Ok(_op) = self.op.try_lock() else {
            metrics.increment_skipped_renewals();
            return;
        };
        if self.state() != LockState::Held {
            metrics.increment_skipped_renewals();
            return;
        }

        let Ok(ttl_arg) = ttl_millis(self.options.expiration) else {
            return;
        };
        let args = vec![self.value.clone(), ttl_arg];
        let mut attempt: u32 = 0;

        loop {
            match self
                .shared
                .store
                .eval(LockScript::Renew, &self.keys, &args)
                .await
            {
                Ok(reply) => {
                    match reply.as_int() {
                        Some(1) => {
                            self.lease.write().expires_at =
                                Instant::now() + self.options.expiration;
                            metrics.increment_renewals();
                            debug!(key = %self.key, "lease renewed in background");
                        }
                        Some(0) => {
                            self.mark_released(true);
                            metrics.increment_renewal_errors();
                            metrics.record_error(&LockError::LeaseLost(self.key.clone()));
                            warn!(key = %self.key, "lease lost; handle released");
                        }
                        _ => {
                            metrics.increment_renewal_errors();
                            metrics.record_error(&LockError::Protocol(format!(
                                "renew replied malformed for {}",
                                self.key
                            )));
                            warn!(key = %self.key, "background renew returned a malformed reply");
                        }
                    }
                    return;
                }
                Err(LockError::Unavailable(_))
                    if attempt < self.shared.config.renewal_max_retries =>
                {
                    attempt += 1;
                    tokio::time::sleep(self.shared.config.renewal_retry_backoff * attempt).await;
                }
                Err(e) => {
                    metrics.increment_renewal_errors();
                    metrics.record_error(&e);
                    warn!(key = %self.key, error = %e, "background renew failed; retrying next tick");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("reentry", &self.reentry())
            .field("token", &self.token())
            .finish_non_exhaustive()
    }
}

fn ttl_millis(ttl: Duration) -> Result<String, LockError> {
    let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    if ms <= 0 {
        return Err(LockError::InvalidArgument("ttl must be positive".into()));
    }
    Ok(ms.to_string())
}

fn int_reply(reply: ScriptReply, script: LockScript) -> Result<i64, LockError> {
    reply.as_int().ok_or_else(|| {
        LockError::Protocol(format!("script {} returned a non-integer", script.name()))
    })
}

/// Covers the window between a successful ACQUIRE and completed
/// registration: if the acquiring future is dropped there, the lock
/// would be held in the store with nobody tracking it, so the guard
/// spawns a best-effort release.
struct AcquireCleanup<'a> {
    handle: &'a LockHandle,
    armed: bool,
}

impl<'a> AcquireCleanup<'a> {
    fn new(handle: &'a LockHandle) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AcquireCleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.handle.shared.store);
        let keys = self.handle.keys.clone();
        let args = vec![self.handle.value.clone()];
        let key = self.handle.key.clone();
        tokio::spawn(async move {
            if let Err(e) = store.eval(LockScript::Release, &keys, &args).await {
                warn!(key = %key, error = %e, "best-effort release after interrupted acquire failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lynxlock_memory::MemoryScriptStore;
    use lynxlock_store::ScriptStore;

    use crate::LockManager;

    fn manager() -> (LockManager, Arc<MemoryScriptStore>) {
        let store = Arc::new(MemoryScriptStore::new());
        (LockManager::new(Arc::clone(&store) as Arc<dyn ScriptStore>), store)
    }

    #[tokio::test]
    async fn acquire_assigns_token_once() {
        let (manager, _) = manager();
        let handle = manager.new_lock("job").unwrap();

        assert_eq!(handle.state(), LockState::Idle);
        assert_eq!(handle.token(), None);

        handle.acquire().await.unwrap();
        let token = handle.token().expect("token assigned");
        assert_eq!(handle.state(), LockState::Held);
        assert_eq!(handle.reentry(), 1);

        // Reentry does not change the token.
        handle.acquire().await.unwrap();
        assert_eq!(handle.token(), Some(token));
        assert_eq!(handle.reentry(), 2);

        handle.release().await.unwrap();
        handle.release().await.unwrap();
        assert_eq!(handle.state(), LockState::Released);
    }

    #[tokio::test]
    async fn reentry_ceiling_is_enforced() {
        let (manager, _) = manager();
        let options = crate::LockOptions {
            max_reentry: 2,
            ..crate::LockOptions::default()
        };
        let handle = manager.new_lock_with_options("job", options).unwrap();

        handle.acquire().await.unwrap();
        handle.acquire().await.unwrap();
        let err = handle.acquire().await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
        assert_eq!(handle.reentry(), 2);
    }

    #[tokio::test]
    async fn released_handle_is_terminal() {
        let (manager, store) = manager();
        let handle = manager.new_lock("job").unwrap();
        handle.acquire().await.unwrap();
        handle.release().await.unwrap();

        // None of these touch the store.
        let before = store.len();
        assert!(matches!(
            handle.acquire().await.unwrap_err(),
            LockError::InvalidArgument(_)
        ));
        assert!(matches!(
            handle.renew(None).await.unwrap_err(),
            LockError::NotHeld(_)
        ));
        assert!(matches!(
            handle.release().await.unwrap_err(),
            LockError::NotHeld(_)
        ));
        assert_eq!(store.len(), before);
    }

    #[tokio::test]
    async fn renew_on_idle_handle_fails_without_store_contact() {
        let (manager, _) = manager();
        let handle = manager.new_lock("job").unwrap();
        assert!(matches!(
            handle.renew(None).await.unwrap_err(),
            LockError::NotHeld(_)
        ));
    }

    #[tokio::test]
    async fn lost_lease_is_detected_on_renew() {
        let (manager, store) = manager();
        let handle = manager.new_lock("job").unwrap();
        handle.acquire().await.unwrap();

        // Simulate server-side loss.
        store.evict("job");
        store.evict("job:reentry");

        let err = handle.renew(None).await.unwrap_err();
        assert!(matches!(err, LockError::LeaseLost(_)));
        assert_eq!(handle.state(), LockState::Released);

        let stats = manager.stats();
        assert_eq!(stats.active_locks, 0);
        assert_eq!(stats.expirations_total, 1);
    }

    #[tokio::test]
    async fn is_locked_reflects_holder_identity() {
        let (manager, _) = manager();
        let ours = manager.new_lock("job").unwrap();
        let theirs = manager.new_lock("job").unwrap();

        ours.acquire().await.unwrap();
        assert!(ours.is_locked().await.unwrap());
        assert!(!theirs.is_locked().await.unwrap());

        // A distinct handle for the same key cannot reenter.
        assert!(matches!(
            theirs.acquire().await.unwrap_err(),
            LockError::Contended(_)
        ));

        ours.release().await.unwrap();
        assert!(!ours.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn contended_acquire_does_not_mutate_the_holder() {
        let (manager, store) = manager();
        let first = manager.new_lock("job").unwrap();
        first.acquire().await.unwrap();
        let holder = store.get("job").await.unwrap();

        let second = manager.new_lock("job").unwrap();
        let _ = second.acquire().await.unwrap_err();
        assert_eq!(store.get("job").await.unwrap(), holder);
    }
}
