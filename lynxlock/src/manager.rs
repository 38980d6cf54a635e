use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lynxlock_store::{reentry_key, LockError, LockScript, ScriptStore};

use crate::handle::LockHandle;
use crate::metrics::{LockMetrics, LockStats};
use crate::options::{LockOptions, ManagerConfig};
use crate::registry::LockRegistry;
use crate::renewal;
use crate::retry::RetryStrategy;
use crate::token::TokenAllocator;

/// How often the shutdown coordinator re-checks the active-lock count
/// while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process-wide state shared by the manager, its handles and the
/// renewal service.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn ScriptStore>,
    pub(crate) config: ManagerConfig,
    pub(crate) defaults: LockOptions,
    pub(crate) registry: LockRegistry,
    pub(crate) metrics: Arc<LockMetrics>,
    pub(crate) tokens: TokenAllocator,
    pub(crate) renewal_wake: Notify,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    renewal_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Spawn the renewal service if it is not already running.
    pub(crate) fn ensure_renewal_running(self: &Arc<Self>) {
        let mut slot = self.renewal_task.lock();
        if slot.is_none() && !self.shutting_down.load(Ordering::Acquire) {
            *slot = Some(tokio::spawn(renewal::run(Arc::clone(self))));
        }
    }
}

/// Builder for [`LockManager`].
pub struct LockManagerBuilder {
    store: Option<Arc<dyn ScriptStore>>,
    config: ManagerConfig,
    defaults: LockOptions,
}

impl LockManagerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            config: ManagerConfig::default(),
            defaults: LockOptions::default(),
        }
    }

    /// Set the store adapter (required).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ScriptStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the manager configuration.
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the options applied by `new_lock` and the convenience
    /// functions.
    #[must_use]
    pub fn default_options(mut self, options: LockOptions) -> Self {
        self.defaults = options;
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if no store was provided.
    pub fn build(self) -> Result<LockManager, LockError> {
        let store = self
            .store
            .ok_or_else(|| LockError::InvalidArgument("a store adapter is required".into()))?;
        Ok(LockManager::from_parts(store, self.config, self.defaults))
    }
}

impl Default for LockManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock service context: registry, counters, token allocator and
/// renewal service behind one value, constructed once at startup.
///
/// Cloning is cheap and shares the same process-wide state.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").finish_non_exhaustive()
    }
}

impl LockManager {
    /// Create a manager with default configuration.
    pub fn new(store: Arc<dyn ScriptStore>) -> Self {
        Self::from_parts(store, ManagerConfig::default(), LockOptions::default())
    }

    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::new()
    }

    fn from_parts(
        store: Arc<dyn ScriptStore>,
        config: ManagerConfig,
        defaults: LockOptions,
    ) -> Self {
        let metrics = Arc::new(LockMetrics::default());
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            tokens: TokenAllocator::new(Arc::clone(&store), config.token_key.clone()),
            registry: LockRegistry::new(Arc::clone(&metrics)),
            store,
            config,
            defaults,
            metrics,
            renewal_wake: Notify::new(),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            renewal_task: parking_lot::Mutex::new(None),
        });
        Self { shared }
    }

    fn fail(&self, error: LockError) -> LockError {
        self.shared.metrics.record_error(&error);
        error
    }

    /// Allocate a handle with the manager's default options. No store
    /// contact and no acquisition.
    pub fn new_lock(&self, key: impl Into<String>) -> Result<Arc<LockHandle>, LockError> {
        self.new_lock_with_options(key, self.shared.defaults.clone())
    }

    /// Allocate a handle with explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] for an empty key, a zero
    /// expiration or a renewal threshold outside `(0, 1]`.
    pub fn new_lock_with_options(
        &self,
        key: impl Into<String>,
        options: LockOptions,
    ) -> Result<Arc<LockHandle>, LockError> {
        let key = key.into();
        if key.is_empty() {
            return Err(self.fail(LockError::InvalidArgument(
                "lock key must not be empty".into(),
            )));
        }
        if options.expiration.is_zero() {
            return Err(self.fail(LockError::InvalidArgument(format!(
                "expiration must be positive for {key}"
            ))));
        }
        if !(options.renewal_threshold > 0.0 && options.renewal_threshold <= 1.0) {
            return Err(self.fail(LockError::InvalidArgument(format!(
                "renewal threshold must be in (0, 1] for {key}"
            ))));
        }
        Ok(LockHandle::new(key, options, Arc::clone(&self.shared)))
    }

    /// Run `f` under the lock: acquire with retry, execute, release on
    /// every exit. Release is attempted even when `f` fails or panics;
    /// its error is merged into the result only when `f` succeeded.
    pub async fn lock<T, E, F, Fut>(
        &self,
        key: &str,
        expiration: Duration,
        f: F,
    ) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = LockOptions {
            expiration,
            ..self.shared.defaults.clone()
        };
        self.run_locked(key, options, move |_token| f()).await
    }

    /// [`lock`](Self::lock) with explicit per-handle options.
    pub async fn lock_with_options<T, E, F, Fut>(
        &self,
        key: &str,
        options: LockOptions,
        f: F,
    ) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_locked(key, options, move |_token| f()).await
    }

    /// [`lock`](Self::lock) with an explicit retry strategy.
    pub async fn lock_with_retry<T, E, F, Fut>(
        &self,
        key: &str,
        expiration: Duration,
        strategy: RetryStrategy,
        f: F,
    ) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = LockOptions {
            expiration,
            retry: strategy,
            ..self.shared.defaults.clone()
        };
        self.run_locked(key, options, move |_token| f()).await
    }

    /// [`lock`](Self::lock), passing the fencing token to `f` so callers
    /// can reject stale writes at downstream storage.
    pub async fn lock_with_token<T, E, F, Fut>(
        &self,
        key: &str,
        expiration: Duration,
        f: F,
    ) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = LockOptions {
            expiration,
            ..self.shared.defaults.clone()
        };
        self.run_locked(key, options, f).await
    }

    async fn run_locked<T, E, F, Fut>(
        &self,
        key: &str,
        options: LockOptions,
        f: F,
    ) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let strategy = options.retry.clone();
        let handle = self.new_lock_with_options(key, options).map_err(E::from)?;
        handle.acquire_with_retry(&strategy).await.map_err(E::from)?;
        let token = match handle.token() {
            Some(token) => token,
            None => {
                return Err(E::from(self.fail(LockError::Protocol(format!(
                    "no fencing token assigned for {key}"
                )))));
            }
        };

        let guard = ReleaseGuard::new(Arc::clone(&handle));
        let result = f(token).await;
        let release_result = guard.release().await;

        match result {
            Ok(value) => match release_result {
                Ok(()) => Ok(value),
                Err(e) => Err(E::from(e)),
            },
            Err(err) => {
                if let Err(release_err) = release_result {
                    warn!(
                        key = %handle.key(),
                        error = %release_err,
                        "release failed after locked section error"
                    );
                }
                Err(err)
            }
        }
    }

    /// Release a lock record whose holder identity is supplied
    /// externally, for cross-process handoff. Runs the release script;
    /// fails with [`LockError::NotHeld`] on a holder mismatch.
    pub async fn unlock_by_value(&self, key: &str, value: &str) -> Result<(), LockError> {
        if key.is_empty() {
            return Err(self.fail(LockError::InvalidArgument(
                "lock key must not be empty".into(),
            )));
        }
        let keys = vec![key.to_string(), reentry_key(key)];
        let args = vec![value.to_string()];
        let reply = match self
            .shared
            .store
            .eval(LockScript::Release, &keys, &args)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };
        match reply.as_int() {
            Some(-1) => Err(self.fail(LockError::NotHeld(key.to_string()))),
            Some(depth) if depth >= 0 => {
                self.shared.metrics.increment_releases();
                debug!(key = %key, depth, "lock released by value");
                Ok(())
            }
            _ => Err(self.fail(LockError::Protocol(format!(
                "release replied malformed for {key}"
            )))),
        }
    }

    /// Point-in-time snapshot of the operational counters.
    pub fn stats(&self) -> LockStats {
        self.shared.metrics.snapshot()
    }

    /// The counters flattened into a string-to-number mapping.
    pub fn get_stats(&self) -> HashMap<String, u64> {
        self.stats().as_map()
    }

    /// Whether shutdown has been engaged.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Quiesce the service: refuse new acquisitions, stop the renewal
    /// service, then wait until every lock is released or `timeout`
    /// elapses.
    ///
    /// Locks still held are *not* released on the callers' behalf; they
    /// expire at their TTL. On deadline expiry the outstanding count is
    /// reported through [`LockError::ShutdownTimedOut`].
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;

        if !self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            let _ = self.shared.shutdown_tx.send(true);
            info!("lock service shutting down");
        }

        let task = self.shared.renewal_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("renewal service did not stop before the shutdown deadline");
            }
        }

        loop {
            // Cull handles that were dropped without release so they do
            // not hold the drain open.
            let _ = self.shared.registry.snapshot();
            let active = self.shared.metrics.active_locks.load(Ordering::Relaxed);
            if active == 0 {
                info!("lock service drained");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.fail(LockError::ShutdownTimedOut { active }));
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// Guarantees release on every exit from a locked section.
///
/// The explicit path consumes the guard; the `Drop` path is reached only
/// when the section panicked or its future was dropped, and then spawns
/// a best-effort release.
struct ReleaseGuard {
    handle: Option<Arc<LockHandle>>,
}

impl ReleaseGuard {
    fn new(handle: Arc<LockHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    async fn release(mut self) -> Result<(), LockError> {
        match self.handle.take() {
            Some(handle) => handle.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                let key = handle.key().to_string();
                if let Err(e) = handle.release().await {
                    warn!(key = %key, error = %e, "best-effort release failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lynxlock_memory::MemoryScriptStore;

    fn manager() -> (LockManager, Arc<MemoryScriptStore>) {
        let store = Arc::new(MemoryScriptStore::new());
        (LockManager::new(Arc::clone(&store) as Arc<dyn ScriptStore>), store)
    }

    #[test]
    fn builder_requires_a_store() {
        let err = LockManager::builder().build().unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn new_lock_validates_input() {
        let (manager, _) = manager();

        assert!(matches!(
            manager.new_lock("").unwrap_err(),
            LockError::InvalidArgument(_)
        ));

        let zero = LockOptions {
            expiration: Duration::ZERO,
            ..LockOptions::default()
        };
        assert!(matches!(
            manager.new_lock_with_options("job", zero).unwrap_err(),
            LockError::InvalidArgument(_)
        ));

        let bad_threshold = LockOptions {
            renewal_threshold: 1.5,
            ..LockOptions::default()
        };
        assert!(matches!(
            manager
                .new_lock_with_options("job", bad_threshold)
                .unwrap_err(),
            LockError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn scoped_lock_releases_on_success_and_failure() {
        let (manager, store) = manager();

        let value: Result<u32, LockError> = manager
            .lock("job", Duration::from_secs(5), || async { Ok(41 + 1) })
            .await;
        assert_eq!(value.unwrap(), 42);
        assert!(store.is_empty());

        let failed: Result<(), LockError> = manager
            .lock("job", Duration::from_secs(5), || async {
                Err(LockError::InvalidArgument("user failure".into()))
            })
            .await;
        assert!(matches!(failed.unwrap_err(), LockError::InvalidArgument(_)));
        // Released even though the closure failed.
        assert!(store.is_empty());

        let stats = manager.stats();
        assert_eq!(stats.acquisitions_total, 2);
        assert_eq!(stats.releases_total, 2);
        assert_eq!(stats.active_locks, 0);
    }

    #[tokio::test]
    async fn lock_with_token_passes_the_fencing_token() {
        let (manager, _) = manager();

        let first: i64 = manager
            .lock_with_token("a", Duration::from_secs(5), |token| async move {
                Ok::<_, LockError>(token)
            })
            .await
            .unwrap();
        let second: i64 = manager
            .lock_with_token("b", Duration::from_secs(5), |token| async move {
                Ok::<_, LockError>(token)
            })
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn unlock_by_value_requires_the_right_holder() {
        let (manager, store) = manager();
        let handle = manager.new_lock("job").unwrap();
        handle.acquire().await.unwrap();

        assert!(matches!(
            manager.unlock_by_value("job", "not-the-holder").await,
            Err(LockError::NotHeld(_))
        ));
        assert!(handle.is_locked().await.unwrap());

        let holder = store.get("job").await.unwrap().unwrap();
        manager.unlock_by_value("job", &holder).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_acquisitions() {
        let (manager, _) = manager();
        manager.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(manager.is_shutting_down());

        let handle = manager.new_lock("job").unwrap();
        assert!(matches!(
            handle.acquire().await.unwrap_err(),
            LockError::ShuttingDown
        ));
    }

    #[tokio::test]
    async fn shutdown_reports_still_active_locks() {
        let (manager, _) = manager();
        let handle = manager.new_lock("job").unwrap();
        handle.acquire().await.unwrap();

        let err = manager.shutdown(Duration::from_millis(120)).await.unwrap_err();
        assert!(matches!(err, LockError::ShutdownTimedOut { active: 1 }));

        // A late release still works; the server remains authoritative.
        handle.release().await.unwrap();
        manager.shutdown(Duration::from_millis(120)).await.unwrap();
    }

    #[tokio::test]
    async fn get_stats_projects_the_snapshot() {
        let (manager, _) = manager();
        let done: Result<(), LockError> = manager
            .lock("job", Duration::from_secs(5), || async { Ok(()) })
            .await;
        done.unwrap();

        let map = manager.get_stats();
        assert_eq!(map["acquisitions_total"], 1);
        assert_eq!(map["releases_total"], 1);
        assert_eq!(map["active_locks"], 0);
        assert_eq!(map["total_locks"], 1);
        assert_eq!(map["hold_duration_ms_count"], 1);
    }
}
