//! End-to-end scenarios against the in-memory store adapter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use lynxlock::{
    LockError, LockManager, LockOptions, LockScript, LockState, RetryStrategy, ScriptReply,
    ScriptStore,
};
use lynxlock_memory::MemoryScriptStore;

fn manager() -> (LockManager, Arc<MemoryScriptStore>) {
    let store = Arc::new(MemoryScriptStore::new());
    (
        LockManager::new(Arc::clone(&store) as Arc<dyn ScriptStore>),
        store,
    )
}

/// Wraps the memory store and fails the first N acquire scripts with a
/// transport error.
struct FlakyStore {
    inner: MemoryScriptStore,
    remaining_failures: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryScriptStore::new(),
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ScriptStore for FlakyStore {
    async fn eval(
        &self,
        script: LockScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, LockError> {
        if script == LockScript::Acquire {
            let injected = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(LockError::Unavailable("injected transport failure".into()));
            }
        }
        self.inner.eval(script, keys, args).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        self.inner.get(key).await
    }
}

#[tokio::test(start_paused = true)]
async fn single_holder_clean_release() {
    let (manager, store) = manager();

    let done: Result<(), LockError> = manager
        .lock("k", Duration::from_secs(10), || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
    done.unwrap();

    assert_eq!(store.get("k").await.unwrap(), None);
    assert!(store.is_empty());

    let stats = manager.stats();
    assert_eq!(stats.acquisitions_total, 1);
    assert_eq!(stats.releases_total, 1);
    assert_eq!(stats.active_locks, 0);
}

#[tokio::test(start_paused = true)]
async fn contended_holders_serialize() {
    let (manager, store) = manager();
    let strategy = RetryStrategy {
        max_retries: 50,
        retry_delay: Duration::from_millis(30),
        ..RetryStrategy::default()
    };

    let started = Instant::now();
    let run = |m: LockManager, s: RetryStrategy| async move {
        m.lock_with_retry("k", Duration::from_secs(2), s, || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, LockError>(())
        })
        .await
    };

    let (a, b) = tokio::join!(
        run(manager.clone(), strategy.clone()),
        run(manager.clone(), strategy)
    );
    a.unwrap();
    b.unwrap();

    // The critical sections cannot overlap.
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(store.is_empty());

    let stats = manager.stats();
    assert_eq!(stats.acquisitions_total, 2);
    assert_eq!(stats.releases_total, 2);
    assert!(stats.retries_total >= 1);
    assert!(stats.errors_by_kind["contended"] >= 1);
}

#[tokio::test]
async fn reentry_unwinds_through_the_store() {
    let (manager, store) = manager();
    let handle = manager.new_lock("k").unwrap();

    handle.acquire().await.unwrap();
    handle.acquire().await.unwrap();
    assert_eq!(handle.reentry(), 2);
    assert_eq!(store.get("k:reentry").await.unwrap().as_deref(), Some("2"));

    handle.release().await.unwrap();
    assert_eq!(handle.state(), LockState::Held);
    assert_eq!(handle.reentry(), 1);
    assert_eq!(store.get("k:reentry").await.unwrap().as_deref(), Some("1"));

    handle.release().await.unwrap();
    assert_eq!(handle.state(), LockState::Released);
    assert!(store.is_empty());
    assert_eq!(manager.stats().active_locks, 0);
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_a_long_job_alive() {
    let (manager, store) = manager();
    let options = LockOptions {
        expiration: Duration::from_secs(2),
        renewal_enabled: true,
        renewal_threshold: 0.5,
        ..LockOptions::default()
    };

    let done: Result<(), LockError> = manager
        .lock_with_options("k", options, || async {
            tokio::time::sleep(Duration::from_secs(6)).await;
            Ok(())
        })
        .await;
    done.unwrap();

    assert!(store.is_empty());
    let stats = manager.stats();
    assert!(stats.renewal_count >= 2, "renewals: {}", stats.renewal_count);
    assert_eq!(stats.expirations_total, 0);
    assert_eq!(stats.releases_total, 1);
}

#[tokio::test]
async fn fencing_tokens_are_strictly_monotonic() {
    let (manager, _) = manager();

    let mut last = 0;
    for i in 0..100 {
        let token: i64 = manager
            .lock_with_token(&format!("k{i}"), Duration::from_secs(5), |token| async move {
                Ok::<_, LockError>(token)
            })
            .await
            .unwrap();
        assert!(token > last, "token {token} not above {last}");
        last = token;
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_a_late_release() {
    let (manager, store) = manager();
    let handle = manager.new_lock("k").unwrap();
    handle.acquire().await.unwrap();

    let coordinator = manager.clone();
    let shutdown = tokio::spawn(async move { coordinator.shutdown(Duration::from_millis(500)).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.release().await.unwrap();

    shutdown.await.unwrap().unwrap();
    assert!(manager.is_shutting_down());
    assert!(store.is_empty());

    // New acquisitions are refused after shutdown.
    let late = manager.new_lock("k2").unwrap();
    assert!(matches!(
        late.acquire().await.unwrap_err(),
        LockError::ShuttingDown
    ));
}

#[tokio::test(start_paused = true)]
async fn transient_transport_failures_are_retried() {
    let store = Arc::new(FlakyStore::new(2));
    let manager = LockManager::new(store);
    let strategy = RetryStrategy {
        max_retries: 5,
        retry_delay: Duration::from_millis(20),
        ..RetryStrategy::default()
    };

    let handle = manager.new_lock("k").unwrap();
    handle.acquire_with_retry(&strategy).await.unwrap();
    assert_eq!(handle.state(), LockState::Held);

    let stats = manager.stats();
    assert!(stats.retries_total >= 2);
    assert_eq!(stats.errors_by_kind["unavailable"], 2);

    handle.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retries_exhaust_against_a_dead_store() {
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let manager = LockManager::new(store);
    let strategy = RetryStrategy {
        max_retries: 2,
        retry_delay: Duration::from_millis(20),
        ..RetryStrategy::default()
    };

    let handle = manager.new_lock("k").unwrap();
    let err = handle.acquire_with_retry(&strategy).await.unwrap_err();
    match err {
        LockError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, LockError::Unavailable(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    let stats = manager.stats();
    assert_eq!(stats.retry_failures_total, 1);
    assert_eq!(stats.retries_total, 2);
    assert_eq!(stats.active_locks, 0);
}

#[tokio::test]
async fn acquire_then_release_restores_counters() {
    let (manager, store) = manager();

    let before = manager.stats();
    let handle = manager.new_lock("k").unwrap();
    handle.acquire().await.unwrap();
    handle.release().await.unwrap();

    let after = manager.stats();
    assert_eq!(after.active_locks, before.active_locks);
    assert!(store.is_empty());

    // A second release on the released handle is rejected and changes
    // no lock counters.
    let releases = after.releases_total;
    assert!(matches!(
        handle.release().await.unwrap_err(),
        LockError::NotHeld(_)
    ));
    assert_eq!(manager.stats().releases_total, releases);
}
