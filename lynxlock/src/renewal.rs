//! Background renewal service.
//!
//! One task per manager, started lazily on the first registered handle
//! and stopped by the shutdown coordinator. Each tick sweeps the
//! registry and renews every Held handle whose remaining TTL has fallen
//! below its threshold, on a semaphore-bounded worker pool. The service
//! reaches handles only through the registry and never runs user code.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::handle::LockState;
use crate::manager::Shared;

/// Floor on the effective tick, so very short expirations cannot spin
/// the scheduler.
const MIN_TICK: Duration = Duration::from_millis(10);

pub(crate) async fn run(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let semaphore = Arc::new(Semaphore::new(shared.config.worker_pool_size.max(1)));
    let tracker = TaskTracker::new();
    info!("renewal service started");

    loop {
        // The shutdown signal may have been sent before this task
        // subscribed; the flag is authoritative.
        if shared.shutting_down.load(Ordering::Acquire) {
            break;
        }
        let tick = next_tick(&shared);
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            // A fresh registration may need a shorter tick than the one
            // currently slept on; recompute.
            _ = shared.renewal_wake.notified() => continue,
            _ = tokio::time::sleep(tick) => {}
        }
        sweep(&shared, &semaphore, &tracker);
    }

    tracker.close();
    tracker.wait().await;
    info!("renewal service stopped");
}

/// Scheduling granularity: the configured interval, or half the
/// smallest active expiration if that is smaller.
fn next_tick(shared: &Shared) -> Duration {
    let smallest = shared
        .registry
        .snapshot()
        .iter()
        .filter(|h| h.options().renewal_enabled && h.state() == LockState::Held)
        .map(|h| h.expiration())
        .min();
    match smallest {
        Some(expiration) => shared
            .config
            .renewal_interval
            .min(expiration / 2)
            .max(MIN_TICK),
        None => shared.config.renewal_interval,
    }
}

fn sweep(shared: &Arc<Shared>, semaphore: &Arc<Semaphore>, tracker: &TaskTracker) {
    for handle in shared.registry.snapshot() {
        if !handle.options().renewal_enabled {
            continue;
        }
        if shared.shutting_down.load(Ordering::Acquire) || handle.state() != LockState::Held {
            shared.metrics.increment_skipped_renewals();
            continue;
        }

        let remaining = handle.expires_at().saturating_duration_since(Instant::now());
        let ratio = remaining.as_secs_f64() / handle.expiration().as_secs_f64();
        if ratio > handle.options().renewal_threshold {
            shared.metrics.increment_skipped_renewals();
            continue;
        }

        let semaphore = Arc::clone(semaphore);
        tracker.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            handle.service_renew().await;
        });
    }
}
