use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lynxlock_store::LockError;

/// Bucket upper bounds (milliseconds) for the duration histograms.
const BUCKET_BOUNDS_MS: [u64; 12] = [
    5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000,
];

/// Fixed-bucket duration histogram with atomic cells.
#[derive(Debug, Default)]
pub struct DurationHistogram {
    // One overflow bucket past the last bound.
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl DurationHistogram {
    /// Record one observation.
    pub fn observe(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Point-in-time copy of the histogram.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            buckets: BUCKET_BOUNDS_MS
                .iter()
                .copied()
                .map(Some)
                .chain([None])
                .zip(self.buckets.iter())
                .map(|(bound, cell)| (bound, cell.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Plain-data snapshot of a [`DurationHistogram`].
///
/// `buckets` pairs each upper bound in milliseconds (`None` for the
/// overflow bucket) with its observation count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub buckets: Vec<(Option<u64>, u64)>,
}

/// Per-kind error counters matching the error taxonomy.
#[derive(Debug, Default)]
struct ErrorCounters {
    contended: AtomicU64,
    unavailable: AtomicU64,
    cancelled: AtomicU64,
    invalid_argument: AtomicU64,
    not_held: AtomicU64,
    lease_lost: AtomicU64,
    retries_exhausted: AtomicU64,
    shutting_down: AtomicU64,
    shutdown_timed_out: AtomicU64,
    protocol: AtomicU64,
    busy: AtomicU64,
}

impl ErrorCounters {
    fn cell(&self, kind: &str) -> &AtomicU64 {
        match kind {
            "contended" => &self.contended,
            "unavailable" => &self.unavailable,
            "cancelled" => &self.cancelled,
            "invalid_argument" => &self.invalid_argument,
            "not_held" => &self.not_held,
            "lease_lost" => &self.lease_lost,
            "retries_exhausted" => &self.retries_exhausted,
            "shutting_down" => &self.shutting_down,
            "shutdown_timed_out" => &self.shutdown_timed_out,
            "busy" => &self.busy,
            _ => &self.protocol,
        }
    }

    fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            ("contended", self.contended.load(Ordering::Relaxed)),
            ("unavailable", self.unavailable.load(Ordering::Relaxed)),
            ("cancelled", self.cancelled.load(Ordering::Relaxed)),
            (
                "invalid_argument",
                self.invalid_argument.load(Ordering::Relaxed),
            ),
            ("not_held", self.not_held.load(Ordering::Relaxed)),
            ("lease_lost", self.lease_lost.load(Ordering::Relaxed)),
            (
                "retries_exhausted",
                self.retries_exhausted.load(Ordering::Relaxed),
            ),
            ("shutting_down", self.shutting_down.load(Ordering::Relaxed)),
            (
                "shutdown_timed_out",
                self.shutdown_timed_out.load(Ordering::Relaxed),
            ),
            ("protocol", self.protocol.load(Ordering::Relaxed)),
            ("busy", self.busy.load(Ordering::Relaxed)),
        ])
    }
}

/// Atomic counters tracking lock operations process-wide.
///
/// All counters use relaxed ordering; call [`snapshot`](Self::snapshot)
/// for a consistent point-in-time view. These counters are the only
/// source of truth for the public stats surface.
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Handles that ever transitioned to Held.
    pub total_locks: AtomicU64,
    /// Handles currently Held.
    pub active_locks: AtomicU64,
    /// Successful ACQUIRE executions, first acquires and reentries alike.
    pub acquisitions: AtomicU64,
    /// Successful RELEASE executions, partial and full alike.
    pub releases: AtomicU64,
    /// Successful RENEW executions, user- and service-initiated.
    pub renewals: AtomicU64,
    /// Renewals that failed or observed a lost lease.
    pub renewal_errors: AtomicU64,
    /// Renewal-service passes over a handle that issued no RENEW.
    pub skipped_renewals: AtomicU64,
    /// Leases observed lost or abandoned to server-side expiry.
    pub expirations: AtomicU64,
    /// Retry sleeps performed by the retry engine.
    pub retries: AtomicU64,
    /// Retry loops that gave up.
    pub retry_failures: AtomicU64,
    errors: ErrorCounters,
    /// Time from first acquire to full release.
    pub hold_duration: DurationHistogram,
    /// Time spent inside a retried acquisition.
    pub retry_duration: DurationHistogram,
}

impl LockMetrics {
    pub fn increment_total_locks(&self) {
        self.total_locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_active_locks(&self) {
        self.active_locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active_locks(&self) {
        self.active_locks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn increment_acquisitions(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_releases(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_renewals(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_renewal_errors(&self) {
        self.renewal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_skipped_renewals(&self) {
        self.skipped_renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_expirations(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_failures(&self) {
        self.retry_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error against its taxonomy kind.
    pub fn record_error(&self, error: &LockError) {
        self.errors.cell(error.kind()).fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> LockStats {
        let errors = self.errors.snapshot();
        LockStats {
            total_locks: self.total_locks.load(Ordering::Relaxed),
            active_locks: self.active_locks.load(Ordering::Relaxed),
            acquisitions_total: self.acquisitions.load(Ordering::Relaxed),
            releases_total: self.releases.load(Ordering::Relaxed),
            renewal_count: self.renewals.load(Ordering::Relaxed),
            renewal_errors: self.renewal_errors.load(Ordering::Relaxed),
            skipped_renewals: self.skipped_renewals.load(Ordering::Relaxed),
            expirations_total: self.expirations.load(Ordering::Relaxed),
            retries_total: self.retries.load(Ordering::Relaxed),
            retry_failures_total: self.retry_failures.load(Ordering::Relaxed),
            errors_total: errors.values().sum(),
            errors_by_kind: errors,
            hold_duration: self.hold_duration.snapshot(),
            retry_duration: self.retry_duration.snapshot(),
        }
    }
}

/// A plain data snapshot of [`LockMetrics`] at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStats {
    pub total_locks: u64,
    pub active_locks: u64,
    pub acquisitions_total: u64,
    pub releases_total: u64,
    pub renewal_count: u64,
    pub renewal_errors: u64,
    pub skipped_renewals: u64,
    pub expirations_total: u64,
    pub retries_total: u64,
    pub retry_failures_total: u64,
    pub errors_total: u64,
    pub errors_by_kind: BTreeMap<&'static str, u64>,
    pub hold_duration: HistogramSnapshot,
    pub retry_duration: HistogramSnapshot,
}

impl LockStats {
    /// Flatten the snapshot into a string-to-number mapping.
    pub fn as_map(&self) -> HashMap<String, u64> {
        let mut map = HashMap::from([
            ("total_locks".to_string(), self.total_locks),
            ("active_locks".to_string(), self.active_locks),
            ("acquisitions_total".to_string(), self.acquisitions_total),
            ("releases_total".to_string(), self.releases_total),
            ("renewal_count".to_string(), self.renewal_count),
            ("renewal_errors".to_string(), self.renewal_errors),
            ("skipped_renewals".to_string(), self.skipped_renewals),
            ("expirations_total".to_string(), self.expirations_total),
            ("retries_total".to_string(), self.retries_total),
            ("retry_failures_total".to_string(), self.retry_failures_total),
            ("errors_total".to_string(), self.errors_total),
            ("hold_duration_ms_count".to_string(), self.hold_duration.count),
            ("hold_duration_ms_sum".to_string(), self.hold_duration.sum_ms),
            ("retry_duration_ms_count".to_string(), self.retry_duration.count),
            ("retry_duration_ms_sum".to_string(), self.retry_duration.sum_ms),
        ]);
        for (kind, count) in &self.errors_by_kind {
            map.insert(format!("errors_total_{kind}"), *count);
        }
        map
    }
}
