use std::time::Duration;

use rand::Rng;

/// Exponential-backoff parameters for contended acquisitions.
///
/// The delay for attempt `n` is `retry_delay * multiplier^n`, clamped to
/// `max_interval` and then perturbed by uniform jitter in
/// `[0.5, 1.5] * delay` so concurrent waiters do not all retry at the
/// same instant. The whole loop is additionally bounded by `max_retries`
/// and `max_elapsed_time`.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Retry ceiling (the first attempt is not a retry).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub retry_delay: Duration,
    /// Factor applied on each successive attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max_interval: Duration,
    /// Cumulative budget; the loop gives up once sleeping would cross it.
    pub max_elapsed_time: Duration,
    /// When `true`, uniform jitter is applied to every delay.
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// A strategy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Compute the unjittered delay for the given zero-based `attempt`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use lynxlock::RetryStrategy;
    ///
    /// let strategy = RetryStrategy::default();
    /// assert_eq!(strategy.delay_for(0), Duration::from_millis(100));
    /// assert_eq!(strategy.delay_for(2), Duration::from_millis(400));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // In practice `attempt` is a small retry count, far below i32::MAX.
        #[allow(clippy::cast_possible_wrap)]
        let raw = self.retry_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let clamped = raw.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    /// The delay actually slept for `attempt`, with jitter applied.
    pub(crate) fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}
