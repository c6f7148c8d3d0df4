//! Retry policies with bounded exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value pairing a backoff schedule with a
//! classifier that decides which failures are worth another attempt. Policies
//! compose by nesting: `outer.run(|| inner.run(op))`. A failure the inner
//! classifier rejects escapes to the outer policy immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use thiserror::Error;
use tokio::time::{Instant, sleep};

/// Initial wait before the first retry.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on any single backoff wait.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Outcome of a policy that did not produce a value.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RetryError<E> {
    /// The classifier declined the failure; it propagates unchanged.
    #[error("{0}")]
    Rejected(E),
    /// Retryable failures continued until the deadline or attempt cap.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Failure reported by the final attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Returns the underlying failure regardless of how the policy ended.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Rejected(err) | Self::Exhausted { last: err, .. } => err,
        }
    }
}

/// Exponential backoff schedule paired with a retry classifier.
pub struct RetryPolicy<E> {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    deadline: Option<Duration>,
    max_attempts: Option<u32>,
    classifier: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("initial_interval", &self.initial_interval)
            .field("multiplier", &self.multiplier)
            .field("max_interval", &self.max_interval)
            .field("deadline", &self.deadline)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<E> RetryPolicy<E> {
    /// Creates a doubling policy starting at one second with no limits.
    ///
    /// Callers are expected to bound the policy with [`Self::with_deadline`]
    /// or [`Self::with_max_attempts`].
    #[must_use]
    pub const fn new(classifier: fn(&E) -> bool) -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            multiplier: 2.0,
            max_interval: DEFAULT_MAX_INTERVAL,
            deadline: None,
            max_attempts: None,
            classifier,
        }
    }

    /// Doubling policy bounded by total elapsed time.
    #[must_use]
    pub const fn exponential(classifier: fn(&E) -> bool, deadline: Duration) -> Self {
        Self::new(classifier).with_deadline(deadline)
    }

    /// Fixed-interval policy bounded by an attempt count.
    #[must_use]
    pub const fn fixed(classifier: fn(&E) -> bool, attempts: u32, interval: Duration) -> Self {
        Self::new(classifier)
            .with_initial_interval(interval)
            .with_multiplier(1.0)
            .with_max_attempts(attempts)
    }

    /// Overrides the first backoff interval.
    #[must_use]
    pub const fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Overrides the growth factor between consecutive waits.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Caps any single wait.
    #[must_use]
    pub const fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Stops retrying once this much time has elapsed since the first attempt.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stops retrying after this many attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Returns `true` when the classifier accepts `err` as retryable.
    #[must_use]
    pub fn accepts(&self, err: &E) -> bool {
        (self.classifier)(err)
    }

    fn schedule(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    fn exhausted(&self, attempts: u32, started: Instant) -> bool {
        self.max_attempts.is_some_and(|cap| attempts >= cap)
            || self
                .deadline
                .is_some_and(|deadline| started.elapsed() >= deadline)
    }

    /// Invokes `operation` until it succeeds, fails with a failure the
    /// classifier rejects, or the policy's bounds are reached.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Rejected`] on the first non-retryable failure and
    /// [`RetryError::Exhausted`] once the deadline or attempt cap is reached.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut schedule = self.schedule();
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.accepts(&err) {
                return Err(RetryError::Rejected(err));
            }

            let wait = schedule.next_backoff();
            match wait {
                Some(interval) if !self.exhausted(attempts, started) => {
                    tracing::debug!(
                        attempt = attempts,
                        wait_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                        "retrying after transient failure"
                    );
                    sleep(interval).await;
                }
                _ => return Err(RetryError::Exhausted { attempts, last: err }),
            }
        }
    }
}
