//! Convergence primitives for remote state that is only observable by polling.
//!
//! The resource manager accepts mutations asynchronously and offers no
//! notification when it has caught up. This crate turns that into a
//! synchronous contract at the caller's boundary:
//!
//! - **Read**: an async read of the current remote state.
//! - **Evaluate**: a pure classification of that state as a [`ConvergenceStatus`].
//! - **Poll**: repeat read + evaluate, sleeping between attempts according to
//!   a [`PollPolicy`], until the state converges, diverges, or the deadline
//!   passes.
//!
//! # Invariants
//!
//! - Sleeping suspends only the calling task (`tokio::time::sleep`).
//! - The read is always attempted at least once, even with a zero timeout.
//! - A read error the caller marks as retryable is absorbed and the read is
//!   repeated until the deadline; any other read error is returned at once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Polling errors.
#[derive(Debug, Error)]
pub enum ReconcileError<E> {
    /// The deadline passed before the state converged. The remote mutation
    /// may still be in flight.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// The remote state reached a terminal state that will never converge.
    #[error("{resource} diverged after {attempts} attempts")]
    Diverged { resource: String, attempts: u32 },

    /// The read failed with an error that is not worth retrying.
    #[error("reading {resource} failed after {attempts} attempts: {source}")]
    Read {
        resource: String,
        attempts: u32,
        #[source]
        source: E,
    },
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (current is moving toward desired).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,

    /// Status is unknown (insufficient data).
    Unknown,
}

impl ConvergenceStatus {
    /// Classifies a boolean predicate.
    pub fn from_predicate(satisfied: bool) -> Self {
        if satisfied {
            Self::Converged
        } else {
            Self::Converging
        }
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// A fixed interval with no growth and no jitter.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            max: interval,
            jitter: 0.0,
        }
    }

    /// Calculate the delay after the given (zero-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.saturating_mul(1 << attempt.min(16)).min(self.max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }

        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        delay.mul_f64(factor).min(self.max)
    }
}

/// How long and how often to poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Inter-attempt delay schedule.
    pub backoff: BackoffPolicy,

    /// Total time budget, measured from the first read.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Poll with exponential backoff.
    pub fn new(backoff: BackoffPolicy, timeout: Duration) -> Self {
        Self { backoff, timeout }
    }

    /// Poll at a fixed interval.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self::new(BackoffPolicy::fixed(interval), timeout)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), DEFAULT_CONVERGENCE_TIMEOUT)
    }
}

/// Poll `read` until `evaluate` reports convergence.
///
/// Returns the first value read classified as [`ConvergenceStatus::Converged`].
/// Read errors for which `retryable` returns true count as a failed attempt
/// and polling continues; the deadline still applies. The final sleep is
/// shortened so that the last read happens at the deadline rather than
/// after it.
pub async fn await_condition<T, E, P, Fut, F, R>(
    policy: &PollPolicy,
    resource: &str,
    mut read: P,
    retryable: R,
    mut evaluate: F,
) -> Result<T, ReconcileError<E>>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    F: FnMut(&T) -> ConvergenceStatus,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempt: u32 = 0;

    loop {
        let observed = read().await;
        attempt += 1;

        match observed {
            Ok(value) => match evaluate(&value) {
                ConvergenceStatus::Converged => {
                    debug!(
                        resource,
                        attempts = attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Converged"
                    );
                    return Ok(value);
                }
                ConvergenceStatus::Diverged => {
                    return Err(ReconcileError::Diverged {
                        resource: resource.to_string(),
                        attempts: attempt,
                    });
                }
                ConvergenceStatus::Converging | ConvergenceStatus::Unknown => {}
            },
            Err(e) if retryable(&e) => {
                warn!(resource, attempt, error = %e, "Status read failed, retrying");
            }
            Err(source) => {
                return Err(ReconcileError::Read {
                    resource: resource.to_string(),
                    attempts: attempt,
                    source,
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReconcileError::Timeout {
                resource: resource.to_string(),
                elapsed: now.duration_since(started),
            });
        }

        let delay = policy.backoff.delay(attempt - 1).min(deadline - now);
        trace!(resource, attempt, delay_ms = delay.as_millis() as u64, "Not converged yet");
        tokio::time::sleep(delay).await;
    }
}

/// Default deadline for a single convergence wait.
pub const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(120);

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_read(
        counter: &Arc<AtomicU32>,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, Infallible>> + '_ {
        move || std::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn never<E>(_: &E) -> bool {
        false
    }

    #[test]
    fn test_backoff_grows_to_max() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.5,
        };

        for _ in 0..100 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_millis(49) && d <= Duration::from_millis(151));
        }
    }

    #[test]
    fn test_fixed_policy() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(20));
        assert_eq!(policy.delay(0), policy.delay(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_several_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = PollPolicy::fixed(Duration::from_millis(100), Duration::from_secs(5));

        let value = await_condition(&policy, "svc", counter_read(&counter), never, |n| {
            ConvergenceStatus::from_predicate(*n >= 3)
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = PollPolicy::fixed(Duration::from_millis(250), Duration::from_secs(5));
        let started = Instant::now();

        await_condition(&policy, "svc", counter_read(&counter), never, |n| {
            ConvergenceStatus::from_predicate(*n >= 4)
        })
        .await
        .unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = PollPolicy::fixed(Duration::from_millis(300), Duration::from_secs(1));

        let err = await_condition(&policy, "svc/comp", counter_read(&counter), never, |_| {
            ConvergenceStatus::Converging
        })
        .await
        .unwrap_err();

        match err {
            ReconcileError::Timeout { resource, elapsed } => {
                assert_eq!(resource, "svc/comp");
                assert_eq!(elapsed, Duration::from_secs(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        // t=0, 300, 600, 900, 1000
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_reads_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = PollPolicy::fixed(Duration::from_millis(10), Duration::ZERO);

        let err = await_condition(&policy, "svc", counter_read(&counter), never, |_| {
            ConvergenceStatus::Unknown
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::Timeout { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diverged_stops_early() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(60));

        let err = await_condition(&policy, "svc", counter_read(&counter), never, |n| {
            if *n == 2 {
                ConvergenceStatus::Diverged
            } else {
                ConvergenceStatus::Converging
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::Diverged { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_is_returned() {
        let policy = PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(60));

        let err = await_condition(
            &policy,
            "svc",
            || async { Err::<u32, _>("bad request") },
            never,
            |_| ConvergenceStatus::Converged,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Read {
                source: "bad request",
                attempts: 1,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_error_is_absorbed() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(60));

        let value = await_condition(
            &policy,
            "svc",
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 2 {
                        Err("service unavailable")
                    } else {
                        Ok(n)
                    }
                }
            },
            |e: &&str| *e == "service unavailable",
            |_| ConvergenceStatus::Converged,
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_error_still_honors_deadline() {
        let policy = PollPolicy::fixed(Duration::from_millis(100), Duration::from_millis(250));

        let err = await_condition(
            &policy,
            "svc",
            || async { Err::<u32, _>("service unavailable") },
            |_| true,
            |_| ConvergenceStatus::Converged,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::Timeout { .. }));
    }
}
