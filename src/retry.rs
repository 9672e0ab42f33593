//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The stream worker uses
//! [`ReconnectBackoff`] to space reconnect attempts and [`with_timeout`] to
//! bound waits on correlated replies.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Policy controlling how reconnect delays grow across a failure streak.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Smallest random increment added after each failure.
    pub min_step: Duration,
    /// Largest random increment added after each failure.
    pub max_step: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Increments of 5 to 10 whole seconds, capped at one minute.
    pub fn standard() -> Self {
        Self {
            min_step: Duration::from_secs(5),
            max_step: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        }
    }

    fn random_step<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let low = self.min_step.as_secs();
        let high = self.max_step.as_secs().max(low);
        Duration::from_secs(rng.gen_range(low..=high))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Stateful reconnect delay tracker.
///
/// The first failure of a streak reconnects immediately; each later failure
/// waits a little longer, up to [`BackoffPolicy::max_delay`].
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            delay: Duration::ZERO,
        }
    }

    /// Delay the next scheduled attempt would use.
    pub fn current(&self) -> Duration {
        self.delay
    }

    /// Returns the delay for the attempt being scheduled now and grows the
    /// stored delay for the next failure.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Same as [`Self::next_delay`] with a caller-supplied RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let scheduled = self.delay;
        let grown = self.delay.saturating_add(self.policy.random_step(rng));
        self.delay = grown.min(self.policy.max_delay);
        debug!(
            event = "reconnect_backoff_advanced",
            scheduled_ms = scheduled.as_millis() as u64,
            next_ms = self.delay.as_millis() as u64
        );
        scheduled
    }

    /// Ends the failure streak.
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::standard())
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{with_timeout, BackoffPolicy, ReconnectBackoff};

    #[test]
    fn first_failure_reconnects_immediately() {
        let mut backoff = ReconnectBackoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff.next_delay_with(&mut rng), Duration::ZERO);
        let grown = backoff.current();
        assert!(grown >= Duration::from_secs(5) && grown <= Duration::from_secs(10));
    }

    #[test]
    fn delays_grow_within_step_bounds_and_cap_at_one_minute() {
        let mut backoff = ReconnectBackoff::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut previous = backoff.next_delay_with(&mut rng);

        for _ in 0..30 {
            let delay = backoff.next_delay_with(&mut rng);
            assert!(delay >= previous, "delay must not shrink within a streak");
            assert!(delay <= Duration::from_secs(60));
            let step = delay - previous;
            if delay < Duration::from_secs(60) {
                assert!(
                    step >= Duration::from_secs(5) && step <= Duration::from_secs(10),
                    "unexpected step {step:?}"
                );
            }
            previous = delay;
        }

        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn reset_restarts_the_streak() {
        let mut backoff = ReconnectBackoff::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..4 {
            backoff.next_delay_with(&mut rng);
        }
        assert!(backoff.current() > Duration::ZERO);

        backoff.reset();
        assert_eq!(backoff.next_delay_with(&mut rng), Duration::ZERO);
        assert!(backoff.current() <= Duration::from_secs(10));
    }

    #[test]
    fn fixed_step_policy_is_deterministic() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy {
            min_step: Duration::from_secs(2),
            max_step: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
        });
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn timeout_elapses_for_pending_future() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let result = with_timeout(
                Duration::from_secs(1),
                std::future::pending::<()>(),
            )
            .await;
            assert!(result.is_err());

            let ready = with_timeout(Duration::from_secs(1), async { 5 }).await;
            assert_eq!(ready.expect("ready future"), 5);
        });
    }
}
