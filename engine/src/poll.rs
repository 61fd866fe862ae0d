//! Bounded retry with backoff
//!
//! Every "wait until ready" loop in the engine (queue binding, stage-flow polling,
//! rollout verification) goes through [`poll_until`].

use std::future::Future;
use std::time::Duration;

use tracing::trace;

use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Delay between two checks
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential(CooldownOptions),
}

/// How often and how long to check
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl PollPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(interval),
        }
    }

    pub fn exponential(max_attempts: u32, cooldown: CooldownOptions) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential(cooldown),
        }
    }

    /// Delay to wait after the given (zero based) attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(interval) => *interval,
            Backoff::Exponential(cooldown) => calc_exp_backoff(cooldown, attempt),
        }
    }
}

/// Outcome of one check
#[derive(Debug)]
pub enum Check<T, P> {
    /// Condition met
    Ready(T),
    /// Not there yet, keep the observation for diagnostics
    Pending(P),
    /// Stop polling right away
    Fail(P),
}

/// Why polling stopped without a result
#[derive(Debug, PartialEq)]
pub enum PollError<P> {
    Timeout { attempts: u32, last: Option<P> },
    Failed(P),
}

impl<P> PollError<P> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

/// Check until ready, failed, or out of attempts, sleeping with tokio between checks
pub async fn poll_until<T, P, F, Fut>(policy: &PollPolicy, check: F) -> Result<T, PollError<P>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Check<T, P>>,
{
    poll_with_sleep(policy, check, tokio::time::sleep).await
}

/// Same as [`poll_until`] with an injected sleep function
pub async fn poll_with_sleep<T, P, F, Fut, S, SF>(
    policy: &PollPolicy,
    mut check: F,
    sleep_fn: S,
) -> Result<T, PollError<P>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Check<T, P>>,
    S: Fn(Duration) -> SF,
    SF: Future<Output = ()>,
{
    let mut last = None;
    for attempt in 0..policy.max_attempts {
        match check(attempt).await {
            Check::Ready(value) => return Ok(value),
            Check::Fail(observed) => return Err(PollError::Failed(observed)),
            Check::Pending(observed) => last = Some(observed),
        }

        if attempt + 1 < policy.max_attempts {
            let delay = policy.delay(attempt);
            trace!("poll attempt {} pending, sleeping {:?}", attempt + 1, delay);
            sleep_fn(delay).await;
        }
    }

    Err(PollError::Timeout {
        attempts: policy.max_attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn no_sleep(_: Duration) {}

    #[tokio::test]
    async fn test_ready_after_pending() {
        let policy = PollPolicy::fixed(5, Duration::from_millis(10));
        let result: Result<u32, PollError<&str>> = poll_with_sleep(
            &policy,
            |attempt| async move {
                if attempt < 2 {
                    Check::Pending("waiting")
                } else {
                    Check::Ready(attempt)
                }
            },
            no_sleep,
        )
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_timeout_keeps_last_observation() {
        let policy = PollPolicy::fixed(3, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), PollError<u32>> = poll_with_sleep(
            &policy,
            move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Check::Pending(attempt) }
            },
            no_sleep,
        )
        .await;
        assert_eq!(
            result,
            Err(PollError::Timeout {
                attempts: 3,
                last: Some(2)
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fail_stops_immediately() {
        let policy = PollPolicy::fixed(10, Duration::from_millis(10));
        let result: Result<(), PollError<&str>> =
            poll_with_sleep(&policy, |_| async { Check::Fail("mismatch") }, no_sleep).await;
        assert_eq!(result, Err(PollError::Failed("mismatch")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_with_tokio_sleep() {
        let policy = PollPolicy::fixed(4, Duration::from_secs(6));
        let started = tokio::time::Instant::now();
        let result: Result<(), PollError<()>> =
            poll_until(&policy, |_| async { Check::Pending(()) }).await;
        assert!(result.unwrap_err().is_timeout());
        // three sleeps between four checks
        assert_eq!(started.elapsed(), Duration::from_secs(18));
    }

    #[test]
    fn test_exponential_delay() {
        let policy = PollPolicy::exponential(5, CooldownOptions::default());
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
    }
}
