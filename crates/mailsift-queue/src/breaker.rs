//! Publish retry policy, reconnect backoff and circuit breaker for the
//! broker backend

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{QueueError, QueueResult};

/// Fixed-delay bounded retry
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, attempts run out, or `cancel` fires
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Publish attempt failed, retrying"
                    );
                }
            }
            attempt += 1;

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }
}

/// Doubling delay between reconnect attempts, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_after,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BreakerState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Whether a publish may be attempted now.
    ///
    /// Once the reset period has elapsed an open breaker lets a probe
    /// through; its outcome closes or re-opens the circuit.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        self.with_state(|state| match state.opened_at {
            None => true,
            Some(opened) if now.duration_since(opened) >= self.reset_after => {
                state.opened_at = Some(now);
                true
            }
            Some(_) => false,
        })
    }

    pub fn record_success(&self) {
        self.with_state(|state| {
            state.failure_count = 0;
            state.opened_at = None;
        });
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        self.with_state(|state| {
            state.failure_count += 1;
            if state.failure_count >= self.threshold {
                if state.opened_at.is_none() {
                    warn!(
                        failures = state.failure_count,
                        "Circuit breaker opened for broker publishing"
                    );
                }
                state.opened_at = Some(now);
            }
        });
    }

    pub fn is_open(&self) -> bool {
        self.with_state(|state| state.opened_at.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_half_open_probe_after_reset() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let start = Instant::now();
        breaker.record_failure_at(start);
        assert!(!breaker.allow_at(start + Duration::from_secs(10)));

        // One probe is let through, the next caller waits again.
        assert!(breaker.allow_at(start + Duration::from_secs(31)));
        assert!(!breaker.allow_at(start + Duration::from_secs(32)));

        breaker.record_success();
        assert!(breaker.allow_at(start + Duration::from_secs(33)));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: QueueResult<()> = policy
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::Broker("unreachable".to_string()))
            })
            .await;

        assert!(matches!(result, Err(QueueError::Broker(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_midway() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        let calls = AtomicU32::new(0);

        let result = policy
            .run(&CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueueError::Broker("flaky".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_cancel() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: QueueResult<()> = policy
            .run(&cancel, || async { Err(QueueError::Broker("down".to_string())) })
            .await;
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }
}
