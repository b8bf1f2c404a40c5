use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Why a guarded call did not return the callee's success value.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open, call rejected")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Per-endpoint circuit breaker guarding asks into the coordinator.
/// Closed until `max_failures` consecutive failures, then open for
/// `reset_timeout`; a half-open probe call closes it again on success.
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().await;
        self.roll_over(&mut inner);
        inner.state
    }

    /// Run `f` under the breaker. The call is rejected without running when
    /// the circuit is open; its error is passed through otherwise.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            self.roll_over(&mut inner);
            if inner.state == BreakerState::Open {
                return Err(BreakerError::Open);
            }
        }

        match f().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(BreakerError::Inner(e))
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
            }
            _ => inner.failures = 0,
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures += 1;
        if inner.state == BreakerState::HalfOpen || inner.failures >= self.max_failures {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn roll_over(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                }
            }
        }
    }
}
