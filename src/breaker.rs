//! Circuit breaker (component D): wraps the gateway transport with
//! Closed/Open/Half-Open fast-fail logic.

use crate::error::{BridgeError, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunable thresholds for [`CircuitBreaker`].
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub open_timeout: Duration,
    pub half_open_max_tries: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max_tries: 3,
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_attempts: u32,
    half_open_successes: u32,
}

/// A fast-fail wrapper around a fallible async operation (the gateway
/// transport).
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_attempts: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Whether a call would currently be admitted, without mutating state.
    pub async fn is_closed(&self) -> bool {
        matches!(self.inner.read().await.state, BreakerState::Closed)
    }

    /// Runs `call` if the breaker admits it; fails fast with
    /// [`BridgeError::CircuitOpen`] otherwise.
    pub async fn call<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit().await? {
            return Err(BridgeError::CircuitOpen {
                reason: "max failures exceeded, waiting for open_timeout".into(),
            });
        }

        match call().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(err)
            }
        }
    }

    /// Decides whether to admit the next call, transitioning Open →
    /// Half-Open if the timeout has elapsed. Returns `Ok(false)` when the
    /// call should fail fast.
    async fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => Ok(true),
            BreakerState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_timeout {
                    debug!("circuit breaker: Open timeout elapsed, entering Half-Open");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_attempts = 1;
                    inner.half_open_successes = 0;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_max_tries {
                    inner.half_open_attempts += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_tries {
                    debug!("circuit breaker: Half-Open probes succeeded, closing");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_attempts = 0;
                    inner.half_open_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.max_failures {
                    warn!(failures = inner.failure_count, "circuit breaker: opening");
                    inner.state = BreakerState::Open;
                    inner.last_failure = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!("circuit breaker: probe failed, returning to Open");
                inner.state = BreakerState::Open;
                inner.last_failure = Some(Instant::now());
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
            }
            BreakerState::Open => {
                inner.last_failure = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            max_failures: 3,
            open_timeout: Duration::from_millis(50),
            half_open_max_tries: 2,
        })
    }

    async fn fail() -> Result<()> {
        Err(BridgeError::ResponseTimeout { slave: 1, function: 3 })
    }
    async fn succeed() -> Result<()> {
        Ok(())
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        assert!(!breaker.is_closed().await);
        let result = breaker.call(succeed).await;
        assert!(matches!(result, Err(BridgeError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_recovers_to_closed() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.call(succeed).await.is_ok());
        assert!(breaker.call(succeed).await.is_ok());
        assert!(breaker.is_closed().await);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = breaker.call(fail).await;
        assert!(!breaker.is_closed().await);
    }
}
