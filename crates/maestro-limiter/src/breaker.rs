//! Per-template circuit breakers.
//!
//! One breaker guards each template family. Consecutive expected failures
//! open the circuit; after the recovery window a single probe is admitted,
//! and its outcome decides between closing again and re-opening.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive expected failures before opening.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Position of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// One probe call is in flight.
    HalfOpen,
}

/// Errors surfaced by breaker checks.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    /// The circuit is open; the call was not attempted.
    #[error("circuit open for template {0}")]
    CircuitOpen(String),
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probing: bool,
}

/// Failure-window breaker for one template family.
pub struct CircuitBreaker {
    template_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `template_id`.
    pub fn new(template_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            template_id: template_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                probing: false,
            }),
        }
    }

    /// Check whether a call may proceed.
    ///
    /// In `Open`, transitions to `HalfOpen` once the recovery window has
    /// elapsed and admits exactly one probe; everything else is rejected
    /// with [`BreakerError::CircuitOpen`].
    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    info!(template_id = %self.template_id, "circuit half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.probing = true;
                    Ok(())
                } else {
                    Err(BreakerError::CircuitOpen(self.template_id.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probing {
                    Err(BreakerError::CircuitOpen(self.template_id.clone()))
                } else {
                    inner.probing = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call; closes the circuit and clears the count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Closed {
            info!(template_id = %self.template_id, "circuit closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.probing = false;
        inner.last_failure = None;
    }

    /// Record a failed call.
    ///
    /// Only failures of the expected class count toward the threshold;
    /// unexpected failures pass through without moving the window, except
    /// that any failed probe re-opens the circuit.
    pub fn record_failure(&self, expected: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(template_id = %self.template_id, "probe failed, re-opening circuit");
                inner.state = BreakerState::Open;
                inner.last_failure = Some(Instant::now());
                inner.probing = false;
            }
            BreakerState::Closed if expected => {
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        template_id = %self.template_id,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                    inner.state = BreakerState::Open;
                }
            }
            _ => {}
        }
    }

    /// Current breaker state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failure_count
    }
}

/// One breaker per template id, created lazily.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create a registry with shared tuning for all breakers.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `template_id`, created closed on first use.
    pub fn breaker(&self, template_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(template_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(template_id, self.config.clone()))
            })
            .clone()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "python_backend",
            BreakerConfig {
                failure_threshold: 5,
                recovery_timeout: recovery,
            },
        )
    }

    #[test]
    fn opens_after_threshold_expected_failures() {
        let b = breaker(Duration::from_secs(60));
        for _ in 0..4 {
            b.try_acquire().unwrap();
            b.record_failure(true);
        }
        assert_eq!(b.state(), BreakerState::Closed);

        b.try_acquire().unwrap();
        b.record_failure(true);
        assert_eq!(b.state(), BreakerState::Open);

        // Sixth call is short-circuited without invoking the worker.
        assert!(matches!(b.try_acquire(), Err(BreakerError::CircuitOpen(_))));
    }

    #[test]
    fn unexpected_failures_do_not_count() {
        let b = breaker(Duration::from_secs(60));
        for _ in 0..20 {
            b.try_acquire().unwrap();
            b.record_failure(false);
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test]
    async fn recovery_admits_exactly_one_probe() {
        let b = breaker(Duration::from_millis(20));
        for _ in 0..5 {
            b.record_failure(true);
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // One probe admitted, the next caller still sees an open circuit.
        b.try_acquire().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(matches!(b.try_acquire(), Err(BreakerError::CircuitOpen(_))));

        // A successful probe closes and resets the window.
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
        b.try_acquire().unwrap();
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let b = breaker(Duration::from_millis(20));
        for _ in 0..5 {
            b.record_failure(true);
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        b.try_acquire().unwrap();
        b.record_failure(true);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.try_acquire(), Err(BreakerError::CircuitOpen(_))));
    }

    #[test]
    fn registry_hands_out_one_breaker_per_template() {
        let registry = BreakerRegistry::default();
        let a = registry.breaker("python_backend");
        let b = registry.breaker("python_backend");
        let c = registry.breaker("qa_engineer");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
