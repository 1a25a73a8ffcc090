//! Circuit Breaker
//!
//! Fails fast once an operation is judged unhealthy:
//! - CLOSED: calls pass through, consecutive failures counted
//! - OPEN: calls rejected without running the operation
//! - HALF_OPEN: after the timeout a single trial call decides recovery
//!
//! Wrapping is explicit: `breaker.call(|| client.fetch()).await`.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening. Zero behaves like one.
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a trial call
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Error returned by a wrapped call
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The operation was not attempted
    #[error("Circuit breaker '{name}' is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The wrapped operation's own error, if it was attempted
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    trial_in_flight: bool,
    rejected_calls: u64,
}

/// Circuit breaker for preventing cascade failures
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        debug!(
            "Circuit breaker '{}' initialized: threshold={}, timeout={:?}",
            name, config.failure_threshold, config.timeout
        );
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure: None,
                last_state_change: Instant::now(),
                trial_in_flight: false,
                rejected_calls: 0,
            }),
        }
    }

    pub fn with_threshold(name: &str, failure_threshold: u32, timeout: Duration) -> Self {
        Self::new(
            name,
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. Reading never transitions; OPEN only moves to
    /// HALF_OPEN when a call arrives after the timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run an async operation under the breaker
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire::<E>()?;
        match operation().await {
            Ok(value) => {
                permit.record(true);
                Ok(value)
            }
            Err(e) => {
                permit.record(false);
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Run a blocking operation under the breaker
    pub fn call_sync<F, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.acquire::<E>()?;
        match operation() {
            Ok(value) => {
                permit.record(true);
                Ok(value)
            }
            Err(e) => {
                permit.record(false);
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Force the breaker back to CLOSED
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        info!("Circuit breaker '{}' reset", self.name);
    }

    /// Get stats
    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.threshold(),
            rejected_calls: inner.rejected_calls,
            time_in_state: inner.last_state_change.elapsed(),
            last_failure: inner.last_failure.map(|f| f.elapsed()),
        }
    }

    fn threshold(&self) -> u32 {
        self.config.failure_threshold.max(1)
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, CircuitError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(self.config.timeout);
                if elapsed >= self.config.timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                } else {
                    inner.rejected_calls += 1;
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_after: self.config.timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected_calls += 1;
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    // A previous trial was abandoned
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                self.transition(&mut inner, CircuitState::Closed);
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!("Circuit breaker '{}' closed after recovery", self.name);
            }
            // Late results of calls admitted before the breaker opened
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);
        inner.failure_count = inner.failure_count.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.threshold() {
                    self.transition(&mut inner, CircuitState::Open);
                    inner.opened_at = Some(now);
                    warn!(
                        "Circuit breaker '{}' opened after {} failures",
                        self.name, inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                self.transition(&mut inner, CircuitState::Open);
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                warn!("Circuit breaker '{}' reopened after half-open failure", self.name);
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            debug!("Circuit breaker '{}' trial abandoned", self.name);
        }
    }

    fn transition(&self, inner: &mut BreakerState, state: CircuitState) {
        if inner.state != state {
            debug!("Circuit breaker '{}': {:?} -> {:?}", self.name, inner.state, state);
            inner.state = state;
            inner.last_state_change = Instant::now();
        }
    }
}

/// Admission for one call; reports the outcome back to the breaker
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    fn record(mut self, succeeded: bool) {
        self.resolved = true;
        if succeeded {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.release_trial();
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub rejected_calls: u64,
    pub time_in_state: Duration,
    pub last_failure: Option<Duration>,
}
