//! Retry Policy
//!
//! Bounded re-attempts with multiplicative backoff:
//! the delay before attempt `n + 1` is `delay * backoff^(n - 1)`, optionally
//! capped by `max_delay`. After the last attempt the operation's own error is
//! returned unchanged.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay after the first failure
    pub delay: Duration,
    /// Multiplier applied to the delay after each further failure
    pub backoff: f64,
    /// Upper bound for any single delay
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 1.0,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Constant-delay policy
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff.max(0.0).powi(exponent);
        let secs = self.delay.as_secs_f64() * factor;

        let delay = if secs.is_finite() {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Run an operation, retrying every failure
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_when(operation, |_| true).await
    }

    /// Run an operation, retrying only failures `retryable` accepts
    pub async fn run_when<F, Fut, T, E, P>(&self, operation: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut task = RetryableTask::new(self.clone(), operation).retry_if(retryable);
        task.execute().await
    }
}

type RetryHook<'a, E> = Box<dyn FnMut(&E, u32) + Send + 'a>;

/// Retryable operation with observable attempt state
///
/// ```no_run
/// # use legion_core::retry::{RetryPolicy, RetryableTask};
/// # use std::time::Duration;
/// # async fn demo() {
/// let policy = RetryPolicy::new(3, Duration::from_millis(100)).with_backoff(2.0);
/// let mut task = RetryableTask::new(policy, || async { Ok::<_, std::io::Error>(1) });
/// let value = task.execute().await.unwrap();
/// assert_eq!(task.attempts(), 1);
/// assert!(task.succeeded());
/// # let _ = value;
/// # }
/// ```
pub struct RetryableTask<'a, F, E, P = fn(&E) -> bool> {
    policy: RetryPolicy,
    operation: F,
    retryable: P,
    on_retry: Option<RetryHook<'a, E>>,
    attempts: u32,
    success: bool,
    last_error: Option<String>,
}

impl<'a, F, Fut, T, E> RetryableTask<'a, F, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    pub fn new(policy: RetryPolicy, operation: F) -> Self {
        Self {
            policy,
            operation,
            retryable: always_retry::<E>,
            on_retry: None,
            attempts: 0,
            success: false,
            last_error: None,
        }
    }
}

fn always_retry<E>(_: &E) -> bool {
    true
}

impl<'a, F, Fut, T, E, P> RetryableTask<'a, F, E, P>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    /// Only retry failures the predicate accepts; others fail immediately
    pub fn retry_if<Q>(self, retryable: Q) -> RetryableTask<'a, F, E, Q>
    where
        Q: Fn(&E) -> bool,
    {
        RetryableTask {
            policy: self.policy,
            operation: self.operation,
            retryable,
            on_retry: self.on_retry,
            attempts: self.attempts,
            success: self.success,
            last_error: self.last_error,
        }
    }

    /// Called with the error and the failed attempt number before each retry
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: FnMut(&E, u32) + Send + 'a,
    {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub async fn execute(&mut self) -> Result<T, E> {
        let max_attempts = self.policy.attempts();
        self.success = false;
        self.last_error = None;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.attempts = attempt;

            match (self.operation)().await {
                Ok(value) => {
                    self.success = true;
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}/{}", attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.last_error = Some(e.to_string());

                    if attempt >= max_attempts {
                        warn!("Failed after {} attempts: {}", attempt, e);
                        return Err(e);
                    }
                    if !(self.retryable)(&e) {
                        debug!("Not retrying non-retryable error: {}", e);
                        return Err(e);
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    if let Some(hook) = self.on_retry.as_mut() {
                        hook(&e, attempt);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Attempts made by the last `execute`
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn succeeded(&self) -> bool {
        self.success
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
