//! Retry classification, backoff and circuit breaking.
//!
//! A query may only be resubmitted while nothing of its result has been
//! observed. The executor consults [`RetryPolicy::classify`] for every
//! failure before the first batch and stops retrying as soon as rows have
//! started to flow.

use crate::error::{AuthError, ConnectionError, HyperError, QueryError, TransportError};
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};

/// How a failure may be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; resubmission may succeed
    Retryable,
    /// Deterministic failure of this query
    NonRetryable,
    /// The session can no longer be used
    Fatal,
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total submissions, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]` applied to each delay
    pub jitter: f64,
    /// How many times an authentication rejection may be answered with a
    /// fresh token and an immediate resubmission
    pub auth_refresh_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            auth_refresh_attempts: 1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries transient failures.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the total number of submissions.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Set the relative jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set how many authentication rejections are retried with a fresh token.
    pub fn with_auth_refresh_attempts(mut self, attempts: u32) -> Self {
        self.auth_refresh_attempts = attempts;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        let max = self.max_backoff.as_nanos() as f64;
        let base = base.min(max);

        let delay = if self.jitter > 0.0 && base > 0.0 {
            let spread = base * self.jitter;
            rand::rng().random_range((base - spread)..=(base + spread))
        } else {
            base
        };
        Duration::from_nanos(delay.clamp(0.0, max).round() as u64)
    }

    /// Whether another submission is allowed after `attempt` failed ones.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Classify a failure seen before the first batch.
    ///
    /// `auth_refreshes_used` is the number of times this execution already
    /// answered an authentication rejection with a fresh token.
    pub fn classify(&self, error: &HyperError, auth_refreshes_used: u32) -> ErrorClass {
        let auth_class = if auth_refreshes_used < self.auth_refresh_attempts {
            ErrorClass::Retryable
        } else {
            ErrorClass::NonRetryable
        };

        match error.root() {
            HyperError::Transport(TransportError::Unauthenticated(_))
            | HyperError::Auth(AuthError::Unauthenticated(_)) => auth_class,
            HyperError::Transport(TransportError::ChannelClosed)
            | HyperError::Connection(ConnectionError::SessionClosed)
            | HyperError::Query(QueryError::SessionClosed) => ErrorClass::Fatal,
            HyperError::Transport(e) if is_transient(e) => ErrorClass::Retryable,
            HyperError::Auth(AuthError::ExchangeFailed(_)) => ErrorClass::Retryable,
            _ => ErrorClass::NonRetryable,
        }
    }
}

/// Whether a transport failure is worth repeating as is.
pub fn is_transient(error: &TransportError) -> bool {
    match error {
        TransportError::ConnectionRefused { .. }
        | TransportError::Unavailable(_)
        | TransportError::DeadlineExceeded(_) => true,
        TransportError::Http { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Whether an error is an authentication rejection by the query service.
pub fn is_auth_rejection(error: &HyperError) -> bool {
    matches!(
        error.root(),
        HyperError::Transport(TransportError::Unauthenticated(_))
            | HyperError::Auth(AuthError::Unauthenticated(_))
    )
}

/// Whether an error shows the service answered the request.
///
/// Rejections decided by the service itself, such as SQL errors, count as
/// a working service for the circuit breaker.
pub fn proves_reachable(error: &HyperError) -> bool {
    match error.root() {
        HyperError::Transport(TransportError::Server { .. })
        | HyperError::Transport(TransportError::Unauthenticated(_)) => true,
        HyperError::Transport(TransportError::Http { status, .. }) => *status < 500,
        HyperError::Query(QueryError::ProtocolViolation(_)) => true,
        _ => false,
    }
}

/// How [`CircuitBreaker::check`] admitted a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial. Its outcome must be recorded, or the
    /// trial released, before another submission is admitted.
    Trial,
}

/// Observable state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Rejects submissions for a while after repeated transient failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive failures that open the circuit, zero disables it
    failure_threshold: u32,
    open_duration: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn state(&self) -> CircuitState {
        match *self.state.lock() {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Admit or reject a submission.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::CircuitOpen` while the circuit is open, or
    /// while a half-open trial submission is still running.
    pub fn check(&self) -> Result<Admission, TransportError> {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(Admission::Normal),
            BreakerState::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    *state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(Admission::Trial)
                } else {
                    Err(TransportError::CircuitOpen {
                        retry_after_ms: (until - now).as_millis() as u64,
                    })
                }
            }
            BreakerState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Err(TransportError::CircuitOpen { retry_after_ms: 0 })
                } else {
                    *state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Give up a half-open trial without an outcome.
    ///
    /// The next submission becomes the trial instead.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if let BreakerState::HalfOpen {
            trial_in_flight: true,
        } = *state
        {
            *state = BreakerState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        if self.failure_threshold == 0 {
            return;
        }
        let mut state = self.state.lock();
        let failures = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => consecutive_failures + 1,
            BreakerState::Open { .. } | BreakerState::HalfOpen { .. } => self.failure_threshold,
        };

        *state = if failures >= self.failure_threshold {
            tracing::warn!(failures, "Opening circuit breaker");
            BreakerState::Open {
                until: Instant::now() + self.open_duration,
            }
        } else {
            BreakerState::Closed {
                consecutive_failures: failures,
            }
        };
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}
