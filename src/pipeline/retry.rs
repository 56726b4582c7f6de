//! Retry and circuit-breaking decorator
//!
//! Absorbs transient failures with exponential backoff plus jitter, and
//! protects a failing dependency with a closed/open/half-open circuit
//! breaker. The breaker is one shared state machine per decorator
//! composition (per call-site wiring, not per path).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::FetchError;
use crate::pipeline::{RequestDescriptor, SendService};

/// Backoff shape applied between retry attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Self::default()
        }
    }

    /// Exponential backoff with jitter: base * 2^(attempt-1), capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            capped
        } else {
            capped + Duration::from_millis(fastrand::u64(0..=jitter_ms))
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub break_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            break_duration: Duration::from_secs(config.breaker_break_seconds),
        }
    }
}

/// Statuses worth retrying: timeouts, throttling, and server trouble.
/// Validation and other client-level failures are final.
fn is_transient_failure(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    Closed,
    /// Failing fast; no network attempts until the break lapses.
    Open,
    /// One probe call in flight decides the next state.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Admission decision for one attempt.
enum Admission {
    Allow { probe: bool },
    Reject,
}

/// Shared state machine guarding a failing dependency.
///
/// Transitions happen under one mutex so racing callers cannot decide to
/// open or reset the circuit independently. The lock is never held across
/// an await point.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allow { probe: false },
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.break_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!("circuit half-open: admitting one probe");
                    Admission::Allow { probe: true }
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Reject
                } else {
                    inner.probe_in_flight = true;
                    Admission::Allow { probe: true }
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            debug!("circuit closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe || inner.state == CircuitState::HalfOpen {
            // A failed probe re-opens with a fresh timer.
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            warn!("circuit re-opened: probe call failed");
            return;
        }
        inner.consecutive_failures += 1;
        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                "circuit opened after {} consecutive failures",
                inner.consecutive_failures
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }
}

/// Wraps a sender with retry-on-failure and circuit breaking.
pub struct RetryCircuitDecorator<S> {
    inner: S,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl<S> RetryCircuitDecorator<S> {
    pub fn new(inner: S, policy: RetryPolicy, breaker_config: BreakerConfig) -> Self {
        Self {
            inner,
            policy,
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    /// Current breaker state, for observability and tests.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

#[async_trait]
impl<S: SendService> SendService for RetryCircuitDecorator<S> {
    async fn dispatch<T>(
        &self,
        mut request: RequestDescriptor<T>,
        cancel: CancellationToken,
    ) -> RequestDescriptor<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut probe = match self.breaker.admit() {
            Admission::Allow { probe } => probe,
            Admission::Reject => {
                warn!(
                    "request {} to {} rejected: circuit open",
                    request.id, request.path
                );
                request.fail(&FetchError::CircuitOpen);
                return request;
            }
        };

        let budget = request.max_retries;
        let mut attempt: u32 = 0;
        loop {
            request = self.inner.dispatch(request, cancel.clone()).await;
            if request.is_success() {
                self.breaker.record_success();
                return request;
            }
            if !is_transient_failure(request.status_code) {
                // The dependency answered; the failure is the caller's to
                // handle. No retry, no breaker penalty.
                self.breaker.record_success();
                return request;
            }
            self.breaker.record_failure(probe);

            attempt += 1;
            if attempt > budget {
                if budget > 0 {
                    request.fail(&FetchError::RetryExhausted {
                        attempts: budget,
                        last_error: request
                            .errors
                            .last()
                            .cloned()
                            .unwrap_or_else(|| format!("HTTP status {}", request.status_code)),
                    });
                }
                return request;
            }

            let last_error = request
                .errors
                .last()
                .cloned()
                .unwrap_or_else(|| format!("HTTP status {}", request.status_code));
            request.record_error(format!("retry attempt {attempt} after error: {last_error}"));

            let delay = self.policy.backoff_delay(attempt);
            debug!(
                "request {} retrying in {:?} (attempt {attempt}/{budget})",
                request.id, delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    request.record_error("retrying abandoned: caller cancelled".to_string());
                    return request;
                }
            }

            // The circuit may have opened while this call was backing off.
            match self.breaker.admit() {
                Admission::Allow { probe: is_probe } => probe = is_probe,
                Admission::Reject => {
                    request.fail(&FetchError::CircuitOpen);
                    return request;
                }
            }
        }
    }
}
