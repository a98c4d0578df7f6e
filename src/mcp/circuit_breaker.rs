//! Circuit Breaker
//!
//! Isolates a failing MCP server: after `failure_threshold` consecutive
//! failures the circuit opens and calls are rejected immediately with a
//! [`McpError::Connection`] (`error_code = CIRCUIT_OPEN`) until
//! `recovery_timeout` has passed since the last failure. The next call then
//! probes the server in the half-open state; `success_threshold` consecutive
//! successes close the circuit again, a single failure reopens it.
//!
//! ```text
//! Closed --failures >= threshold--> Open --recovery_timeout elapsed--> HalfOpen
//!   ^                                 ^                                   |
//!   |                                 +----------- any failure -----------+
//!   +------------------- successes >= success_threshold ------------------+
//! ```
//!
//! The breaker's lock is never held while the wrapped operation runs, so a
//! breaker can safely wrap calls that take other locks (pools, clients).

use crate::mcp::error::{McpError, CIRCUIT_OPEN};
use crate::mcp::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::{Duration, Instant};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a half-open probe is allowed
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,
    /// Circuit is open - requests are rejected
    Open,
    /// Testing if service has recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

impl CircuitBreakerMetrics {
    pub fn to_json(&self) -> Value {
        json!({
            "state": self.state.as_str(),
            "failure_count": self.failure_count,
            "success_count": self.success_count,
            "total_calls": self.total_calls,
            "last_failure_time": self.last_failure_time.map(|t| t.to_rfc3339()),
            "last_state_change": self.last_state_change.to_rfc3339(),
        })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_calls: u64,
    /// Monotonic time of the last failure (drives recovery)
    last_failure: Option<Instant>,
    /// Wall-clock copy for reporting
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

/// Circuit breaker protecting one call site
///
/// # Example
///
/// ```ignore
/// let breaker = CircuitBreaker::new("github", CircuitBreakerConfig::default());
/// let tools = breaker.call(|| client.list_tools()).await?;
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: std::sync::Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(
            "Circuit breaker '{}' initialized: threshold={}, timeout={:?}",
            name,
            config.failure_threshold,
            config.recovery_timeout
        );

        Self {
            name,
            config,
            inner: std::sync::Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_calls: 0,
                last_failure: None,
                last_failure_at: None,
                last_state_change: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker
    ///
    /// Every `Err` counts as a failure and is returned unchanged. While the
    /// circuit is open the operation is not invoked at all.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<McpError>,
    {
        self.before_call().map_err(E::from)?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Count the call and reject it if the circuit is (still) open
    fn before_call(&self) -> Result<(), McpError> {
        let mut inner = lock(&self.inner);
        inner.total_calls += 1;

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        if inner.last_failure.is_some() && elapsed >= self.config.recovery_timeout {
            self.transition(&mut inner, CircuitState::HalfOpen);
            return Ok(());
        }

        let retry_in = self.config.recovery_timeout.saturating_sub(elapsed);
        Err(McpError::connection(format!(
            "Circuit breaker '{}' is OPEN. Service is currently unavailable. Retry in {:.1}s",
            self.name,
            retry_in.as_secs_f64()
        ))
        .with_code(CIRCUIT_OPEN)
        .with_retry_after(retry_in))
    }

    fn on_success(&self) {
        let mut inner = lock(&self.inner);
        inner.failure_count = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                tracing::debug!(
                    "Circuit breaker '{}': success in HALF_OPEN ({}/{})",
                    self.name,
                    inner.success_count,
                    self.config.success_threshold
                );
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Successes only count towards closing a half-open circuit
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = lock(&self.inner);
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        tracing::warn!(
            "Circuit breaker '{}': failure ({}/{})",
            self.name,
            inner.failure_count,
            self.config.failure_threshold
        );

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            _ => {}
        }
    }

    /// Enter `to`, resetting the consecutive counters
    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let failures = inner.failure_count;
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_state_change = Utc::now();

        match to {
            CircuitState::Open => {
                tracing::error!("Circuit breaker '{}': OPEN (failures: {})", self.name, failures)
            }
            CircuitState::HalfOpen => {
                tracing::info!("Circuit breaker '{}': HALF_OPEN (testing recovery)", self.name)
            }
            CircuitState::Closed => {
                tracing::info!("Circuit breaker '{}': CLOSED (service recovered)", self.name)
            }
        }
    }

    /// Current state (an expired open circuit still reports `Open` until the
    /// next call probes it)
    pub fn state(&self) -> CircuitState {
        lock(&self.inner).state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = lock(&self.inner);
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            last_failure_time: inner.last_failure_at,
            last_state_change: inner.last_state_change,
        }
    }

    /// Force the circuit closed with zeroed counters
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        self.transition(&mut inner, CircuitState::Closed);
        tracing::info!("Circuit breaker '{}': manually reset", self.name);
    }
}
