//! Circuit breaker guarding calls to a failing dependency.
//!
//! ```text
//! Closed   → Open:     failures in window >= threshold
//! Open     → HalfOpen: first can_execute() after reset_timeout
//! HalfOpen → Closed:   probe succeeded
//! HalfOpen → Open:     probe failed (timeout restarts)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Dependency assumed down, calls are rejected
    Open,
    /// A single probe call decides between Closed and Open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted
    pub failure_window: Duration,
    /// How long the circuit stays open before allowing a probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Bounded history of recent failure instants.
///
/// Entries older than the window are evicted lazily whenever the window is
/// read or appended to.
#[derive(Debug, Clone)]
pub struct FailureWindow {
    failures: VecDeque<Instant>,
    window: Duration,
    capacity: usize,
}

impl FailureWindow {
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            failures: VecDeque::with_capacity(capacity),
            window,
            capacity,
        }
    }

    /// Record a failure and return the in-window count
    pub fn record(&mut self, at: Instant) -> usize {
        self.evict(at);
        if self.failures.len() == self.capacity {
            self.failures.pop_front();
        }
        self.failures.push_back(at);
        self.failures.len()
    }

    /// Number of failures still inside the window
    pub fn count(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.failures.len()
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: Option<CircuitState>,
    pub failures_in_window: usize,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
    pub last_error: Option<String>,
}

/// Three-state failure gate. Never errors; callers decide whether to retry
/// based on [`CircuitBreaker::can_execute`].
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    window: FailureWindow,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
    last_error: Option<String>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            window: FailureWindow::new(config.failure_window, config.failure_threshold as usize),
            config,
            state: CircuitState::Closed,
            opened_at: None,
            probe_in_flight: false,
            total_failures: 0,
            total_successes: 0,
            times_opened: 0,
            last_error: None,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without triggering any time-based transition
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Whether a call may proceed.
    ///
    /// Moves Open → HalfOpen once the reset timeout has elapsed and admits
    /// exactly one probe until its outcome is recorded.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.remaining_open_time().is_zero() {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    info!("Circuit breaker half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Time left before an open circuit admits a probe (zero when not open)
    pub fn remaining_open_time(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.reset_timeout.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        self.total_successes += 1;
        self.probe_in_flight = false;

        if self.state == CircuitState::HalfOpen {
            info!("Circuit breaker closed after successful probe");
            self.state = CircuitState::Closed;
            self.opened_at = None;
            self.window.clear();
        }
    }

    pub fn record_failure(&mut self, error: impl fmt::Display) {
        let now = Instant::now();
        let message = error.to_string();
        self.total_failures += 1;
        self.probe_in_flight = false;

        match self.state {
            CircuitState::HalfOpen => {
                warn!("Circuit breaker probe failed: {}", message);
                self.window.record(now);
                self.trip(now);
            }
            CircuitState::Closed => {
                let count = self.window.record(now);
                debug!(
                    "Circuit breaker failure {}/{}: {}",
                    count, self.config.failure_threshold, message
                );
                if count >= self.config.failure_threshold as usize {
                    self.trip(now);
                }
            }
            CircuitState::Open => {
                self.window.record(now);
            }
        }

        self.last_error = Some(message);
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn stats(&mut self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: Some(self.state),
            failures_in_window: self.window.count(Instant::now()),
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            times_opened: self.times_opened,
            last_error: self.last_error.clone(),
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.times_opened += 1;
        warn!(
            "Circuit breaker opened, rejecting calls for {:?}",
            self.config.reset_timeout
        );
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
