//! Circuit breaker for a single remote dependency
//!
//! Two states only: Closed and Open. The breaker opens after
//! `failure_threshold` consecutive failures and stays open until
//! `reset_timeout` has passed since the last failure, after which the counter
//! resets and calls flow again. There is no half-open probe.

use std::time::{Duration, Instant};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long the breaker stays open after the last failure
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failure_count: 0,
            last_failure: None,
        }
    }

    /// Observed state at `now`, without side effects
    pub fn state_at(&self, now: Instant) -> CircuitState {
        if self.failure_count < self.config.failure_threshold {
            return CircuitState::Closed;
        }
        match self.last_failure {
            Some(at) if now.saturating_duration_since(at) < self.config.reset_timeout => {
                CircuitState::Open
            }
            _ => CircuitState::Closed,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    /// Whether a call may be attempted at `now`.
    ///
    /// When the cool-down has elapsed the failure counter is reset here.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        if self.failure_count < self.config.failure_threshold {
            return true;
        }
        match self.state_at(now) {
            CircuitState::Open => false,
            CircuitState::Closed => {
                self.failure_count = 0;
                self.last_failure = None;
                true
            }
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now())
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Time left before an open breaker admits calls again
    pub fn remaining_cooldown_at(&self, now: Instant) -> Option<Duration> {
        if self.state_at(now) != CircuitState::Open {
            return None;
        }
        self.last_failure
            .map(|at| self.config.reset_timeout.saturating_sub(now.saturating_duration_since(at)))
    }
}
