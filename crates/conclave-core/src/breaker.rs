//! Circuit breaker for repeatedly failing operations.
//!
//! Guards the retry-request path so a peer that can never be satisfied does
//! not consume pre-keys and bandwidth forever. Standard three-state design:
//!
//! ```text
//! ┌────────┐ failures >= threshold ┌──────┐ open timeout ┌───────────┐
//! │ CLOSED │──────────────────────>│ OPEN │─────────────>│ HALF_OPEN │
//! └────────┘   (within window)     └──────┘ (on next     └───────────┘
//!      ^                               ^     can_execute)   │      │
//!      │         successes >= success_threshold             │      │
//!      └────────────────────────────────────────────────────┘      │
//!                                      ^        any failure        │
//!                                      └───────────────────────────┘
//! ```
//!
//! Failures are timestamps in a rolling window; old ones age out rather
//! than decaying a counter. An optional classifier decides which errors
//! count, so expected conditions (a peer with no session yet) do not trip
//! the breaker.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::env::Environment;

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Rolling window failures are counted over.
    pub failure_window: Duration,
    /// Time the breaker stays open before probing again.
    pub open_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Operations flow normally; failures are being counted.
    Closed,
    /// Operations are refused until the open timeout elapses.
    Open,
    /// Probing: operations flow, the next outcome decides the state.
    HalfOpen,
}

/// Snapshot of breaker internals, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStats {
    /// Current state.
    pub state: BreakerState,
    /// Failures currently inside the rolling window.
    pub recent_failures: usize,
    /// Successes recorded since entering half-open.
    pub half_open_successes: u32,
}

struct Inner<I> {
    state: BreakerState,
    failures: VecDeque<I>,
    opened_at: Option<I>,
    half_open_successes: u32,
}

/// Rolling-window circuit breaker.
///
/// `Err` is the error type of the guarded operation; the optional
/// classifier receives a reference and returns whether the error counts as
/// a breaker failure. Without a classifier every error counts.
///
/// # Panics
///
/// Methods panic if the internal mutex is poisoned.
pub struct CircuitBreaker<E: Environment, Err> {
    env: E,
    config: BreakerConfig,
    classify: Option<Box<dyn Fn(&Err) -> bool + Send + Sync>>,
    inner: Mutex<Inner<E::Instant>>,
}

impl<E: Environment, Err> CircuitBreaker<E, Err> {
    /// Breaker counting every error as a failure.
    pub fn new(env: E, config: BreakerConfig) -> Self {
        Self {
            env,
            config,
            classify: None,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    /// Breaker counting only errors the classifier accepts.
    pub fn with_classifier(
        env: E,
        config: BreakerConfig,
        classify: impl Fn(&Err) -> bool + Send + Sync + 'static,
    ) -> Self {
        let mut breaker = Self::new(env, config);
        breaker.classify = Some(Box::new(classify));
        breaker
    }

    /// Whether the guarded operation may run now.
    ///
    /// The first call at or past the open timeout moves the breaker to
    /// half-open and admits the probe.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().expect("CircuitBreaker mutex poisoned");

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| self.env.now() - at);
                if elapsed.is_some_and(|e| e >= self.config.open_timeout) {
                    tracing::debug!("circuit breaker half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("CircuitBreaker mutex poisoned");

        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                tracing::debug!(
                    successes = inner.half_open_successes,
                    "circuit breaker closed after successful probes"
                );
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.half_open_successes = 0;
            }
        }
    }

    /// Record a failed operation.
    ///
    /// Errors the classifier rejects are ignored entirely. A counted
    /// failure reopens a half-open breaker immediately; in closed state it
    /// joins the rolling window and may trip the threshold.
    pub fn record_failure(&self, error: &Err) {
        if let Some(classify) = &self.classify
            && !classify(error)
        {
            return;
        }

        let now = self.env.now();
        let mut inner = self.inner.lock().expect("CircuitBreaker mutex poisoned");

        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!("circuit breaker reopened: probe failed");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            },
            BreakerState::Closed => {
                inner.failures.push_back(now);
                let window = self.config.failure_window;
                while inner.failures.front().is_some_and(|&t| now - t >= window) {
                    inner.failures.pop_front();
                }

                if inner.failures.len() >= self.config.failure_threshold as usize {
                    tracing::warn!(
                        failures = inner.failures.len(),
                        "circuit breaker opened: failure threshold reached"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            },
            // The gate refused execution, so failures arriving here are
            // stragglers from before the trip; nothing to count.
            BreakerState::Open => {},
        }
    }

    /// Current state without side effects.
    ///
    /// An open breaker past its timeout still reports `Open` here; the
    /// half-open transition only happens on [`can_execute`](Self::can_execute).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("CircuitBreaker mutex poisoned").state
    }

    /// Snapshot for logs and tests.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().expect("CircuitBreaker mutex poisoned");
        BreakerStats {
            state: inner.state,
            recent_failures: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
        }
    }

    /// Force the breaker back to closed with a clean history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("CircuitBreaker mutex poisoned");
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.half_open_successes = 0;
    }
}
