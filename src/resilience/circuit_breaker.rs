//! Per-target circuit breakers.
//!
//! Each named downstream gets its own [`CircuitBreaker`] with its own mutex.
//! CLOSED lets calls through and opens after `failure_threshold` consecutive
//! failures. OPEN rejects calls without running them until `recovery_timeout`
//! has elapsed; the first call after that moves the breaker to HALF_OPEN and is
//! let through. HALF_OPEN closes after `success_threshold` consecutive successes
//! and reopens on any failure. Every call is bounded by `call_timeout` (or the
//! caller's own bound via `call_with_timeout`), and a timeout counts as a
//! failure.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

/// Transitions kept per breaker.
const TRANSITION_HISTORY: usize = 50;

/// Transitions included in a metrics snapshot.
const RECENT_TRANSITIONS: usize = 10;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial call is allowed.
    #[serde(with = "crate::config::duration_secs")]
    pub recovery_timeout: Duration,
    /// Consecutive HALF_OPEN successes before closing.
    pub success_threshold: u32,
    /// Upper bound for a single call.
    #[serde(with = "crate::config::duration_secs")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            success_threshold,
            ..Default::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
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

    /// Numeric code published on the state gauge.
    pub fn code(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a call that did not produce a value.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker is open; the wrapped function was not invoked.
    #[error("Circuit breaker '{name}' is open")]
    Rejected { name: String },

    /// The call exceeded its timeout.
    #[error("Call through circuit breaker '{name}' timed out after {timeout:?}")]
    TimedOut { name: String, timeout: Duration },

    /// The wrapped function failed.
    #[error("{0}")]
    Failed(E),
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub time_in_current_state_secs: f64,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub success_rate_percent: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub config: CircuitBreakerConfig,
    pub recent_transitions: Vec<StateTransition>,
}

/// Aggregate view over every breaker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerSummary {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
    pub closed: usize,
    pub names: Vec<String>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    changed_at: Instant,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    transitions: VecDeque<StateTransition>,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    metrics: MetricsCollector,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                changed_at: Instant::now(),
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
                last_success: None,
                transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            }),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Whether a call made now would be admitted. Does not change state.
    pub fn allows_request(&self) -> bool {
        let state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => state.changed_at.elapsed() >= self.config.recovery_timeout,
        }
    }

    /// Runs `f` through the breaker.
    ///
    /// `f` is not invoked when the breaker rejects the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with_timeout(self.config.call_timeout, f).await
    }

    /// Like [`call`](Self::call), bounded by `timeout` instead of the
    /// configured `call_timeout`.
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        timeout: Duration,
        f: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            return Err(CallError::Rejected {
                name: self.name.clone(),
            });
        }

        let started = Instant::now();
        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure("error", started.elapsed());
                Err(CallError::Failed(e))
            }
            Err(_) => {
                self.record_failure("timeout", started.elapsed());
                Err(CallError::TimedOut {
                    name: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Decides whether to let a call through, moving OPEN to HALF_OPEN once
    /// the recovery timeout has elapsed.
    fn admit(&self) -> bool {
        let mut state = self.state.lock();
        state.total_requests += 1;
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if state.changed_at.elapsed() >= self.config.recovery_timeout {
                    state.consecutive_successes = 0;
                    self.transition(&mut state, CircuitState::HalfOpen);
                    info!(breaker = %self.name, "Circuit breaker half-open, testing recovery");
                    true
                } else {
                    state.total_rejections += 1;
                    false
                }
            }
        }
    }

    fn record_success(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        state.total_successes += 1;
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        state.last_success = Some(Utc::now());

        if state.state == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut state, CircuitState::Closed);
            info!(breaker = %self.name, "Circuit breaker closed, service recovered");
        }

        debug!(
            breaker = %self.name,
            elapsed_ms = elapsed.as_millis() as u64,
            consecutive = state.consecutive_successes,
            "Circuit breaker recorded success"
        );
    }

    fn record_failure(&self, cause: &str, elapsed: Duration) {
        let mut state = self.state.lock();
        state.total_failures += 1;
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        state.last_failure = Some(Utc::now());

        match state.state {
            CircuitState::Closed
                if state.consecutive_failures >= self.config.failure_threshold =>
            {
                self.transition(&mut state, CircuitState::Open);
                error!(
                    breaker = %self.name,
                    consecutive_failures = state.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open);
                warn!(breaker = %self.name, "Circuit breaker reopened after failed trial call");
            }
            _ => {}
        }

        warn!(
            breaker = %self.name,
            cause = cause,
            elapsed_ms = elapsed.as_millis() as u64,
            consecutive = state.consecutive_failures,
            "Circuit breaker recorded failure"
        );
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.changed_at = Instant::now();
        if to == CircuitState::Closed {
            state.consecutive_failures = 0;
        }

        if state.transitions.len() == TRANSITION_HISTORY {
            state.transitions.pop_front();
        }
        state.transitions.push_back(StateTransition {
            from_state: from,
            to_state: to,
            timestamp: Utc::now(),
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
        });

        self.metrics
            .record_breaker_transition(&self.name, to.as_str(), to.code());
    }

    /// Forces the breaker CLOSED and clears its consecutive counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let state = self.state.lock();
        let decided = state.total_successes + state.total_failures;
        let success_rate_percent = if state.total_requests > 0 {
            state.total_successes as f64 / state.total_requests as f64 * 100.0
        } else {
            0.0
        };
        debug_assert!(decided <= state.total_requests);

        BreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            time_in_current_state_secs: state.changed_at.elapsed().as_secs_f64(),
            total_requests: state.total_requests,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            success_rate_percent,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_failure: state.last_failure,
            last_success: state.last_success,
            config: self.config.clone(),
            recent_transitions: state
                .transitions
                .iter()
                .rev()
                .take(RECENT_TRANSITIONS)
                .rev()
                .cloned()
                .collect(),
        }
    }

    /// Full transition history, oldest first.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.state.lock().transitions.iter().cloned().collect()
    }
}

/// Registry of named breakers, created on first use.
pub struct CircuitBreakerManager {
    default_config: CircuitBreakerConfig,
    configs: RwLock<HashMap<String, CircuitBreakerConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: MetricsCollector,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig, metrics: MetricsCollector) -> Self {
        Self {
            default_config,
            configs: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Registers a dedicated configuration for `name` and (re)creates its breaker.
    pub fn configure(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(
            name.clone(),
            config.clone(),
            self.metrics.clone(),
        ));
        self.configs.write().insert(name.clone(), config);
        self.breakers.write().insert(name.clone(), breaker);
        info!(breaker = %name, "Configured circuit breaker");
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .configs
                .read()
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.default_config.clone());
            info!(breaker = %name, "Created circuit breaker");
            Arc::new(CircuitBreaker::new(name, config, self.metrics.clone()))
        }))
    }

    /// Runs `f` through the breaker named `name`.
    pub async fn call<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(name);
        breaker.call(f).await
    }

    /// Runs `f` through the breaker named `name`, bounded by `timeout`.
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        name: &str,
        timeout: Duration,
        f: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(name);
        breaker.call_with_timeout(timeout, f).await
    }

    /// Whether a call to `name` would be admitted now. Unknown names are admitted.
    pub fn allows_request(&self, name: &str) -> bool {
        self.get(name).map_or(true, |b| b.allows_request())
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.get(name).map(|b| b.state())
    }

    pub fn all_metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.metrics()))
            .collect()
    }

    pub fn summary(&self) -> BreakerSummary {
        let breakers = self.breakers.read();
        let mut summary = BreakerSummary {
            total: breakers.len(),
            ..Default::default()
        };
        for (name, breaker) in breakers.iter() {
            match breaker.state() {
                CircuitState::Open => summary.open += 1,
                CircuitState::HalfOpen => summary.half_open += 1,
                CircuitState::Closed => summary.closed += 1,
            }
            summary.names.push(name.clone());
        }
        summary.names.sort();
        summary
    }

    /// Resets one breaker. Returns false if no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
        info!("Reset all circuit breakers");
    }
}
