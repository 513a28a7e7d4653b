//! Graceful degradation for unhealthy downstream services.
//!
//! The [`FallbackManager`] keeps a [`ServiceHealth`] record per service and a
//! global [`ServiceLevel`]. A call made through
//! [`FallbackManager::execute_with_fallback`] either goes straight to the
//! service's registered fallback strategy or runs the primary path through the
//! service's circuit breaker, falling back when it fails.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CallError, CircuitBreakerManager};
use crate::error::TaskError;
use crate::metrics::MetricsCollector;

/// Executions kept per service for [`FallbackManager::fallback_metrics`].
const EXECUTION_HISTORY: usize = 100;

/// Degradation events kept for the health summary.
const DEGRADATION_HISTORY: usize = 100;

/// Requests used for the sliding error-rate window.
const HEALTH_WINDOW: usize = 20;

/// External-service errors remembered per service.
const EXTERNAL_ERROR_HISTORY: usize = 10;

/// External-service errors older than this no longer trigger a fallback.
const EXTERNAL_ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Global degradation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    Full,
    Degraded,
    Minimal,
    Emergency,
}

impl ServiceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceLevel::Full => "full",
            ServiceLevel::Degraded => "degraded",
            ServiceLevel::Minimal => "minimal",
            ServiceLevel::Emergency => "emergency",
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ServiceLevel::Full => 0,
            ServiceLevel::Degraded => 1,
            ServiceLevel::Minimal => 2,
            ServiceLevel::Emergency => 3,
        }
    }
}

impl std::fmt::Display for ServiceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to return when the primary path cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Serve the last good value while it is younger than the cache TTL.
    CachedResponse,
    /// Shrink collections in the fallback data by a factor.
    ReducedQuality,
    /// Return a static placeholder.
    MockResponse,
    /// Fail immediately with an informative message.
    FailFast,
    /// Wait, then try the primary path once more.
    RetryWithDelay,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::CachedResponse => "cached_response",
            FallbackStrategy::ReducedQuality => "reduced_quality",
            FallbackStrategy::MockResponse => "mock_response",
            FallbackStrategy::FailFast => "fail_fast",
            FallbackStrategy::RetryWithDelay => "retry_with_delay",
        }
    }
}

/// Per-service fallback configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub strategy: FallbackStrategy,
    #[serde(default = "default_cache_ttl", with = "crate::config::duration_secs")]
    pub cache_ttl: Duration,
    #[serde(default = "default_retry_delay", with = "crate::config::duration_secs")]
    pub retry_delay: Duration,
    #[serde(default = "default_quality_factor")]
    pub quality_reduction_factor: f64,
    #[serde(default)]
    pub mock_response_template: Option<Value>,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_quality_factor() -> f64 {
    0.5
}

impl FallbackConfig {
    pub fn new(strategy: FallbackStrategy) -> Self {
        Self {
            strategy,
            cache_ttl: default_cache_ttl(),
            retry_delay: default_retry_delay(),
            quality_reduction_factor: default_quality_factor(),
            mock_response_template: None,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_quality_factor(mut self, factor: f64) -> Self {
        self.quality_reduction_factor = factor;
        self
    }

    pub fn with_mock_template(mut self, template: Value) -> Self {
        self.mock_response_template = Some(template);
        self
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct FallbackManagerConfig {
    /// Interval between service-level reassessments.
    pub health_check_interval: Duration,
    /// Health triggers only apply to samples younger than this.
    pub health_sample_ttl: Duration,
    /// Smoothed response time above which a service is considered too slow.
    pub slow_response_ms: f64,
    /// Services still served at the `minimal` level.
    pub essential_services: Vec<String>,
}

impl Default for FallbackManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            health_sample_ttl: Duration::from_secs(30),
            slow_response_ms: 30_000.0,
            essential_services: vec!["core".to_string(), "essential".to_string()],
        }
    }
}

/// Health of one tracked service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub is_healthy: bool,
    /// Exponentially weighted response time.
    pub response_time_ms: f64,
    pub error_rate_percent: f64,
    pub availability_percent: f64,
    pub consecutive_failures: u32,
    pub last_check: DateTime<Utc>,
    pub recent_external_errors: usize,
    pub last_external_error: Option<String>,
}

#[derive(Debug)]
struct HealthState {
    is_healthy: bool,
    response_time_ms: f64,
    error_rate_percent: f64,
    availability_percent: f64,
    consecutive_failures: u32,
    last_check: DateTime<Utc>,
    checked_at: Instant,
    requests: VecDeque<bool>,
    external_errors: VecDeque<(Instant, String)>,
}

impl HealthState {
    fn first(success: bool, response_time_ms: f64) -> Self {
        let mut requests = VecDeque::with_capacity(HEALTH_WINDOW);
        requests.push_back(success);
        Self {
            is_healthy: success,
            response_time_ms,
            error_rate_percent: if success { 0.0 } else { 100.0 },
            availability_percent: if success { 100.0 } else { 0.0 },
            consecutive_failures: u32::from(!success),
            last_check: Utc::now(),
            checked_at: Instant::now(),
            requests,
            external_errors: VecDeque::new(),
        }
    }

    fn update(&mut self, success: bool, response_time_ms: f64) {
        self.last_check = Utc::now();
        self.checked_at = Instant::now();
        self.response_time_ms = self.response_time_ms * 0.7 + response_time_ms * 0.3;

        if success {
            self.consecutive_failures = 0;
            self.is_healthy = true;
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= 3 {
                self.is_healthy = false;
            }
        }

        if self.requests.len() == HEALTH_WINDOW {
            self.requests.pop_front();
        }
        self.requests.push_back(success);
        let failures = self.requests.iter().filter(|ok| !**ok).count() as f64;
        let total = self.requests.len() as f64;
        self.error_rate_percent = failures / total * 100.0;
        self.availability_percent = (total - failures) / total * 100.0;
    }

    fn recent_external_errors(&self) -> usize {
        self.external_errors
            .iter()
            .filter(|(at, _)| at.elapsed() < EXTERNAL_ERROR_WINDOW)
            .count()
    }

    fn view(&self, name: &str) -> ServiceHealth {
        ServiceHealth {
            service_name: name.to_string(),
            is_healthy: self.is_healthy,
            response_time_ms: self.response_time_ms,
            error_rate_percent: self.error_rate_percent,
            availability_percent: self.availability_percent,
            consecutive_failures: self.consecutive_failures,
            last_check: self.last_check,
            recent_external_errors: self.recent_external_errors(),
            last_external_error: self.external_errors.back().map(|(_, e)| e.clone()),
        }
    }
}

/// Result of [`FallbackManager::execute_with_fallback`].
#[derive(Debug, Clone, Serialize)]
pub struct FallbackExecution {
    /// `None` when the primary path produced the result.
    pub strategy_used: Option<FallbackStrategy>,
    pub success: bool,
    pub response_time_ms: f64,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Set on every result that did not come from the primary path.
    pub is_degraded: bool,
    /// The primary path's failure, when the primary was attempted.
    pub primary_error: Option<TaskError>,
    pub metadata: BTreeMap<String, Value>,
}

impl FallbackExecution {
    fn primary(data: Value, started: Instant) -> Self {
        Self {
            strategy_used: None,
            success: true,
            response_time_ms: elapsed_ms(started),
            data: Some(data),
            error: None,
            is_degraded: false,
            primary_error: None,
            metadata: BTreeMap::new(),
        }
    }

    fn degraded(
        strategy: FallbackStrategy,
        started: Instant,
        outcome: Result<Value, String>,
        primary_error: Option<TaskError>,
    ) -> Self {
        let (success, data, error) = match outcome {
            Ok(data) => (true, Some(data), None),
            Err(e) => (false, None, Some(e)),
        };
        Self {
            strategy_used: Some(strategy),
            success,
            response_time_ms: elapsed_ms(started),
            data,
            error,
            is_degraded: true,
            primary_error,
            metadata: BTreeMap::new(),
        }
    }

    fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// The primary path of one execution and the bound for each attempt.
struct PrimaryCall<'a, F> {
    primary: &'a F,
    call_timeout: Option<Duration>,
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// A change of the global service level.
#[derive(Debug, Clone, Serialize)]
pub struct DegradationEvent {
    pub timestamp: DateTime<Utc>,
    pub from_level: ServiceLevel,
    pub to_level: ServiceLevel,
    pub availability_percent: f64,
    pub healthy_services: usize,
    pub total_services: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub service_level: ServiceLevel,
    pub total_services: usize,
    pub healthy_services: usize,
    pub overall_availability: f64,
    pub services: Vec<ServiceHealth>,
    pub recent_degradation_events: Vec<DegradationEvent>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceFallbackMetrics {
    pub total_fallbacks: usize,
    pub successful_fallbacks: usize,
    pub avg_response_time_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackMetrics {
    pub total_fallback_executions: usize,
    pub success_rate: f64,
    pub strategies_used: BTreeMap<String, usize>,
    pub services: BTreeMap<String, ServiceFallbackMetrics>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Value,
    stored_at: Instant,
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    strategy: FallbackStrategy,
    success: bool,
    response_time_ms: f64,
}

/// Chooses between the primary path and a degraded response per call.
pub struct FallbackManager {
    config: FallbackManagerConfig,
    essential: HashSet<String>,
    breakers: Arc<CircuitBreakerManager>,
    fallbacks: RwLock<HashMap<String, FallbackConfig>>,
    health: Mutex<HashMap<String, HealthState>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    executions: Mutex<HashMap<String, VecDeque<ExecutionRecord>>>,
    events: Mutex<VecDeque<DegradationEvent>>,
    level: RwLock<ServiceLevel>,
    metrics: MetricsCollector,
}

impl FallbackManager {
    pub fn new(
        config: FallbackManagerConfig,
        breakers: Arc<CircuitBreakerManager>,
        metrics: MetricsCollector,
    ) -> Self {
        let essential = config.essential_services.iter().cloned().collect();
        Self {
            config,
            essential,
            breakers,
            fallbacks: RwLock::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::with_capacity(DEGRADATION_HISTORY)),
            level: RwLock::new(ServiceLevel::Full),
            metrics,
        }
    }

    pub fn register_fallback(&self, service: impl Into<String>, config: FallbackConfig) {
        let service = service.into();
        info!(
            service = %service,
            strategy = config.strategy.as_str(),
            "Registered fallback strategy"
        );
        self.fallbacks.write().insert(service, config);
    }

    pub fn has_fallback(&self, service: &str) -> bool {
        self.fallbacks.read().contains_key(service)
    }

    pub fn service_level(&self) -> ServiceLevel {
        *self.level.read()
    }

    /// Stores the last good value for `service`.
    pub fn update_cache(&self, service: &str, data: Value) {
        self.cache.lock().insert(
            service.to_string(),
            CacheEntry {
                data,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn service_health(&self, service: &str) -> Option<ServiceHealth> {
        self.health.lock().get(service).map(|h| h.view(service))
    }

    /// Runs `primary` through the breaker for `service`, or a fallback instead.
    ///
    /// `primary` is never invoked while the service's breaker is open.
    /// `fallback_data` describes the request being served; it is attached to
    /// degraded results and is the last-resort input for reduced quality.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        service: &str,
        primary: F,
        fallback_data: Option<&Value>,
    ) -> FallbackExecution
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        self.execute(service, None, primary, fallback_data).await
    }

    /// Like [`execute_with_fallback`](Self::execute_with_fallback), with each
    /// primary attempt bounded by `call_timeout` instead of the breaker's own.
    pub async fn execute_with_fallback_within<F, Fut>(
        &self,
        service: &str,
        call_timeout: Duration,
        primary: F,
        fallback_data: Option<&Value>,
    ) -> FallbackExecution
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        self.execute(service, Some(call_timeout), primary, fallback_data)
            .await
    }

    async fn execute<F, Fut>(
        &self,
        service: &str,
        call_timeout: Option<Duration>,
        primary: F,
        fallback_data: Option<&Value>,
    ) -> FallbackExecution
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        let started = Instant::now();
        let attempt = PrimaryCall {
            primary: &primary,
            call_timeout,
        };

        let execution = if let Some(reason) = self.fallback_trigger(service) {
            info!(service = %service, reason = %reason, "Using fallback without calling primary");
            self.run_fallback(service, &attempt, fallback_data, started, None)
                .await
                .with_meta("trigger", json!(reason))
        } else {
            match self.call_primary(service, &attempt).await {
                Ok(data) => return FallbackExecution::primary(data, started),
                Err(e) => {
                    warn!(service = %service, error = %e, "Primary call failed");
                    self.run_fallback(service, &attempt, fallback_data, started, Some(e))
                        .await
                }
            }
        };

        match fallback_data {
            Some(request) => execution.with_meta("request", request.clone()),
            None => execution,
        }
    }

    async fn call_primary<F, Fut>(
        &self,
        service: &str,
        attempt: &PrimaryCall<'_, F>,
    ) -> Result<Value, TaskError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        let started = Instant::now();
        let primary = attempt.primary;
        let result = match attempt.call_timeout {
            Some(timeout) => {
                self.breakers
                    .call_with_timeout(service, timeout, primary)
                    .await
            }
            None => self.breakers.call(service, primary).await,
        };
        let result = match result {
            Ok(data) => Ok(data),
            Err(CallError::Failed(e)) => Err(e),
            Err(e @ CallError::TimedOut { .. }) => Err(TaskError::timeout(e.to_string())),
            // Nothing was called, so the service's health is left untouched.
            Err(e @ CallError::Rejected { .. }) => return Err(TaskError::network(e.to_string())),
        };
        self.record_attempt(service, result.as_ref().err(), elapsed_ms(started));
        result
    }

    /// Returns why `service` should skip its primary path, if it should.
    fn fallback_trigger(&self, service: &str) -> Option<String> {
        if !self.has_fallback(service) {
            return None;
        }

        if !self.breakers.allows_request(service) {
            return Some("circuit breaker open".to_string());
        }

        if let Some(health) = self.health.lock().get(service) {
            let recent_external = health.recent_external_errors();
            if recent_external >= 2 {
                return Some(format!("{} recent external service errors", recent_external));
            }
            if health.checked_at.elapsed() < self.config.health_sample_ttl {
                if health.error_rate_percent > 50.0 {
                    return Some(format!("error rate {:.0}%", health.error_rate_percent));
                }
                if health.consecutive_failures >= 2 {
                    return Some(format!(
                        "{} consecutive failures",
                        health.consecutive_failures
                    ));
                }
                if health.response_time_ms > self.config.slow_response_ms {
                    return Some(format!("slow responses ({:.0} ms)", health.response_time_ms));
                }
            }
        }

        match self.service_level() {
            ServiceLevel::Emergency => Some("service level emergency".to_string()),
            ServiceLevel::Minimal if !self.essential.contains(service) => {
                Some("service level minimal".to_string())
            }
            _ => None,
        }
    }

    fn record_attempt(&self, service: &str, error: Option<&TaskError>, response_time_ms: f64) {
        let mut health = self.health.lock();
        let success = error.is_none();
        let state = health
            .entry(service.to_string())
            .and_modify(|h| h.update(success, response_time_ms))
            .or_insert_with(|| HealthState::first(success, response_time_ms));

        if let Some(err) = error.filter(|e| e.kind.is_external()) {
            warn!(service = %service, kind = %err.kind, "External service degradation detected");
            state.is_healthy = false;
            if state.external_errors.len() == EXTERNAL_ERROR_HISTORY {
                state.external_errors.pop_front();
            }
            state
                .external_errors
                .push_back((Instant::now(), err.to_string()));
        }
    }

    async fn run_fallback<F, Fut>(
        &self,
        service: &str,
        attempt: &PrimaryCall<'_, F>,
        fallback_data: Option<&Value>,
        started: Instant,
        primary_error: Option<TaskError>,
    ) -> FallbackExecution
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        let Some(config) = self.fallbacks.read().get(service).cloned() else {
            return FallbackExecution::degraded(
                FallbackStrategy::FailFast,
                started,
                Err(format!("No fallback configured for service '{}'", service)),
                primary_error,
            );
        };

        let execution = match config.strategy {
            FallbackStrategy::CachedResponse => {
                let cached = self.cache.lock().get(service).cloned();
                match cached {
                    Some(entry) if entry.stored_at.elapsed() <= config.cache_ttl => {
                        let age = entry.stored_at.elapsed().as_secs_f64();
                        FallbackExecution::degraded(
                            config.strategy,
                            started,
                            Ok(entry.data),
                            primary_error,
                        )
                        .with_meta("cache_age_seconds", json!(age))
                    }
                    _ => FallbackExecution::degraded(
                        config.strategy,
                        started,
                        Err("No valid cached response available".to_string()),
                        primary_error,
                    ),
                }
            }
            FallbackStrategy::ReducedQuality => {
                let cached = self.cache.lock().get(service).map(|e| e.data.clone());
                let source = cached.or_else(|| fallback_data.cloned());
                let outcome = source
                    .map(|data| reduce_quality(&data, config.quality_reduction_factor))
                    .ok_or_else(|| {
                        "No fallback data provided for reduced quality response".to_string()
                    });
                FallbackExecution::degraded(config.strategy, started, outcome, primary_error)
                    .with_meta("quality_factor", json!(config.quality_reduction_factor))
            }
            FallbackStrategy::MockResponse => {
                let data = config.mock_response_template.clone().unwrap_or_else(|| {
                    json!({
                        "status": "fallback",
                        "message": format!("Service {} is temporarily unavailable", service),
                        "data": [],
                        "degraded": true,
                    })
                });
                FallbackExecution::degraded(config.strategy, started, Ok(data), primary_error)
            }
            FallbackStrategy::FailFast => {
                let mut message = format!("Service '{}' is currently unavailable", service);
                if let Some(e) = &primary_error {
                    message.push_str(&format!(" (Reason: {})", e));
                }
                FallbackExecution::degraded(config.strategy, started, Err(message), primary_error)
            }
            FallbackStrategy::RetryWithDelay => {
                tokio::time::sleep(config.retry_delay).await;
                let retried = self.call_primary(service, attempt).await;
                let (outcome, last_error) = match retried {
                    Ok(data) => (Ok(data), primary_error),
                    Err(e) => (Err(format!("Delayed retry failed: {}", e)), Some(e)),
                };
                FallbackExecution::degraded(config.strategy, started, outcome, last_error)
                    .with_meta("delay_seconds", json!(config.retry_delay.as_secs_f64()))
            }
        };

        self.record_execution(service, &execution);
        execution
    }

    fn record_execution(&self, service: &str, execution: &FallbackExecution) {
        let Some(strategy) = execution.strategy_used else {
            return;
        };
        self.metrics
            .record_fallback(service, strategy.as_str(), execution.success);

        let mut executions = self.executions.lock();
        let ring = executions.entry(service.to_string()).or_default();
        if ring.len() == EXECUTION_HISTORY {
            ring.pop_front();
        }
        ring.push_back(ExecutionRecord {
            strategy,
            success: execution.success,
            response_time_ms: execution.response_time_ms,
        });

        debug!(
            service = %service,
            strategy = strategy.as_str(),
            success = execution.success,
            "Fallback executed"
        );
    }

    /// Recomputes the global service level from aggregate service health.
    pub fn assess_service_level(&self) -> ServiceLevel {
        let (total, healthy, availability) = {
            let health = self.health.lock();
            if health.is_empty() {
                return self.service_level();
            }
            let total = health.len();
            let healthy = health.values().filter(|h| h.is_healthy).count();
            let availability =
                health.values().map(|h| h.availability_percent).sum::<f64>() / total as f64;
            (total, healthy, availability)
        };

        let healthy_ratio = healthy as f64 / total as f64;
        let new_level = if availability >= 90.0 && healthy_ratio >= 0.8 {
            ServiceLevel::Full
        } else if availability >= 70.0 && healthy_ratio >= 0.6 {
            ServiceLevel::Degraded
        } else if availability >= 50.0 && healthy_ratio >= 0.4 {
            ServiceLevel::Minimal
        } else {
            ServiceLevel::Emergency
        };

        let old_level = {
            let mut level = self.level.write();
            std::mem::replace(&mut *level, new_level)
        };

        if new_level != old_level {
            let mut events = self.events.lock();
            if events.len() == DEGRADATION_HISTORY {
                events.pop_front();
            }
            events.push_back(DegradationEvent {
                timestamp: Utc::now(),
                from_level: old_level,
                to_level: new_level,
                availability_percent: availability,
                healthy_services: healthy,
                total_services: total,
            });
            self.metrics.set_service_level(new_level.code());

            if matches!(new_level, ServiceLevel::Minimal | ServiceLevel::Emergency) {
                warn!(
                    from = %old_level,
                    to = %new_level,
                    availability_percent = availability,
                    "Service level degraded"
                );
            } else {
                info!(
                    from = %old_level,
                    to = %new_level,
                    availability_percent = availability,
                    "Service level changed"
                );
            }
        }
        new_level
    }

    /// Reassesses the service level every `health_check_interval` until cancelled.
    pub async fn run_health_monitor(self: Arc<Self>, cancel: CancellationToken) {
        info!("Fallback health monitoring started");
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.assess_service_level();
                }
            }
        }
        info!("Fallback health monitoring stopped");
    }

    pub fn health_summary(&self) -> HealthSummary {
        let health = self.health.lock();
        let mut services: Vec<ServiceHealth> =
            health.iter().map(|(name, h)| h.view(name)).collect();
        services.sort_by(|a, b| a.service_name.cmp(&b.service_name));

        let total_services = services.len();
        let healthy_services = services.iter().filter(|s| s.is_healthy).count();
        let overall_availability = if total_services == 0 {
            100.0
        } else {
            services.iter().map(|s| s.availability_percent).sum::<f64>() / total_services as f64
        };

        let events = self.events.lock();
        let skip = events.len().saturating_sub(10);
        HealthSummary {
            service_level: self.service_level(),
            total_services,
            healthy_services,
            overall_availability,
            services,
            recent_degradation_events: events.iter().skip(skip).cloned().collect(),
        }
    }

    pub fn fallback_metrics(&self) -> FallbackMetrics {
        let executions = self.executions.lock();
        let mut metrics = FallbackMetrics::default();
        let mut successes = 0;

        for (service, ring) in executions.iter() {
            if ring.is_empty() {
                continue;
            }
            let successful = ring.iter().filter(|e| e.success).count();
            successes += successful;
            metrics.total_fallback_executions += ring.len();
            for exec in ring {
                *metrics
                    .strategies_used
                    .entry(exec.strategy.as_str().to_string())
                    .or_default() += 1;
            }
            metrics.services.insert(
                service.clone(),
                ServiceFallbackMetrics {
                    total_fallbacks: ring.len(),
                    successful_fallbacks: successful,
                    avg_response_time_ms: ring.iter().map(|e| e.response_time_ms).sum::<f64>()
                        / ring.len() as f64,
                },
            );
        }

        if metrics.total_fallback_executions > 0 {
            metrics.success_rate =
                successes as f64 / metrics.total_fallback_executions as f64 * 100.0;
        }
        metrics
    }
}

/// Shrinks every array in `data` to `max(1, floor(len * factor))` elements and
/// marks objects as degraded.
pub fn reduce_quality(data: &Value, factor: f64) -> Value {
    match data {
        Value::Array(items) => {
            let keep = ((items.len() as f64 * factor).floor() as usize).max(1);
            Value::Array(items.iter().take(keep).cloned().collect())
        }
        Value::Object(map) => {
            let mut reduced = serde_json::Map::with_capacity(map.len() + 2);
            for (key, value) in map {
                let value = match value {
                    Value::Array(_) | Value::Object(_) => reduce_quality(value, factor),
                    other => other.clone(),
                };
                reduced.insert(key.clone(), value);
            }
            reduced.insert("_degraded".to_string(), Value::Bool(true));
            reduced.insert("_quality_factor".to_string(), json!(factor));
            Value::Object(reduced)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(failure_threshold: u32) -> FallbackManager {
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig::new(failure_threshold, Duration::from_secs(60), 2),
            MetricsCollector::disabled(),
        ));
        FallbackManager::new(
            FallbackManagerConfig::default(),
            breakers,
            MetricsCollector::disabled(),
        )
    }

    #[tokio::test]
    async fn test_primary_success_is_not_degraded() {
        let fm = manager(5);
        let exec = fm
            .execute_with_fallback("hotels", || async { Ok(json!({"rooms": 3})) }, None)
            .await;
        assert!(exec.success);
        assert!(!exec.is_degraded);
        assert_eq!(exec.strategy_used, None);
        assert_eq!(exec.data, Some(json!({"rooms": 3})));
        assert!(fm.service_health("hotels").unwrap().is_healthy);
    }

    #[tokio::test]
    async fn test_never_calls_primary_while_breaker_open() {
        let fm = manager(2);

        // Without a registered fallback every call reaches the breaker.
        for _ in 0..2 {
            let exec = fm
                .execute_with_fallback(
                    "hotels",
                    || async { Err(TaskError::parsing("bad markup")) },
                    None,
                )
                .await;
            assert!(exec.is_degraded);
            assert_eq!(exec.primary_error.unwrap().kind, ErrorKind::Parsing);
        }
        assert_eq!(fm.breakers.state("hotels"), Some(CircuitState::Open));
        fm.register_fallback(
            "hotels",
            FallbackConfig::new(FallbackStrategy::MockResponse),
        );

        let calls = AtomicUsize::new(0);
        let exec = fm
            .execute_with_fallback(
                "hotels",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({}))
                },
                None,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(exec.success);
        assert!(exec.is_degraded);
        assert_eq!(exec.strategy_used, Some(FallbackStrategy::MockResponse));
        assert_eq!(exec.metadata["trigger"], json!("circuit breaker open"));
    }

    #[tokio::test]
    async fn test_breaker_rejection_leaves_health_untouched() {
        let fm = manager(2);
        for _ in 0..2 {
            fm.execute_with_fallback(
                "hotels",
                || async { Err(TaskError::parsing("bad markup")) },
                None,
            )
            .await;
        }
        assert_eq!(fm.breakers.state("hotels"), Some(CircuitState::Open));
        let before = fm.service_health("hotels").unwrap();

        let exec = fm
            .execute_with_fallback("hotels", || async { Ok(json!({})) }, None)
            .await;
        assert!(!exec.success);
        assert_eq!(exec.primary_error.unwrap().kind, ErrorKind::Network);

        let after = fm.service_health("hotels").unwrap();
        assert_eq!(after.consecutive_failures, before.consecutive_failures);
        assert_eq!(after.error_rate_percent, before.error_rate_percent);
        assert_eq!(after.recent_external_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_bound_replaces_breaker_call_timeout() {
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig::new(5, Duration::from_secs(60), 2)
                .with_call_timeout(Duration::from_millis(50)),
            MetricsCollector::disabled(),
        ));
        let fm = FallbackManager::new(
            FallbackManagerConfig::default(),
            breakers,
            MetricsCollector::disabled(),
        );
        let slow = || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(json!({"done": true}))
        };

        let exec = fm
            .execute_with_fallback_within("crawl", Duration::from_secs(30), slow, None)
            .await;
        assert!(exec.success);
        assert!(!exec.is_degraded);

        let exec = fm.execute_with_fallback("crawl", slow, None).await;
        assert!(!exec.success);
        assert_eq!(exec.primary_error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_degraded_result_carries_request() {
        let fm = manager(5);
        fm.register_fallback("hotels", FallbackConfig::new(FallbackStrategy::MockResponse));
        let request = json!({"task_name": "hotels", "job_id": "j-1", "params": {"city": "Riyadh"}});

        let exec = fm
            .execute_with_fallback(
                "hotels",
                || async { Err(TaskError::network("refused")) },
                Some(&request),
            )
            .await;
        assert!(exec.success);
        assert_eq!(exec.metadata["request"]["job_id"], "j-1");

        // Results from the primary path are returned as they are.
        let exec = fm
            .execute_with_fallback("museums", || async { Ok(json!({"rooms": 1})) }, Some(&request))
            .await;
        assert!(!exec.is_degraded);
        assert!(exec.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_reduced_quality_prefers_cached_response() {
        let fm = manager(5);
        fm.register_fallback(
            "listings",
            FallbackConfig::new(FallbackStrategy::ReducedQuality).with_quality_factor(0.5),
        );
        let request = json!({"task_name": "listings", "params": {"pages": [1, 2]}});

        let exec = fm
            .execute_with_fallback(
                "listings",
                || async { Err(TaskError::network("refused")) },
                Some(&request),
            )
            .await;
        assert!(exec.success);
        assert_eq!(exec.data.unwrap()["params"]["pages"], json!([1]));

        fm.update_cache("listings", json!({"items": [1, 2, 3, 4]}));
        let exec = fm
            .execute_with_fallback(
                "listings",
                || async { Err(TaskError::parsing("layout")) },
                Some(&request),
            )
            .await;
        assert_eq!(exec.data.unwrap()["items"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_without_fallback_primary_error_is_kept() {
        let fm = manager(5);
        let exec = fm
            .execute_with_fallback(
                "github",
                || async { Err(TaskError::authentication("session expired")) },
                None,
            )
            .await;
        assert!(!exec.success);
        assert_eq!(exec.strategy_used, Some(FallbackStrategy::FailFast));
        assert_eq!(exec.primary_error.unwrap().kind, ErrorKind::Authentication);
        assert!(exec.error.unwrap().contains("No fallback configured"));
    }

    #[tokio::test]
    async fn test_cached_response_respects_ttl() {
        let fm = manager(5);
        fm.register_fallback(
            "opendata",
            FallbackConfig::new(FallbackStrategy::CachedResponse)
                .with_cache_ttl(Duration::from_secs(300)),
        );
        fm.update_cache("opendata", json!({"rows": [1, 2, 3]}));

        let exec = fm
            .execute_with_fallback(
                "opendata",
                || async { Err(TaskError::network("refused")) },
                None,
            )
            .await;
        assert!(exec.success);
        assert_eq!(exec.data, Some(json!({"rows": [1, 2, 3]})));
        assert_eq!(exec.strategy_used, Some(FallbackStrategy::CachedResponse));

        let fm = manager(5);
        fm.register_fallback(
            "opendata",
            FallbackConfig::new(FallbackStrategy::CachedResponse),
        );
        let exec = fm
            .execute_with_fallback(
                "opendata",
                || async { Err(TaskError::network("refused")) },
                None,
            )
            .await;
        assert!(!exec.success);
        assert_eq!(exec.error.as_deref(), Some("No valid cached response available"));
    }

    #[tokio::test]
    async fn test_consecutive_failures_trigger_fallback_until_sample_expires() {
        let fm = manager(10);
        fm.register_fallback("site", FallbackConfig::new(FallbackStrategy::FailFast));

        for _ in 0..2 {
            fm.execute_with_fallback(
                "site",
                || async { Err(TaskError::parsing("layout changed")) },
                None,
            )
            .await;
        }

        let calls = AtomicUsize::new(0);
        let exec = fm
            .execute_with_fallback(
                "site",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({}))
                },
                None,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!exec.success);
        assert!(exec.error.unwrap().contains("currently unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_health_lets_primary_through() {
        let fm = manager(10);
        fm.register_fallback("site", FallbackConfig::new(FallbackStrategy::FailFast));
        for _ in 0..2 {
            fm.execute_with_fallback(
                "site",
                || async { Err(TaskError::parsing("layout changed")) },
                None,
            )
            .await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        let exec = fm
            .execute_with_fallback("site", || async { Ok(json!({"ok": true})) }, None)
            .await;
        assert!(exec.success);
        assert!(!exec.is_degraded);
        assert_eq!(fm.service_health("site").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_delay_calls_primary_again() {
        let fm = manager(10);
        fm.register_fallback(
            "flaky",
            FallbackConfig::new(FallbackStrategy::RetryWithDelay)
                .with_retry_delay(Duration::from_secs(2)),
        );

        let calls = AtomicUsize::new(0);
        let exec = fm
            .execute_with_fallback(
                "flaky",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TaskError::unknown("first attempt"))
                    } else {
                        Ok(json!({"attempt": 2}))
                    }
                },
                None,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(exec.success);
        assert!(exec.is_degraded);
        assert_eq!(exec.data, Some(json!({"attempt": 2})));
    }

    #[test]
    fn test_reduce_quality_shrinks_arrays() {
        let data = json!({
            "items": [1, 2, 3, 4, 5],
            "nested": {"tags": ["a", "b"]},
            "title": "x",
        });
        let reduced = reduce_quality(&data, 0.5);
        assert_eq!(reduced["items"], json!([1, 2]));
        assert_eq!(reduced["nested"]["tags"], json!(["a"]));
        assert_eq!(reduced["title"], json!("x"));
        assert_eq!(reduced["_degraded"], json!(true));
        assert_eq!(reduced["_quality_factor"], json!(0.5));
    }

    #[tokio::test]
    async fn test_service_level_assessment() {
        let fm = manager(100);
        assert_eq!(fm.assess_service_level(), ServiceLevel::Full);

        fm.execute_with_fallback("a", || async { Ok(json!({})) }, None)
            .await;
        for _ in 0..3 {
            fm.execute_with_fallback("b", || async { Err(TaskError::network("down")) }, None)
                .await;
        }
        // One healthy service at 100% and one unhealthy at 0%.
        assert_eq!(fm.assess_service_level(), ServiceLevel::Minimal);

        let summary = fm.health_summary();
        assert_eq!(summary.total_services, 2);
        assert_eq!(summary.healthy_services, 1);
        assert_eq!(summary.recent_degradation_events.len(), 1);
        assert_eq!(summary.services[1].recent_external_errors, 3);
    }

    #[tokio::test]
    async fn test_fallback_metrics_aggregate() {
        let fm = manager(100);
        fm.register_fallback("m", FallbackConfig::new(FallbackStrategy::MockResponse));
        fm.execute_with_fallback("m", || async { Err(TaskError::parsing("x")) }, None)
            .await;

        let metrics = fm.fallback_metrics();
        assert_eq!(metrics.total_fallback_executions, 1);
        assert_eq!(metrics.success_rate, 100.0);
        assert_eq!(metrics.strategies_used["mock_response"], 1);
        assert_eq!(metrics.services["m"].total_fallbacks, 1);
    }
}
