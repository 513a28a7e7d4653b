//! Engine-wide health assessment.
//!
//! [`HealthMonitor`] gathers a [`ComponentHealth`] from every engine part,
//! folds them into a [`Readiness`], computes the 0-100 health score and feeds
//! both, plus queue and resource figures, to the [`AlertManager`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::alerts::{metric, Alert, AlertManager};
use super::checks::{
    check_breakers, check_fallback, check_resources, check_worker_pool, worker_is_healthy,
    Component, ComponentHealth, HealthStatus, Liveness, Readiness,
};
use crate::error::ErrorHandler;
use crate::metrics::MetricsCollector;
use crate::resilience::{CircuitBreakerManager, FallbackManager};
use crate::resources::{AdaptiveController, LoadInputs};
use crate::scheduler::{ContextProvider, JobStore, QueueStats, WorkerPool, WorkerStatus};

/// Worker id used for the runtime's trial context.
const HEALTH_CHECK_WORKER: &str = "health-check";

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Upper bound for each asynchronous check.
    pub check_timeout: Duration,
    /// Checks slower than this report degraded.
    pub degraded_latency: Duration,
    pub unhealthy_latency: Duration,
    pub interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            degraded_latency: Duration::from_secs(1),
            unhealthy_latency: Duration::from_secs(5),
            interval: Duration::from_secs(30),
        }
    }
}

/// The components a [`HealthMonitor`] inspects.
#[derive(Clone)]
pub struct HealthDeps {
    pub store: Arc<JobStore>,
    pub pool: Arc<WorkerPool>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub fallback: Arc<FallbackManager>,
    pub controller: Arc<AdaptiveController>,
    pub errors: Arc<ErrorHandler>,
    pub contexts: Arc<dyn ContextProvider>,
}

/// Inputs of [`health_score`].
#[derive(Debug, Clone, Default)]
pub struct ScoreInputs<'a> {
    pub workers: &'a [WorkerStatus],
    pub queued: u64,
    /// Task errors since the previous assessment.
    pub new_errors: u64,
    pub checks_passing: usize,
    pub checks_total: usize,
}

/// Blends worker, queue, error and check health into a 0-100 score.
pub fn health_score(inputs: &ScoreInputs<'_>) -> f64 {
    let worker = if inputs.workers.is_empty() {
        0.0
    } else {
        let total: f64 = inputs
            .workers
            .iter()
            .map(|w| {
                let mut score = 100.0 - f64::from((w.consecutive_failures * 10).min(50));
                if w.active_contexts > 5 {
                    score -= (w.active_contexts - 5) as f64 * 5.0;
                }
                score
            })
            .sum();
        total / inputs.workers.len() as f64
    };

    let queue = match inputs.queued {
        q if q > 50 => (100.0 - (q - 50) as f64 * 2.0).max(0.0),
        q if q > 20 => 100.0 - (q - 20) as f64,
        _ => 100.0,
    };

    let errors = match inputs.new_errors {
        0 => 100.0,
        n if n < 5 => 90.0,
        n if n < 10 => 70.0,
        n => (70.0 - (n - 10) as f64 * 5.0).max(0.0),
    };

    let checks = if inputs.checks_total == 0 {
        100.0
    } else {
        inputs.checks_passing as f64 / inputs.checks_total as f64 * 100.0
    };

    let mut score = 100.0;
    score = score * 0.7 + worker * 0.3;
    score = score * 0.8 + queue * 0.2;
    score = score * 0.75 + errors * 0.25;
    score = score * 0.75 + checks * 0.25;
    score.clamp(0.0, 100.0)
}

/// Result of one full assessment.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    #[serde(flatten)]
    pub readiness: Readiness,
    /// 0-100.
    pub health_score: f64,
    pub active_alerts: Vec<Alert>,
    pub uptime_secs: f64,
}

impl SystemHealth {
    pub fn status(&self) -> HealthStatus {
        self.readiness.status
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.ready_for_traffic
    }
}

pub struct HealthMonitor {
    deps: HealthDeps,
    config: HealthConfig,
    alerts: AlertManager,
    metrics: MetricsCollector,
    started: Instant,
    started_at: DateTime<Utc>,
    last_error_total: Mutex<u64>,
    last: Mutex<Option<SystemHealth>>,
}

impl HealthMonitor {
    pub fn new(
        deps: HealthDeps,
        config: HealthConfig,
        alerts: AlertManager,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            deps,
            config,
            alerts,
            metrics,
            started: Instant::now(),
            started_at: Utc::now(),
            last_error_total: Mutex::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The most recent assessment, if any ran.
    pub fn last(&self) -> Option<SystemHealth> {
        self.last.lock().clone()
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            status: HealthStatus::Healthy,
            message: "Engine is alive".to_string(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            checked_at: Utc::now(),
        }
    }

    /// Checks every component without touching alerts or the score.
    pub async fn readiness(&self) -> Readiness {
        Readiness::from_components(self.check_components().await.0)
    }

    /// Runs all checks, scores them and evaluates the alert rules.
    pub async fn assess(&self) -> SystemHealth {
        let (components, queue) = self.check_components().await;
        let readiness = Readiness::from_components(components);
        let pool = self.deps.pool.stats();

        let error_total: u64 = self.deps.errors.error_stats().error_counts.values().sum();
        let new_errors = {
            let mut last = self.last_error_total.lock();
            let delta = error_total.saturating_sub(*last);
            *last = error_total;
            delta
        };

        let checks_passing = readiness
            .components
            .iter()
            .filter(|c| c.status != HealthStatus::Unhealthy)
            .count();
        let score = health_score(&ScoreInputs {
            workers: &pool.workers,
            queued: queue.as_ref().map_or(0, |q| q.queued),
            new_errors,
            checks_passing,
            checks_total: readiness.components.len(),
        });
        self.metrics.set_health_score(score);

        let mut values = BTreeMap::new();
        values.insert(metric::HEALTH_SCORE.to_string(), score);
        values.insert(metric::NEW_ERRORS.to_string(), new_errors as f64);
        values.insert(
            metric::LIVE_WORKERS.to_string(),
            pool.workers.iter().filter(|w| worker_is_healthy(w)).count() as f64,
        );
        values.insert(
            metric::OPEN_BREAKERS.to_string(),
            self.deps.breakers.summary().open as f64,
        );
        if let Some(queue) = &queue {
            values.insert(metric::QUEUE_DEPTH.to_string(), queue.queued as f64);
            values.insert(metric::DEAD_LETTER_JOBS.to_string(), queue.dead_letter as f64);
        }
        if let Some(resources) = readiness.component(Component::Resources) {
            for (key, name) in [
                ("cpu_percent", metric::CPU_PERCENT),
                ("memory_percent", metric::MEMORY_PERCENT),
                ("disk_percent", metric::DISK_PERCENT),
            ] {
                if let Some(value) = resources.details.get(key).and_then(|v| v.as_f64()) {
                    values.insert(name.to_string(), value);
                }
            }
        }
        self.alerts.evaluate(&values);

        let health = SystemHealth {
            readiness,
            health_score: score,
            active_alerts: self.alerts.active_alerts(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
        };
        debug!(
            status = %health.status(),
            score = health.health_score,
            ready = health.is_ready(),
            active_alerts = health.active_alerts.len(),
            "Health assessed"
        );
        *self.last.lock() = Some(health.clone());
        health
    }

    /// Assesses health every `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.tick().await;
        let mut last_status = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let health = self.assess().await;
                    if last_status != Some(health.status()) {
                        info!(
                            status = %health.status(),
                            score = health.health_score,
                            ready = health.is_ready(),
                            "Engine health changed"
                        );
                        last_status = Some(health.status());
                    }
                }
            }
        }
    }

    async fn check_components(&self) -> (Vec<ComponentHealth>, Option<QueueStats>) {
        let ((store, queue), runtime) = tokio::join!(self.check_store(), self.check_runtime());

        let pool = self.deps.pool.stats();
        let snapshot = match self.deps.controller.monitor().latest() {
            Some(snapshot) => snapshot,
            None => self.deps.controller.monitor().sample(LoadInputs {
                queue_depth: queue.as_ref().map_or(0, |q| q.queued),
                active_workers: pool.workers.len(),
                active_contexts: pool.workers.iter().map(|w| w.active_contexts).sum(),
            }),
        };

        let components = vec![
            runtime,
            store,
            check_worker_pool(&pool),
            check_breakers(&self.deps.breakers.summary()),
            check_fallback(&self.deps.fallback.health_summary()),
            check_resources(&snapshot),
        ];
        (components, queue)
    }

    async fn check_store(&self) -> (ComponentHealth, Option<QueueStats>) {
        let backend = self.deps.store.backend_name();
        let started = Instant::now();
        let result = self.timed(self.deps.store.queue_stats()).await;
        let elapsed = started.elapsed();

        match result {
            Some(Ok(stats)) => {
                let status = self.latency_status(elapsed);
                let health = ComponentHealth::new(
                    Component::Store,
                    status,
                    format!("{} store responded in {:.1}ms", backend, elapsed.as_secs_f64() * 1000.0),
                )
                .with_response_time(elapsed)
                .with_details(json!({
                    "backend": backend,
                    "queued": stats.queued,
                    "running": stats.running,
                    "dead_letter": stats.dead_letter,
                }));
                (health, Some(stats))
            }
            Some(Err(e)) => {
                warn!(backend, error = %e, "Store health check failed");
                let health = ComponentHealth::new(
                    Component::Store,
                    HealthStatus::Unhealthy,
                    format!("{} store query failed: {}", backend, e),
                )
                .with_response_time(elapsed)
                .with_details(json!({ "backend": backend, "error": e.to_string() }));
                (health, None)
            }
            None => (self.timed_out(Component::Store, elapsed), None),
        }
    }

    /// Opens and closes one context to prove the runtime can serve jobs.
    async fn check_runtime(&self) -> ComponentHealth {
        let provider = &self.deps.contexts;
        let started = Instant::now();
        let result = self
            .timed(provider.create(HEALTH_CHECK_WORKER, 0))
            .await;
        let elapsed = started.elapsed();

        match result {
            Some(Ok(mut context)) => {
                provider.close(&mut context);
                ComponentHealth::new(
                    Component::Runtime,
                    self.latency_status(elapsed),
                    format!(
                        "{} runtime opened a context in {:.1}ms",
                        provider.name(),
                        elapsed.as_secs_f64() * 1000.0
                    ),
                )
                .with_response_time(elapsed)
                .with_details(json!({
                    "provider": provider.name(),
                    "open_contexts": provider.open_contexts(),
                }))
            }
            Some(Err(e)) => {
                warn!(provider = provider.name(), error = %e, "Runtime health check failed");
                ComponentHealth::new(
                    Component::Runtime,
                    HealthStatus::Unhealthy,
                    format!("{} runtime could not open a context: {}", provider.name(), e),
                )
                .with_response_time(elapsed)
                .with_details(json!({ "provider": provider.name(), "error": e.to_string() }))
            }
            None => self.timed_out(Component::Runtime, elapsed),
        }
    }

    async fn timed<F: Future>(&self, check: F) -> Option<F::Output> {
        tokio::time::timeout(self.config.check_timeout, check).await.ok()
    }

    fn latency_status(&self, elapsed: Duration) -> HealthStatus {
        HealthStatus::from_latency(
            elapsed,
            self.config.degraded_latency,
            self.config.unhealthy_latency,
        )
    }

    fn timed_out(&self, component: Component, elapsed: Duration) -> ComponentHealth {
        warn!(component = %component, timeout = ?self.config.check_timeout, "Health check timed out");
        ComponentHealth::new(
            component,
            HealthStatus::Unhealthy,
            format!("Check timed out after {:?}", self.config.check_timeout),
        )
        .with_response_time(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(failures: u32, contexts: usize) -> WorkerStatus {
        WorkerStatus {
            worker_id: "w".to_string(),
            alive: true,
            busy: false,
            current_job: None,
            consecutive_failures: failures,
            jobs_processed: 0,
            jobs_since_restart: 0,
            runtime_generation: 0,
            active_contexts: contexts,
            efficiency_score: 100.0,
        }
    }

    #[test]
    fn test_perfect_score() {
        let workers = vec![worker(0, 0)];
        let score = health_score(&ScoreInputs {
            workers: &workers,
            checks_passing: 6,
            checks_total: 6,
            ..Default::default()
        });
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_pool_scores_zero_for_workers() {
        let score = health_score(&ScoreInputs::default());
        let expected = ((70.0 * 0.8 + 20.0) * 0.75 + 25.0) * 0.75 + 25.0;
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_score_penalties() {
        // Worker: 100 - 30 - 10 = 60. Queue 60: 100 - 20 = 80. Errors 12: 60.
        // Checks 3/6: 50.
        let workers = vec![worker(3, 7)];
        let score = health_score(&ScoreInputs {
            workers: &workers,
            queued: 60,
            new_errors: 12,
            checks_passing: 3,
            checks_total: 6,
        });
        let mut expected = 100.0 * 0.7 + 60.0 * 0.3;
        expected = expected * 0.8 + 80.0 * 0.2;
        expected = expected * 0.75 + 60.0 * 0.25;
        expected = expected * 0.75 + 50.0 * 0.25;
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_error_bands() {
        let workers = vec![worker(0, 0)];
        let with_errors = |n| {
            health_score(&ScoreInputs {
                workers: &workers,
                new_errors: n,
                ..Default::default()
            })
        };
        assert!(with_errors(0) > with_errors(3));
        assert!(with_errors(3) > with_errors(7));
        assert!(with_errors(7) > with_errors(11));
        assert_eq!(with_errors(30), with_errors(40));
    }
}
