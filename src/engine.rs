//! The engine context object.
//!
//! [`EngineBuilder`] constructs every component once, wires them together by
//! constructor injection (the worker pool holds the breaker and fallback
//! managers, never the other way round) and hands back an [`Engine`] that
//! exposes the operational surface: job submission and inspection, dead-letter
//! handling, breaker and fallback administration, health and alerts, and
//! metrics export.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig, ServicePolicies};
use crate::error::{ErrorHandler, ErrorHandlerConfig, ErrorStats};
use crate::health::{
    Alert, AlertManager, AlertNotifier, AlertRule, AlertSummary, HealthConfig, HealthDeps,
    HealthMonitor, Liveness, Readiness, SystemHealth,
};
use crate::metrics::{EngineMetrics, MetricsCollector};
use crate::resilience::{
    BreakerMetrics, BreakerSummary, CircuitBreakerManager, FallbackManager,
    FallbackManagerConfig, FallbackMetrics, HealthSummary, ServiceLevel,
};
use crate::resources::{
    AdaptiveController, ConcurrencyThrottler, ControllerConfig, ControllerStats,
    ResourceMonitor, ResourceSampler, ServiceStatus, SystemSampler,
};
use crate::scheduler::{
    CancellationRegistry, ContextProvider, DeadLetterEntry, DlqStats, JobManager, JobRecord,
    JobStore, JobView, LocalContextProvider, ManagerConfig, ManagerError, ManagerStats, NewJob,
    PoolDeps, PoolError, PoolStats, QueueStats, StoreError, WorkerPool, WorkerPoolConfig,
};
use crate::tasks::{Task, TaskRegistry};

/// How long `shutdown` waits for the background loops after the pool stopped.
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Engine is already running")]
    AlreadyRunning,
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    policies: Option<ServicePolicies>,
    tasks: TaskRegistry,
    sampler: Option<Arc<dyn ResourceSampler>>,
    contexts: Option<Arc<dyn ContextProvider>>,
    pool_config: Option<WorkerPoolConfig>,
    poll_interval: Option<Duration>,
    metrics_enabled: bool,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            policies: None,
            tasks: TaskRegistry::with_builtin_tasks(),
            sampler: None,
            contexts: None,
            pool_config: None,
            poll_interval: None,
            metrics_enabled: true,
        }
    }

    /// Uses these policies instead of the configured policies file.
    pub fn with_policies(mut self, policies: ServicePolicies) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Registers a task next to the builtin ones.
    pub fn with_task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.register(task);
        self
    }

    /// Replaces the whole task registry.
    pub fn with_tasks(mut self, tasks: TaskRegistry) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.contexts = Some(provider);
        self
    }

    /// Overrides the pool settings derived from `EngineConfig`.
    pub fn with_pool_config(mut self, config: WorkerPoolConfig) -> Self {
        self.pool_config = Some(config);
        self
    }

    /// How often idle workers poll the store between wake-ups.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn without_metrics(mut self) -> Self {
        self.metrics_enabled = false;
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;
        let policies = match self.policies {
            Some(policies) => {
                policies.validate()?;
                policies
            }
            None => config.load_policies()?,
        };

        let metrics = if self.metrics_enabled {
            MetricsCollector::new(Arc::new(EngineMetrics::new()?))
        } else {
            MetricsCollector::disabled()
        };

        let mut store = JobStore::connect(&config.database_url).await?;
        if let Some(interval) = self.poll_interval {
            store = store.with_poll_interval(interval);
        }
        let store = Arc::new(store);

        let breakers = Arc::new(CircuitBreakerManager::new(
            policies.default_breaker.clone(),
            metrics.clone(),
        ));
        let fallback = Arc::new(FallbackManager::new(
            FallbackManagerConfig::default(),
            Arc::clone(&breakers),
            metrics.clone(),
        ));
        let throttler = Arc::new(ConcurrencyThrottler::new(metrics.clone()));
        for (service, policy) in &policies.services {
            if let Some(breaker) = &policy.breaker {
                breakers.configure(service.clone(), breaker.clone());
            }
            if let Some(strategy) = &policy.fallback {
                fallback.register_fallback(service.clone(), strategy.clone());
            }
            if let Some(limit) = &policy.throttle {
                throttler.add_service_limit(service.clone(), limit.clone());
            }
        }

        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SystemSampler::new()) as Arc<dyn ResourceSampler>);
        let monitor = Arc::new(ResourceMonitor::new(sampler, metrics.clone()));
        let controller = Arc::new(AdaptiveController::new(
            monitor,
            ControllerConfig {
                cooldown: config.scaling_cooldown,
                max_workers: config.max_workers,
            },
            metrics.clone(),
        ));

        let errors = Arc::new(ErrorHandler::new(
            ErrorHandlerConfig::default(),
            metrics.clone(),
        ));
        let tasks = Arc::new(self.tasks);
        let cancellations = Arc::new(CancellationRegistry::new());
        let manager = Arc::new(JobManager::new(
            Arc::clone(&store),
            Arc::clone(&tasks),
            Arc::clone(&cancellations),
            ManagerConfig::from(&config),
            metrics.clone(),
        ));

        let contexts = self.contexts.unwrap_or_else(|| {
            let local = LocalContextProvider::new().with_base_dir(config.data_root.join(".contexts"));
            Arc::new(local) as Arc<dyn ContextProvider>
        });
        let health_contexts = Arc::clone(&contexts);
        let pool_config = self
            .pool_config
            .unwrap_or_else(|| WorkerPoolConfig::from(&config));
        let pool = Arc::new(WorkerPool::new(
            pool_config,
            PoolDeps {
                store: Arc::clone(&store),
                tasks: Arc::clone(&tasks),
                cancellations,
                fallback: Arc::clone(&fallback),
                throttler: Arc::clone(&throttler),
                errors: Arc::clone(&errors),
                contexts,
                controller: Arc::clone(&controller),
                metrics: metrics.clone(),
            },
        ));

        let health = Arc::new(HealthMonitor::new(
            HealthDeps {
                store: Arc::clone(&store),
                pool: Arc::clone(&pool),
                breakers: Arc::clone(&breakers),
                fallback: Arc::clone(&fallback),
                controller: Arc::clone(&controller),
                errors: Arc::clone(&errors),
                contexts: health_contexts,
            },
            HealthConfig {
                interval: config.monitor_interval,
                ..HealthConfig::default()
            },
            AlertManager::with_default_rules(metrics.clone()),
            metrics.clone(),
        ));

        info!(
            backend = store.backend_name(),
            tasks = ?tasks.names(),
            services = policies.services.len(),
            "Engine initialized"
        );

        Ok(Engine {
            config,
            store,
            tasks,
            manager,
            pool,
            breakers,
            fallback,
            throttler,
            controller,
            errors,
            health,
            metrics,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }
}

/// Aggregate view used by the `stats` command.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub jobs: ManagerStats,
    pub dead_letter: DlqStats,
    pub pool: PoolStats,
    pub breakers: BreakerSummary,
    pub service_level: ServiceLevel,
    pub errors: ErrorStats,
    pub resources: ControllerStats,
    pub alerts: AlertSummary,
}

/// One running job execution engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<JobStore>,
    tasks: Arc<TaskRegistry>,
    manager: Arc<JobManager>,
    pool: Arc<WorkerPool>,
    breakers: Arc<CircuitBreakerManager>,
    fallback: Arc<FallbackManager>,
    throttler: Arc<ConcurrencyThrottler>,
    controller: Arc<AdaptiveController>,
    errors: Arc<ErrorHandler>,
    health: Arc<HealthMonitor>,
    metrics: MetricsCollector,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Recovers jobs orphaned by a previous process, then starts the workers,
    /// the reconciler, the fallback health monitor and the engine health loop.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        self.store.recover_running().await?;

        self.pool.start()?;

        let mut background = self.background.lock();
        background.push(tokio::spawn(
            Arc::clone(&self.manager).run_reconciler(self.shutdown.child_token()),
        ));
        background.push(tokio::spawn(
            Arc::clone(&self.fallback).run_health_monitor(self.shutdown.child_token()),
        ));
        background.push(tokio::spawn(
            Arc::clone(&self.health).run(self.shutdown.child_token()),
        ));

        info!(
            workers = self.pool.num_workers(),
            database = %self.config.database_url,
            "Engine started"
        );
        Ok(())
    }

    /// Stops the workers and background loops.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down engine");
        self.shutdown.cancel();

        let pool_result = self.pool.shutdown().await;

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        let wait_all = async {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, wait_all)
            .await
            .is_err()
        {
            warn!("Background tasks did not stop in time");
        }

        pool_result?;
        info!("Engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// A job for `task` carrying the configured default timeout and retries.
    pub fn new_job(&self, task: impl Into<String>) -> NewJob {
        NewJob::new(task)
            .with_timeout_seconds(self.config.default_timeout_secs)
            .with_max_retries(self.config.default_max_retries)
    }

    // Jobs

    pub async fn submit_job(&self, job: NewJob) -> Result<Uuid, EngineError> {
        Ok(self.manager.submit_job(job).await?)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobView, EngineError> {
        Ok(self.manager.get_job_status(job_id).await?)
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.manager.cancel_job(job_id).await?)
    }

    pub async fn list_dead_letter(
        &self,
        start: usize,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        Ok(self.manager.list_dead_letter(start, count).await?)
    }

    pub async fn replay_dead_letter(
        &self,
        job_id: Uuid,
        reset_retries: bool,
    ) -> Result<JobRecord, EngineError> {
        Ok(self.manager.replay_dead_letter(job_id, reset_retries).await?)
    }

    pub async fn dlq_stats(&self) -> Result<DlqStats, EngineError> {
        Ok(self.manager.dlq_stats().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, EngineError> {
        Ok(self.manager.queue_stats().await?)
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            jobs: self.manager.get_stats().await?,
            dead_letter: self.manager.dlq_stats().await?,
            pool: self.pool.stats(),
            breakers: self.breakers.summary(),
            service_level: self.fallback.service_level(),
            errors: self.errors.error_stats(),
            resources: self.controller.stats(),
            alerts: self.health.alerts().summary(),
        })
    }

    // Circuit breakers

    pub fn breaker_metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.breakers.all_metrics()
    }

    pub fn breaker_summary(&self) -> BreakerSummary {
        self.breakers.summary()
    }

    /// Forces one breaker closed; false when no breaker has that name.
    pub fn reset_breaker(&self, name: &str) -> bool {
        self.breakers.reset(name)
    }

    pub fn reset_all_breakers(&self) {
        self.breakers.reset_all();
    }

    // Fallbacks

    pub fn fallback_health_summary(&self) -> HealthSummary {
        self.fallback.health_summary()
    }

    pub fn fallback_metrics(&self) -> FallbackMetrics {
        self.fallback.fallback_metrics()
    }

    pub fn service_level(&self) -> ServiceLevel {
        self.fallback.service_level()
    }

    pub fn update_service_cache(&self, service: &str, data: Value) {
        self.fallback.update_cache(service, data);
    }

    // Resources

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn throttle_status(&self, service: &str) -> Option<ServiceStatus> {
        self.throttler.service_status(service)
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.errors.error_stats()
    }

    // Health and alerts

    pub fn liveness(&self) -> Liveness {
        self.health.liveness()
    }

    /// Component checks and traffic readiness, without scoring or alerting.
    pub async fn readiness(&self) -> Readiness {
        self.health.readiness().await
    }

    /// Full assessment: readiness, health score and alert evaluation.
    pub async fn health_check(&self) -> SystemHealth {
        self.health.assess().await
    }

    /// The assessment made by the last health loop tick or `health_check`.
    pub fn last_health(&self) -> Option<SystemHealth> {
        self.health.last()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.health.alerts().active_alerts()
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.health.alerts().history(limit)
    }

    pub fn alert_summary(&self) -> AlertSummary {
        self.health.alerts().summary()
    }

    pub fn add_alert_rule(&self, rule: AlertRule) {
        self.health.alerts().add_rule(rule);
    }

    pub fn remove_alert_rule(&self, name: &str) -> bool {
        self.health.alerts().remove_rule(name)
    }

    pub fn add_alert_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        self.health.alerts().add_notifier(notifier);
    }

    /// Prometheus text exposition of every engine metric.
    pub fn export_metrics(&self) -> String {
        self.metrics.export()
    }
}
