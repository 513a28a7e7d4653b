//! Worker pool executing jobs from the job store.
//!
//! Each worker is an independent async task that claims jobs from the
//! [`JobStore`], runs them inside an execution context through the circuit
//! breaker / fallback layer, and persists the outcome. A supervisor respawns
//! workers that die unexpectedly and an autoscaler grows or shrinks the pool
//! from resource snapshots.
//!
//! # Features
//!
//! - Per-job cancellation tokens, deadlines and heartbeats
//! - Error classification with recovery strategies
//! - Runtime restarts after crashes, failure streaks or a job quota
//! - Graceful shutdown with a timeout
//! - Pool statistics tracking

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::context::{ContextPool, ContextProvider};
use super::job::JobRecord;
use super::manager::CancellationRegistry;
use super::store::{JobFailure, JobStore, StoreError};
use crate::config::EngineConfig;
use crate::error::{ErrorContext, ErrorHandler, RecoveryStrategy, TaskError};
use crate::metrics::MetricsCollector;
use crate::resilience::{FallbackExecution, FallbackManager};
use crate::resources::{
    efficiency_score, AdaptiveController, ConcurrencyThrottler, LoadInputs, ScalingAction,
    WorkerLoad,
};
use crate::tasks::{Task, TaskInvocation, TaskRegistry};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// A pool that was shut down cannot be started again.
    #[error("Pool has been shut down")]
    ShutDown,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers spawned by `start`.
    pub num_workers: usize,
    /// Upper bound for scale-up.
    pub max_workers: usize,
    pub max_contexts_per_worker: usize,
    /// Per-job output directories live under `data_root/<task>/<job_id>`.
    pub data_root: PathBuf,
    pub heartbeat_interval: Duration,
    /// How often the supervisor looks for dead workers.
    pub health_check_interval: Duration,
    /// How often the autoscaler samples resources.
    pub monitor_interval: Duration,
    pub autoscale: bool,
    /// Failure streak after which a worker restarts its runtime.
    pub max_consecutive_failures: u32,
    /// Jobs after which a worker restarts its runtime.
    pub max_jobs_per_runtime: u64,
    /// How long a worker pauses after a `ReduceLoad` recovery.
    pub reduce_load_pause: Duration,
    /// How long the pool stops claiming work after a `Throttle` decision.
    pub throttle_pause: Duration,
    /// Pause after a failed dequeue.
    pub error_backoff: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            max_workers: 4,
            max_contexts_per_worker: 3,
            data_root: PathBuf::from("./job-data"),
            heartbeat_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(30),
            autoscale: true,
            max_consecutive_failures: 5,
            max_jobs_per_runtime: 100,
            reduce_load_pause: Duration::from_secs(30),
            throttle_pause: Duration::from_secs(10),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the given number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            max_workers: num_workers.max(Self::default().max_workers),
            ..Default::default()
        }
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_max_contexts_per_worker(mut self, max: usize) -> Self {
        self.max_contexts_per_worker = max;
        self
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_autoscale(mut self, enabled: bool, interval: Duration) -> Self {
        self.autoscale = enabled;
        self.monitor_interval = interval;
        self
    }

    /// Sets when a worker restarts its runtime.
    pub fn with_runtime_limits(mut self, max_failures: u32, max_jobs: u64) -> Self {
        self.max_consecutive_failures = max_failures;
        self.max_jobs_per_runtime = max_jobs;
        self
    }

    pub fn with_pauses(mut self, reduce_load: Duration, throttle: Duration) -> Self {
        self.reduce_load_pause = reduce_load;
        self.throttle_pause = throttle;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl From<&EngineConfig> for WorkerPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            max_workers: config.max_workers,
            max_contexts_per_worker: config.max_contexts_per_worker,
            data_root: config.data_root.clone(),
            heartbeat_interval: config.heartbeat_interval,
            monitor_interval: config.monitor_interval,
            autoscale: config.autoscale,
            ..Default::default()
        }
    }
}

/// Shared services every worker needs.
#[derive(Clone)]
pub struct PoolDeps {
    pub store: Arc<JobStore>,
    pub tasks: Arc<TaskRegistry>,
    pub cancellations: Arc<CancellationRegistry>,
    pub fallback: Arc<FallbackManager>,
    pub throttler: Arc<ConcurrencyThrottler>,
    pub errors: Arc<ErrorHandler>,
    pub contexts: Arc<dyn ContextProvider>,
    pub controller: Arc<AdaptiveController>,
    pub metrics: MetricsCollector,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently running a job.
    pub busy_workers: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub average_job_duration_ms: u64,
    pub workers: Vec<WorkerStatus>,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_cancelled
    }

    /// Percentage of processed jobs that finished successfully.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            0.0
        } else {
            (self.jobs_completed as f64 / total as f64) * 100.0
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub alive: bool,
    pub busy: bool,
    pub current_job: Option<Uuid>,
    pub consecutive_failures: u32,
    pub jobs_processed: u64,
    pub jobs_since_restart: u64,
    pub runtime_generation: u64,
    pub active_contexts: usize,
    pub efficiency_score: f64,
}

/// Internal shared statistics using atomics for thread-safety.
#[derive(Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn record_cancelled(&self, duration: Duration) {
        self.jobs_cancelled.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn add_duration(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.total_duration_ms.fetch_add(ms, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, workers: Vec<WorkerStatus>) -> PoolStats {
        let jobs_completed = self.jobs_completed.load(Ordering::SeqCst);
        let jobs_failed = self.jobs_failed.load(Ordering::SeqCst);
        let jobs_cancelled = self.jobs_cancelled.load(Ordering::SeqCst);
        let total = jobs_completed + jobs_failed + jobs_cancelled;
        let average_job_duration_ms = if total == 0 {
            0
        } else {
            self.total_duration_ms.load(Ordering::SeqCst) / total
        };

        PoolStats {
            num_workers: workers.len(),
            busy_workers: workers.iter().filter(|w| w.busy).count(),
            jobs_completed,
            jobs_failed,
            jobs_cancelled,
            average_job_duration_ms,
            workers,
        }
    }
}

/// Mutable state of one worker, shared with the pool for scoring and stats.
struct WorkerState {
    busy: AtomicBool,
    current_job: Mutex<Option<Uuid>>,
    consecutive_failures: AtomicU32,
    jobs_processed: AtomicU64,
    jobs_since_restart: AtomicU64,
    last_completion: Mutex<Option<Instant>>,
    paused_until: Mutex<Option<Instant>>,
    contexts: ContextPool,
}

impl WorkerState {
    fn new(contexts: ContextPool) -> Self {
        Self {
            busy: AtomicBool::new(false),
            current_job: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            jobs_processed: AtomicU64::new(0),
            jobs_since_restart: AtomicU64::new(0),
            last_completion: Mutex::new(None),
            paused_until: Mutex::new(None),
            contexts,
        }
    }

    fn load(&self) -> WorkerLoad {
        WorkerLoad {
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            active_contexts: self.contexts.active_contexts(),
            since_last_completion: self.last_completion.lock().map(|at| at.elapsed()),
        }
    }

    fn status(&self, worker_id: &str, alive: bool) -> WorkerStatus {
        WorkerStatus {
            worker_id: worker_id.to_string(),
            alive,
            busy: self.busy.load(Ordering::SeqCst),
            current_job: *self.current_job.lock(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            jobs_processed: self.jobs_processed.load(Ordering::SeqCst),
            jobs_since_restart: self.jobs_since_restart.load(Ordering::SeqCst),
            runtime_generation: self.contexts.generation(),
            active_contexts: self.contexts.active_contexts(),
            efficiency_score: efficiency_score(&self.load()),
        }
    }
}

struct WorkerSlot {
    id: String,
    state: Arc<WorkerState>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Pool of workers that process jobs from the job store.
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    deps: PoolDeps,
    workers: Mutex<Vec<WorkerSlot>>,
    next_index: AtomicUsize,
    shutdown: CancellationToken,
    /// Pool-wide pause set by a `Throttle` decision.
    dequeue_paused_until: Arc<Mutex<Option<Instant>>>,
    stats: Arc<SharedPoolStats>,
    /// Supervisor, autoscaler and retired workers; awaited on shutdown.
    background: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, deps: PoolDeps) -> Self {
        Self {
            config: Arc::new(config),
            deps,
            workers: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(1),
            shutdown: CancellationToken::new(),
            dequeue_paused_until: Arc::new(Mutex::new(None)),
            stats: Arc::new(SharedPoolStats::default()),
            background: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Spawns the configured workers plus the supervisor and autoscaler loops.
    pub fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShutDown);
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        info!(
            num_workers = self.config.num_workers,
            max_workers = self.config.max_workers,
            autoscale = self.config.autoscale,
            "Starting worker pool"
        );

        for _ in 0..self.config.num_workers {
            self.spawn_worker();
        }

        let mut background = self.background.lock();
        background.push(tokio::spawn(Arc::clone(self).run_supervisor()));
        if self.config.autoscale {
            background.push(tokio::spawn(Arc::clone(self).run_autoscaler()));
        }
        Ok(())
    }

    /// Stops every worker and waits for in-flight jobs to settle.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.shutdown.cancel();

        let mut handles: Vec<JoinHandle<()>> =
            self.workers.lock().drain(..).map(|slot| slot.handle).collect();
        handles.extend(self.background.lock().drain(..));
        self.deps.metrics.set_active_workers(0);

        let wait_all = async {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "Worker task ended abnormally");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, wait_all).await {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                error!(
                    timeout = ?self.config.shutdown_timeout,
                    "Worker pool shutdown timed out"
                );
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Adds one worker unless the pool is at `max_workers`.
    pub fn add_worker(&self) -> Option<String> {
        if self.num_workers() >= self.config.max_workers {
            debug!(max_workers = self.config.max_workers, "Pool already at maximum size");
            return None;
        }
        Some(self.spawn_worker())
    }

    /// Stops the worker with the lowest efficiency score, keeping at least one.
    ///
    /// The stopped worker finishes its current job before exiting.
    pub fn remove_least_efficient(&self) -> Option<String> {
        let mut workers = self.workers.lock();
        if workers.len() <= 1 {
            return None;
        }

        let (index, score) = workers
            .iter()
            .enumerate()
            .map(|(i, slot)| (i, efficiency_score(&slot.state.load())))
            .min_by(|a, b| a.1.total_cmp(&b.1))?;

        let slot = workers.remove(index);
        slot.stop.cancel();
        self.deps.metrics.set_active_workers(workers.len());
        info!(worker_id = %slot.id, score, "Stopping least efficient worker");

        let mut background = self.background.lock();
        background.retain(|handle| !handle.is_finished());
        background.push(slot.handle);
        Some(slot.id)
    }

    /// Stops every worker from claiming new jobs for `duration`.
    pub fn pause_dequeue(&self, duration: Duration) {
        let until = Instant::now() + duration;
        *self.dequeue_paused_until.lock() = Some(until);
        warn!(pause_secs = duration.as_secs_f64(), "Pausing job intake");
    }

    /// Respawns workers that exited without being asked to; returns how many.
    ///
    /// The dead worker's runtime is restarted before its replacement launches.
    pub async fn supervise_once(&self) -> usize {
        let crashed: Vec<(String, Arc<WorkerState>)> = self
            .workers
            .lock()
            .iter()
            .filter(|slot| slot.handle.is_finished() && !slot.stop.is_cancelled())
            .map(|slot| (slot.id.clone(), Arc::clone(&slot.state)))
            .collect();

        for (id, state) in &crashed {
            warn!(worker_id = %id, "Worker exited unexpectedly, restarting");
            state.busy.store(false, Ordering::SeqCst);
            *state.current_job.lock() = None;
            state.contexts.restart_runtime("worker restarted").await;
        }

        let mut restarted = 0;
        let mut workers = self.workers.lock();
        for slot in workers.iter_mut() {
            let was_crashed = crashed.iter().any(|(id, _)| *id == slot.id);
            if !was_crashed || !slot.handle.is_finished() || slot.stop.is_cancelled() {
                continue;
            }
            slot.handle = self.launch(&slot.id, &slot.state, &slot.stop);
            restarted += 1;
        }
        self.deps.metrics.set_active_workers(workers.len());
        restarted
    }

    /// Samples resources and applies one scaling decision.
    pub async fn autoscale_once(&self) -> Result<ScalingAction, PoolError> {
        let queue_depth = self.deps.store.queue_stats().await?.queued;
        let (active_workers, active_contexts) = {
            let workers = self.workers.lock();
            let contexts = workers
                .iter()
                .map(|slot| slot.state.contexts.active_contexts())
                .sum();
            (workers.len(), contexts)
        };

        let snapshot = self.deps.controller.monitor().sample(LoadInputs {
            queue_depth,
            active_workers,
            active_contexts,
        });
        let action = self.deps.controller.decide(&snapshot);
        match action {
            ScalingAction::ScaleUp => {
                self.add_worker();
            }
            ScalingAction::ScaleDown => {
                self.remove_least_efficient();
            }
            ScalingAction::Throttle => self.pause_dequeue(self.config.throttle_pause),
            ScalingAction::Maintain => {}
        }
        Ok(action)
    }

    pub fn stats(&self) -> PoolStats {
        let workers = self
            .workers
            .lock()
            .iter()
            .map(|slot| slot.state.status(&slot.id, !slot.handle.is_finished()))
            .collect();
        self.stats.to_pool_stats(workers)
    }

    fn spawn_worker(&self) -> String {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let id = format!("worker-{}", index);
        let state = Arc::new(WorkerState::new(ContextPool::new(
            id.clone(),
            Arc::clone(&self.deps.contexts),
            self.config.max_contexts_per_worker,
        )));
        let stop = self.shutdown.child_token();
        let handle = self.launch(&id, &state, &stop);

        let mut workers = self.workers.lock();
        workers.push(WorkerSlot {
            id: id.clone(),
            state,
            stop,
            handle,
        });
        self.deps.metrics.set_active_workers(workers.len());
        debug!(worker_id = %id, "Spawned worker");
        id
    }

    fn launch(
        &self,
        id: &str,
        state: &Arc<WorkerState>,
        stop: &CancellationToken,
    ) -> JoinHandle<()> {
        let worker = Worker {
            id: id.to_string(),
            state: Arc::clone(state),
            deps: self.deps.clone(),
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            dequeue_paused_until: Arc::clone(&self.dequeue_paused_until),
            stop: stop.clone(),
        };
        tokio::spawn(worker.run())
    }

    async fn run_supervisor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let restarted = self.supervise_once().await;
                    if restarted > 0 {
                        info!(restarted, "Supervisor restarted workers");
                    }
                }
            }
        }
    }

    async fn run_autoscaler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.autoscale_once().await {
                        warn!(error = %e, "Autoscaling pass failed");
                    }
                }
            }
        }
    }
}

/// How a single attempt ended.
#[derive(Debug)]
enum Outcome {
    Succeeded { data: Value, degraded: bool },
    Failed(TaskError),
    Cancelled,
}

impl Outcome {
    fn from_execution(execution: FallbackExecution) -> Self {
        if !execution.success {
            let err = execution.primary_error.unwrap_or_else(|| {
                TaskError::network(
                    execution
                        .error
                        .unwrap_or_else(|| "fallback produced no result".to_string()),
                )
            });
            return Outcome::Failed(err);
        }

        let data = execution.data.unwrap_or(Value::Null);
        if execution.is_degraded {
            Outcome::Succeeded {
                data: json!({
                    "degraded": true,
                    "strategy": execution.strategy_used.map(|s| s.as_str()),
                    "data": data,
                }),
                degraded: true,
            }
        } else {
            Outcome::Succeeded {
                data,
                degraded: false,
            }
        }
    }
}

/// Busy bookkeeping for the job a worker is running; undone on drop.
struct ActiveJob {
    job_id: Uuid,
    state: Arc<WorkerState>,
    cancellations: Arc<CancellationRegistry>,
    metrics: MetricsCollector,
}

impl ActiveJob {
    fn enter(worker: &Worker, job_id: Uuid) -> Self {
        worker.state.busy.store(true, Ordering::SeqCst);
        *worker.state.current_job.lock() = Some(job_id);
        worker.deps.metrics.inc_busy_workers();
        Self {
            job_id,
            state: Arc::clone(&worker.state),
            cancellations: Arc::clone(&worker.deps.cancellations),
            metrics: worker.deps.metrics.clone(),
        }
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.cancellations.unregister(self.job_id);
        self.state.busy.store(false, Ordering::SeqCst);
        *self.state.current_job.lock() = None;
        self.metrics.dec_busy_workers();
    }
}

struct Worker {
    id: String,
    state: Arc<WorkerState>,
    deps: PoolDeps,
    config: Arc<WorkerPoolConfig>,
    stats: Arc<SharedPoolStats>,
    dequeue_paused_until: Arc<Mutex<Option<Instant>>>,
    stop: CancellationToken,
}

impl Worker {
    async fn run(self) {
        info!(worker_id = %self.id, "Worker started");

        while self.wait_while_paused().await {
            match self.deps.store.dequeue(&self.id, &self.stop).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Returns false once the worker should stop.
    async fn wait_while_paused(&self) -> bool {
        loop {
            if self.stop.is_cancelled() {
                return false;
            }
            let pool_pause = *self.dequeue_paused_until.lock();
            let own_pause = *self.state.paused_until.lock();
            match pool_pause.max(own_pause) {
                Some(until) if until > Instant::now() => {
                    debug!(worker_id = %self.id, "Worker paused");
                    tokio::select! {
                        _ = self.stop.cancelled() => return false,
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                _ => return true,
            }
        }
    }

    async fn process_job(&self, job: JobRecord) {
        let started = Instant::now();

        if job.cancel_requested {
            info!(worker_id = %self.id, job_id = %job.job_id, "Job cancelled before it started");
            self.persist_cancelled(&job).await;
            self.stats.record_cancelled(Duration::ZERO);
            self.deps.metrics.record_job(&job.task_name, "cancelled", None);
            return;
        }

        let Some(task) = self.deps.tasks.get(&job.task_name) else {
            let err = TaskError::unknown(format!("task '{}' is not registered", job.task_name));
            error!(worker_id = %self.id, job_id = %job.job_id, "{}", err.message);
            self.persist_failure(&job, &err, false).await;
            self.stats.record_failure(Duration::ZERO);
            self.deps.metrics.record_job(&job.task_name, "failed", None);
            return;
        };

        let cancel = self.deps.cancellations.register(job.job_id);
        let _active = ActiveJob::enter(self, job.job_id);
        let heartbeat = self.spawn_heartbeat(job.job_id, cancel.clone());

        let span = info_span!(
            "job",
            job_id = %job.job_id,
            task = %job.task_name,
            worker_id = %self.id,
            attempt = job.retry_count + 1
        );
        let outcome = self
            .execute(&job, task.as_ref(), &cancel)
            .instrument(span.clone())
            .await;
        drop(heartbeat);

        self.finish(&job, task.target(), outcome, started.elapsed())
            .instrument(span)
            .await;
    }

    /// Refreshes the job's heartbeat until the returned guard drops.
    ///
    /// Losing ownership of the job cancels `cancel`.
    fn spawn_heartbeat(&self, job_id: Uuid, cancel: CancellationToken) -> DropGuard {
        let stop = CancellationToken::new();
        let guard = stop.clone().drop_guard();
        let store = Arc::clone(&self.deps.store);
        let worker_id = self.id.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => match store.heartbeat(job_id, &worker_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id = %job_id, worker_id = %worker_id, "Lost ownership of job, cancelling");
                            cancel.cancel();
                            break;
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        });
        guard
    }

    fn output_dir(&self, job: &JobRecord) -> PathBuf {
        self.config
            .data_root
            .join(&job.task_name)
            .join(job.job_id.to_string())
    }

    async fn execute(&self, job: &JobRecord, task: &dyn Task, cancel: &CancellationToken) -> Outcome {
        let output_dir = self.output_dir(job);
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            return Outcome::Failed(TaskError::resource(format!(
                "cannot create output directory {}: {}",
                output_dir.display(),
                e
            )));
        }
        append_job_log(
            &output_dir,
            &format!(
                "attempt {} started on {} (timeout {}s)",
                job.retry_count + 1,
                self.id,
                job.timeout_seconds
            ),
        )
        .await;

        let lease = match self.state.contexts.acquire().await {
            Ok(lease) => lease,
            Err(e) => return Outcome::Failed(TaskError::resource(e.to_string())),
        };
        debug!(
            context_id = %lease.context().id(),
            output_dir = %output_dir.display(),
            "Running task"
        );

        let target = task.target();
        let timeout = Duration::from_secs(job.timeout_seconds);
        let request = json!({
            "task_name": job.task_name,
            "params": job.params,
            "worker_id": self.id,
            "job_id": job.job_id,
        });
        let invocation = TaskInvocation {
            job_id: job.job_id,
            params: &job.params,
            context: lease.context(),
            output_dir: &output_dir,
            attempt: job.retry_count + 1,
        };
        let run = async {
            let _slot = self.deps.throttler.wait_for_slot(target).await;
            let invocation = &invocation;
            // The job's own timeout bounds the call, not the breaker's default.
            self.deps
                .fallback
                .execute_with_fallback_within(target, timeout, || task.run(invocation), Some(&request))
                .await
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(timeout, run) => match result {
                Ok(execution) => Outcome::from_execution(execution),
                Err(_) => Outcome::Failed(TaskError::timeout(format!(
                    "job exceeded its {}s timeout",
                    job.timeout_seconds
                ))),
            },
        };

        lease.release();
        outcome
    }

    async fn finish(&self, job: &JobRecord, target: &str, outcome: Outcome, duration: Duration) {
        let secs = duration.as_secs_f64();
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        let summary = match &outcome {
            Outcome::Succeeded { degraded: true, .. } => "finished (degraded)".to_string(),
            Outcome::Succeeded { .. } => "finished".to_string(),
            Outcome::Cancelled => "cancelled".to_string(),
            Outcome::Failed(err) => format!("failed [{}]: {}", err.kind.as_str(), err.message),
        };
        append_job_log(
            &self.output_dir(job),
            &format!("attempt {} {} after {}ms", job.retry_count + 1, summary, duration_ms),
        )
        .await;

        let strategy = match outcome {
            Outcome::Succeeded { data, degraded } => {
                if !degraded {
                    self.deps.fallback.update_cache(target, data.clone());
                }
                match self.deps.store.mark_finished(job.job_id, &self.id, data).await {
                    Ok(_) => info!(duration_ms, degraded, "Job finished"),
                    Err(e) => warn!(error = %e, "Could not record job result"),
                }
                self.stats.record_completion(duration);
                self.state.consecutive_failures.store(0, Ordering::SeqCst);
                *self.state.last_completion.lock() = Some(Instant::now());
                self.deps.controller.monitor().record_completion();
                self.deps.metrics.record_job(&job.task_name, "finished", Some(secs));
                None
            }
            Outcome::Cancelled => {
                info!(duration_ms, "Job cancelled");
                self.persist_cancelled(job).await;
                self.stats.record_cancelled(duration);
                self.deps.metrics.record_job(&job.task_name, "cancelled", Some(secs));
                None
            }
            Outcome::Failed(err) => {
                let ctx = ErrorContext {
                    job_id: job.job_id,
                    task_name: job.task_name.clone(),
                    worker_id: self.id.clone(),
                    attempt: job.retry_count + 1,
                    max_attempts: job.max_retries + 1,
                };
                let strategy = self.deps.errors.handle(&err, &ctx);
                self.persist_failure(job, &err, strategy.is_retryable()).await;
                self.stats.record_failure(duration);
                self.state.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                self.deps.metrics.record_job(&job.task_name, "failed", Some(secs));
                Some(strategy)
            }
        };

        self.after_job(strategy).await;
    }

    /// Applies runtime restarts and load reduction after a job.
    async fn after_job(&self, strategy: Option<RecoveryStrategy>) {
        self.state.jobs_processed.fetch_add(1, Ordering::SeqCst);
        let since_restart = self.state.jobs_since_restart.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.state.consecutive_failures.load(Ordering::SeqCst);

        let restart_reason = if strategy == Some(RecoveryStrategy::RestartRuntime) {
            Some("runtime crash")
        } else if failures >= self.config.max_consecutive_failures {
            Some("consecutive failures")
        } else if since_restart >= self.config.max_jobs_per_runtime {
            Some("job quota reached")
        } else {
            None
        };
        if let Some(reason) = restart_reason {
            self.state.contexts.restart_runtime(reason).await;
            self.state.jobs_since_restart.store(0, Ordering::SeqCst);
            self.state.consecutive_failures.store(0, Ordering::SeqCst);
        }

        if strategy == Some(RecoveryStrategy::ReduceLoad) {
            let pause = self.config.reduce_load_pause;
            *self.state.paused_until.lock() = Some(Instant::now() + pause);
            warn!(worker_id = %self.id, pause_secs = pause.as_secs_f64(), "Reducing load");
        }
    }

    async fn persist_failure(&self, job: &JobRecord, err: &TaskError, retryable: bool) {
        let failure = JobFailure::from_task_error(err, retryable);
        if let Err(e) = self
            .deps
            .store
            .mark_error(job.job_id, Some(&self.id), &failure)
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "Could not record job failure");
        }
    }

    async fn persist_cancelled(&self, job: &JobRecord) {
        if let Err(e) = self
            .deps
            .store
            .mark_error(job.job_id, Some(&self.id), &JobFailure::cancelled())
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "Could not record cancellation");
        }
    }
}

/// Appends a timestamped line to the job's `job.log`.
async fn append_job_log(output_dir: &Path, line: &str) {
    let path = output_dir.join("job.log");
    let entry = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), line);
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await
    }
    .await;
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Could not append to job log");
    }
}
