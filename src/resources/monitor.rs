//! Load sampling and scaling decisions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, System};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

/// Snapshots kept for trend analysis.
const HISTORY_CAPACITY: usize = 100;

const TREND_WINDOW: Duration = Duration::from_secs(300);

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Utilisation tier derived from the busiest of cpu, memory and disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Optimal,
    High,
    Critical,
    Overload,
}

impl ResourceState {
    pub fn from_usage(max_usage_percent: f64) -> Self {
        if max_usage_percent >= 95.0 {
            ResourceState::Overload
        } else if max_usage_percent >= 80.0 {
            ResourceState::Critical
        } else if max_usage_percent >= 60.0 {
            ResourceState::High
        } else {
            ResourceState::Optimal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Optimal => "optimal",
            ResourceState::High => "high",
            ResourceState::Critical => "critical",
            ResourceState::Overload => "overload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
    Throttle,
}

impl ScalingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::Maintain => "maintain",
            ScalingAction::Throttle => "throttle",
        }
    }
}

/// Host-level usage as reported by a [`ResourceSampler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemReading {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_mb: f64,
    pub disk_percent: f64,
}

/// Engine-side load counters combined with a [`SystemReading`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadInputs {
    pub queue_depth: u64,
    pub active_workers: usize,
    pub active_contexts: usize,
}

/// Point-in-time resource sample.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_mb: f64,
    pub disk_percent: f64,
    pub queue_depth: u64,
    pub active_workers: usize,
    pub active_contexts: usize,
    pub jobs_per_minute: f64,
    pub state: ResourceState,
    #[serde(skip)]
    taken_at: Instant,
}

impl ResourceSnapshot {
    pub fn new(reading: SystemReading, inputs: LoadInputs, jobs_per_minute: f64) -> Self {
        let max_usage = reading
            .cpu_percent
            .max(reading.memory_percent)
            .max(reading.disk_percent);
        Self {
            timestamp: Utc::now(),
            cpu_percent: reading.cpu_percent,
            memory_percent: reading.memory_percent,
            memory_available_mb: reading.memory_available_mb,
            disk_percent: reading.disk_percent,
            queue_depth: inputs.queue_depth,
            active_workers: inputs.active_workers,
            active_contexts: inputs.active_contexts,
            jobs_per_minute,
            state: ResourceState::from_usage(max_usage),
            taken_at: Instant::now(),
        }
    }
}

/// Usage direction per resource, each in `[-1, 1]`; positive means rising.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceTrends {
    pub cpu_trend: f64,
    pub memory_trend: f64,
    pub load_trend: f64,
}

/// Source of host usage readings.
pub trait ResourceSampler: Send + Sync {
    fn read(&self) -> SystemReading;
}

/// Reads the host through `sysinfo`.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // The first cpu reading needs a baseline.
        system.refresh_cpu_all();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn read(&self) -> SystemReading {
        let mut system = self.system.lock();
        system.refresh_cpu_all();
        system.refresh_memory();

        let total = system.total_memory();
        let available = system.available_memory();
        let memory_percent = if total > 0 {
            total.saturating_sub(available) as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.list().first());
        let disk_percent = root
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                d.total_space().saturating_sub(d.available_space()) as f64 / d.total_space() as f64
                    * 100.0
            })
            .unwrap_or(0.0);

        SystemReading {
            cpu_percent: f64::from(system.global_cpu_usage()),
            memory_percent,
            memory_available_mb: available as f64 / (1024.0 * 1024.0),
            disk_percent,
        }
    }
}

/// Sampler returning whatever reading was last set; for tests and embedding.
#[derive(Debug, Default)]
pub struct FixedSampler {
    reading: Mutex<SystemReading>,
}

impl FixedSampler {
    pub fn new(reading: SystemReading) -> Self {
        Self {
            reading: Mutex::new(reading),
        }
    }

    pub fn set(&self, reading: SystemReading) {
        *self.reading.lock() = reading;
    }
}

impl ResourceSampler for FixedSampler {
    fn read(&self) -> SystemReading {
        *self.reading.lock()
    }
}

/// Samples load and keeps a bounded history for trend analysis.
pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
    completions: Mutex<VecDeque<Instant>>,
    metrics: MetricsCollector,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn ResourceSampler>, metrics: MetricsCollector) -> Self {
        Self {
            sampler,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            completions: Mutex::new(VecDeque::new()),
            metrics,
        }
    }

    /// Records a finished job for the throughput figure.
    pub fn record_completion(&self) {
        let now = Instant::now();
        let mut completions = self.completions.lock();
        completions.push_back(now);
        while completions
            .front()
            .is_some_and(|t| now.duration_since(*t) > THROUGHPUT_WINDOW)
        {
            completions.pop_front();
        }
    }

    fn jobs_per_minute(&self) -> f64 {
        let now = Instant::now();
        self.completions
            .lock()
            .iter()
            .filter(|t| now.duration_since(**t) <= THROUGHPUT_WINDOW)
            .count() as f64
    }

    /// Takes a snapshot and appends it to the history.
    pub fn sample(&self, inputs: LoadInputs) -> ResourceSnapshot {
        let snapshot = ResourceSnapshot::new(self.sampler.read(), inputs, self.jobs_per_minute());

        self.metrics.set_resource_usage("cpu", snapshot.cpu_percent);
        self.metrics
            .set_resource_usage("memory", snapshot.memory_percent);
        self.metrics.set_resource_usage("disk", snapshot.disk_percent);

        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.history.lock().back().cloned()
    }

    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Trends over the snapshots taken in the last five minutes.
    pub fn trends(&self) -> ResourceTrends {
        let now = Instant::now();
        let history = self.history.lock();
        let recent: Vec<&ResourceSnapshot> = history
            .iter()
            .filter(|s| now.duration_since(s.taken_at) < TREND_WINDOW)
            .collect();
        if recent.len() < 2 {
            return ResourceTrends::default();
        }

        let series = |f: fn(&ResourceSnapshot) -> f64| -> Vec<f64> {
            recent.iter().map(|s| f(s)).collect()
        };
        ResourceTrends {
            cpu_trend: trend(&series(|s| s.cpu_percent)),
            memory_trend: trend(&series(|s| s.memory_percent)),
            load_trend: trend(&series(|s| (s.active_workers + s.active_contexts) as f64)),
        }
    }
}

/// Least-squares slope of `values` against their index, scaled into `[-1, 1]`.
pub fn trend(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let x_sum: f64 = (0..values.len()).map(|i| i as f64).sum();
    let y_sum: f64 = values.iter().sum();
    let xy_sum: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let x2_sum: f64 = (0..values.len()).map(|i| (i * i) as f64).sum();

    let denominator = n * x2_sum - x_sum * x_sum;
    if denominator == 0.0 {
        return 0.0;
    }
    let slope = (n * xy_sum - x_sum * y_sum) / denominator;
    (slope / 10.0).clamp(-1.0, 1.0)
}

/// Inputs for a worker's efficiency score.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerLoad {
    pub consecutive_failures: u32,
    pub active_contexts: usize,
    /// Time since the worker last completed a job.
    pub since_last_completion: Option<Duration>,
}

/// Scores a worker from 0 to 100; the lowest score is the first to be stopped.
pub fn efficiency_score(load: &WorkerLoad) -> f64 {
    let mut score = 100.0;
    if load.consecutive_failures > 0 {
        score -= f64::from((load.consecutive_failures * 15).min(60));
    }
    if load.active_contexts > 2 {
        score -= (load.active_contexts - 2) as f64 * 10.0;
    }
    if load
        .since_last_completion
        .is_some_and(|d| d < Duration::from_secs(300))
    {
        score += 10.0;
    }
    score.clamp(0.0, 100.0)
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Minimum gap between two non-maintain actions.
    pub cooldown: Duration,
    pub max_workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(120),
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub resource_state: Option<ResourceState>,
    pub latest: Option<ResourceSnapshot>,
    pub trends: ResourceTrends,
    pub last_action: Option<ScalingAction>,
    pub last_action_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LastAction {
    action: Option<ScalingAction>,
    at: Option<Instant>,
    at_utc: Option<DateTime<Utc>>,
}

/// Turns resource snapshots into scaling actions.
pub struct AdaptiveController {
    monitor: Arc<ResourceMonitor>,
    config: ControllerConfig,
    last: Mutex<LastAction>,
    metrics: MetricsCollector,
}

impl AdaptiveController {
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        config: ControllerConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            monitor,
            config,
            last: Mutex::new(LastAction::default()),
            metrics,
        }
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Decides the next scaling action.
    ///
    /// Only non-maintain actions start the cooldown, and nothing but
    /// `Maintain` is returned while it runs.
    pub fn decide(&self, snapshot: &ResourceSnapshot) -> ScalingAction {
        let mut last = self.last.lock();
        if last
            .at
            .is_some_and(|at| at.elapsed() < self.config.cooldown)
        {
            return ScalingAction::Maintain;
        }

        let action = match snapshot.state {
            ResourceState::Overload => ScalingAction::ScaleDown,
            ResourceState::Critical if self.monitor.trends().cpu_trend > 0.3 => {
                ScalingAction::Throttle
            }
            ResourceState::Optimal
                if snapshot.queue_depth > snapshot.active_workers as u64 * 3
                    && snapshot.active_workers < self.config.max_workers =>
            {
                ScalingAction::ScaleUp
            }
            _ => ScalingAction::Maintain,
        };

        if matches!(
            snapshot.state,
            ResourceState::Critical | ResourceState::Overload
        ) {
            warn!(
                state = snapshot.state.as_str(),
                cpu = snapshot.cpu_percent,
                memory = snapshot.memory_percent,
                "Resource pressure"
            );
        }

        if action != ScalingAction::Maintain {
            last.action = Some(action);
            last.at = Some(Instant::now());
            last.at_utc = Some(Utc::now());
            self.metrics.record_scaling_action(action.as_str());
            info!(
                action = action.as_str(),
                state = snapshot.state.as_str(),
                queue_depth = snapshot.queue_depth,
                workers = snapshot.active_workers,
                "Scaling action issued"
            );
        } else {
            debug!(state = snapshot.state.as_str(), "Maintaining worker count");
        }
        action
    }

    /// Worker count suggested by queue depth and spare capacity.
    pub fn optimal_worker_count(&self, snapshot: &ResourceSnapshot) -> usize {
        let queue_based = ((snapshot.queue_depth / 2).max(1) as usize).min(self.config.max_workers);
        let cpu_capacity = (((100.0 - snapshot.cpu_percent) / 25.0) as usize).max(1);
        let memory_capacity = (((100.0 - snapshot.memory_percent) / 20.0) as usize).max(1);
        queue_based.min(cpu_capacity.min(memory_capacity)).max(1)
    }

    pub fn stats(&self) -> ControllerStats {
        let latest = self.monitor.latest();
        let last = self.last.lock();
        ControllerStats {
            resource_state: latest.as_ref().map(|s| s.state),
            latest,
            trends: self.monitor.trends(),
            last_action: last.action,
            last_action_at: last.at_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(cpu: f64, memory: f64) -> SystemReading {
        SystemReading {
            cpu_percent: cpu,
            memory_percent: memory,
            memory_available_mb: 1024.0,
            disk_percent: 10.0,
        }
    }

    fn controller(sampler: Arc<FixedSampler>, cooldown: Duration) -> AdaptiveController {
        let monitor = Arc::new(ResourceMonitor::new(sampler, MetricsCollector::disabled()));
        AdaptiveController::new(
            monitor,
            ControllerConfig {
                cooldown,
                max_workers: 4,
            },
            MetricsCollector::disabled(),
        )
    }

    fn inputs(queue_depth: u64, active_workers: usize) -> LoadInputs {
        LoadInputs {
            queue_depth,
            active_workers,
            active_contexts: 0,
        }
    }

    #[test]
    fn test_state_thresholds() {
        assert_eq!(ResourceState::from_usage(10.0), ResourceState::Optimal);
        assert_eq!(ResourceState::from_usage(60.0), ResourceState::High);
        assert_eq!(ResourceState::from_usage(80.0), ResourceState::Critical);
        assert_eq!(ResourceState::from_usage(95.0), ResourceState::Overload);

        let snapshot = ResourceSnapshot::new(
            SystemReading {
                cpu_percent: 5.0,
                memory_percent: 5.0,
                memory_available_mb: 0.0,
                disk_percent: 97.0,
            },
            LoadInputs::default(),
            0.0,
        );
        assert_eq!(snapshot.state, ResourceState::Overload);
    }

    #[test]
    fn test_trend_direction() {
        assert_eq!(trend(&[50.0]), 0.0);
        assert_eq!(trend(&[40.0, 40.0, 40.0]), 0.0);
        assert!((trend(&[10.0, 15.0, 20.0]) - 0.5).abs() < 1e-9);
        assert_eq!(trend(&[0.0, 50.0, 100.0]), 1.0);
        assert!(trend(&[30.0, 20.0, 10.0]) < 0.0);
    }

    #[test]
    fn test_efficiency_score() {
        assert_eq!(efficiency_score(&WorkerLoad::default()), 100.0);
        let busy = WorkerLoad {
            consecutive_failures: 5,
            active_contexts: 3,
            since_last_completion: Some(Duration::from_secs(10)),
        };
        assert_eq!(efficiency_score(&busy), 100.0 - 60.0 - 10.0 + 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_consecutive_actions() {
        let sampler = Arc::new(FixedSampler::new(reading(99.0, 20.0)));
        let ctl = controller(Arc::clone(&sampler), Duration::from_secs(120));

        let snapshot = ctl.monitor().sample(inputs(0, 3));
        assert_eq!(ctl.decide(&snapshot), ScalingAction::ScaleDown);

        // Still overloaded, but inside the cooldown.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(20)).await;
            let snapshot = ctl.monitor().sample(inputs(0, 2));
            assert_eq!(ctl.decide(&snapshot), ScalingAction::Maintain);
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        let snapshot = ctl.monitor().sample(inputs(0, 2));
        assert_eq!(ctl.decide(&snapshot), ScalingAction::ScaleDown);
        assert_eq!(ctl.stats().last_action, Some(ScalingAction::ScaleDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintain_does_not_start_cooldown() {
        let sampler = Arc::new(FixedSampler::new(reading(20.0, 20.0)));
        let ctl = controller(Arc::clone(&sampler), Duration::from_secs(120));

        let snapshot = ctl.monitor().sample(inputs(2, 2));
        assert_eq!(ctl.decide(&snapshot), ScalingAction::Maintain);

        let snapshot = ctl.monitor().sample(inputs(20, 2));
        assert_eq!(ctl.decide(&snapshot), ScalingAction::ScaleUp);

        // At the worker ceiling nothing scales up even with a deep queue.
        tokio::time::advance(Duration::from_secs(121)).await;
        let snapshot = ctl.monitor().sample(inputs(50, 4));
        assert_eq!(ctl.decide(&snapshot), ScalingAction::Maintain);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rising_cpu_under_pressure_throttles() {
        let sampler = Arc::new(FixedSampler::new(reading(60.0, 20.0)));
        let ctl = controller(Arc::clone(&sampler), Duration::from_secs(120));

        for cpu in [60.0, 70.0, 85.0] {
            sampler.set(reading(cpu, 20.0));
            ctl.monitor().sample(inputs(0, 2));
            tokio::time::advance(Duration::from_secs(30)).await;
        }
        let snapshot = ctl.monitor().latest().unwrap();
        assert_eq!(snapshot.state, ResourceState::Critical);
        assert!(ctl.monitor().trends().cpu_trend > 0.3);
        assert_eq!(ctl.decide(&snapshot), ScalingAction::Throttle);
    }

    #[test]
    fn test_optimal_worker_count() {
        let sampler = Arc::new(FixedSampler::new(reading(10.0, 10.0)));
        let ctl = controller(Arc::clone(&sampler), Duration::from_secs(120));
        let idle = ResourceSnapshot::new(reading(10.0, 10.0), inputs(0, 1), 0.0);
        assert_eq!(ctl.optimal_worker_count(&idle), 1);

        let deep = ResourceSnapshot::new(reading(10.0, 10.0), inputs(40, 1), 0.0);
        assert_eq!(ctl.optimal_worker_count(&deep), 3);

        let hot = ResourceSnapshot::new(reading(90.0, 10.0), inputs(40, 1), 0.0);
        assert_eq!(ctl.optimal_worker_count(&hot), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let sampler = Arc::new(FixedSampler::new(reading(10.0, 10.0)));
        let monitor = ResourceMonitor::new(sampler, MetricsCollector::disabled());
        for _ in 0..150 {
            monitor.sample(LoadInputs::default());
        }
        assert_eq!(monitor.history().len(), HISTORY_CAPACITY);
    }
}
