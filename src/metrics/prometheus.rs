//! Prometheus metrics registration and export.
//!
//! All metrics live in an [`EngineMetrics`] value that owns its own
//! [`Registry`]. One instance is created per engine and shared through
//! [`super::MetricsCollector`].

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Every metric the engine exports.
pub struct EngineMetrics {
    registry: Registry,
    /// Job outcomes, labeled by task and outcome.
    pub jobs_total: CounterVec,
    /// Job execution duration in seconds, labeled by task.
    pub job_duration: HistogramVec,
    /// Jobs per persisted status.
    pub queue_depth: GaugeVec,
    /// Workers alive in the pool.
    pub active_workers: Gauge,
    /// Workers currently executing a job.
    pub busy_workers: Gauge,
    /// Task failures, labeled by error kind and severity.
    pub task_errors_total: CounterVec,
    /// Breaker state per target (0 closed, 1 half-open, 2 open).
    pub breaker_state: GaugeVec,
    /// Breaker transitions, labeled by breaker and destination state.
    pub breaker_transitions_total: CounterVec,
    /// Fallback executions, labeled by service, strategy and success.
    pub fallback_executions_total: CounterVec,
    /// Global service level (0 full .. 3 emergency).
    pub service_level: Gauge,
    /// Sampled resource usage in percent, labeled by resource.
    pub resource_usage: GaugeVec,
    /// Scaling actions issued by the adaptive controller.
    pub scaling_actions_total: CounterVec,
    /// Admission rejections by the concurrency throttler.
    pub throttle_rejections_total: CounterVec,
    /// Overall health score (0-100).
    pub health_score: Gauge,
    /// Alerts fired, labeled by rule and severity.
    pub alerts_total: CounterVec,
}

impl EngineMetrics {
    /// Creates every metric and registers it with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_total = CounterVec::new(
            Opts::new("job_forge_jobs_total", "Job outcomes by task"),
            &["task", "outcome"],
        )?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "job_forge_job_duration_seconds",
                "Job execution duration in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["task"],
        )?;

        let queue_depth = GaugeVec::new(
            Opts::new("job_forge_queue_depth", "Number of jobs per status"),
            &["status"],
        )?;

        let active_workers = Gauge::new("job_forge_active_workers", "Number of live workers")?;
        let busy_workers = Gauge::new(
            "job_forge_busy_workers",
            "Number of workers currently executing a job",
        )?;

        let task_errors_total = CounterVec::new(
            Opts::new("job_forge_task_errors_total", "Task failures by kind"),
            &["kind", "severity"],
        )?;

        let breaker_state = GaugeVec::new(
            Opts::new(
                "job_forge_circuit_breaker_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            ),
            &["breaker"],
        )?;

        let breaker_transitions_total = CounterVec::new(
            Opts::new(
                "job_forge_circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["breaker", "to"],
        )?;

        let fallback_executions_total = CounterVec::new(
            Opts::new(
                "job_forge_fallback_executions_total",
                "Fallback strategy executions",
            ),
            &["service", "strategy", "success"],
        )?;

        let service_level = Gauge::new(
            "job_forge_service_level",
            "Global service level (0 full, 1 degraded, 2 minimal, 3 emergency)",
        )?;

        let resource_usage = GaugeVec::new(
            Opts::new("job_forge_resource_usage_percent", "Sampled resource usage"),
            &["resource"],
        )?;

        let scaling_actions_total = CounterVec::new(
            Opts::new("job_forge_scaling_actions_total", "Scaling actions issued"),
            &["action"],
        )?;

        let throttle_rejections_total = CounterVec::new(
            Opts::new(
                "job_forge_throttle_rejections_total",
                "Requests refused by the concurrency throttler",
            ),
            &["service"],
        )?;

        let health_score = Gauge::new("job_forge_health_score", "Overall health score (0-100)")?;

        let alerts_total = CounterVec::new(
            Opts::new("job_forge_alerts_total", "Alerts fired by rule"),
            &["rule", "severity"],
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(busy_workers.clone()))?;
        registry.register(Box::new(task_errors_total.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;
        registry.register(Box::new(fallback_executions_total.clone()))?;
        registry.register(Box::new(service_level.clone()))?;
        registry.register(Box::new(resource_usage.clone()))?;
        registry.register(Box::new(scaling_actions_total.clone()))?;
        registry.register(Box::new(throttle_rejections_total.clone()))?;
        registry.register(Box::new(health_score.clone()))?;
        registry.register(Box::new(alerts_total.clone()))?;

        tracing::debug!("Prometheus metrics registered");

        Ok(Self {
            registry,
            jobs_total,
            job_duration,
            queue_depth,
            active_workers,
            busy_workers,
            task_errors_total,
            breaker_state,
            breaker_transitions_total,
            fallback_executions_total,
            service_level,
            resource_usage,
            scaling_actions_total,
            throttle_rejections_total,
            health_score,
            alerts_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_engines_do_not_collide() {
        // Each instance owns its registry, so registering twice is fine.
        let first = EngineMetrics::new().unwrap();
        let second = EngineMetrics::new().unwrap();

        first.active_workers.set(3.0);
        assert!(first.export().contains("job_forge_active_workers 3"));
        assert!(second.export().contains("job_forge_active_workers 0"));
    }

    #[test]
    fn test_export_contains_labeled_series() {
        let metrics = EngineMetrics::new().unwrap();
        metrics
            .jobs_total
            .with_label_values(&["echo", "finished"])
            .inc();

        let text = metrics.export();
        assert!(!text.starts_with("# Error"));
        let line = text
            .lines()
            .find(|l| l.starts_with("job_forge_jobs_total{"))
            .expect("jobs_total series");
        assert!(line.contains("task=\"echo\""));
        assert!(line.contains("outcome=\"finished\""));
        assert!(line.ends_with(" 1"));
    }
}
