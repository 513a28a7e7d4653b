//! High-level recording interface over [`EngineMetrics`].
//!
//! `MetricsCollector` is cheap to clone and handed to every component at
//! construction. A disabled collector records nothing, which keeps unit tests
//! free of registry plumbing.

use std::sync::Arc;

use super::prometheus::EngineMetrics;

/// Records engine metrics; a no-op when disabled.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Option<Arc<EngineMetrics>>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

impl MetricsCollector {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            inner: Some(metrics),
        }
    }

    /// A collector that drops every sample.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Record a job outcome.
    ///
    /// # Arguments
    ///
    /// * `task` - Task name
    /// * `outcome` - "finished", "error", "cancelled", "retried" or "dead_letter"
    /// * `duration_secs` - Execution time, when the job actually ran
    pub fn record_job(&self, task: &str, outcome: &str, duration_secs: Option<f64>) {
        if let Some(m) = &self.inner {
            m.jobs_total.with_label_values(&[task, outcome]).inc();
            if let Some(secs) = duration_secs {
                m.job_duration.with_label_values(&[task]).observe(secs);
            }
        }

        tracing::trace!(task = task, outcome = outcome, "Recorded job metric");
    }

    pub fn set_queue_depth(&self, status: &str, depth: u64) {
        if let Some(m) = &self.inner {
            m.queue_depth.with_label_values(&[status]).set(depth as f64);
        }
    }

    pub fn set_active_workers(&self, count: usize) {
        if let Some(m) = &self.inner {
            m.active_workers.set(count as f64);
        }
    }

    pub fn inc_busy_workers(&self) {
        if let Some(m) = &self.inner {
            m.busy_workers.inc();
        }
    }

    pub fn dec_busy_workers(&self) {
        if let Some(m) = &self.inner {
            m.busy_workers.dec();
        }
    }

    pub fn record_task_error(&self, kind: &str, severity: &str) {
        if let Some(m) = &self.inner {
            m.task_errors_total
                .with_label_values(&[kind, severity])
                .inc();
        }
    }

    /// Record a breaker transition and publish its new state code.
    pub fn record_breaker_transition(&self, breaker: &str, to: &str, state_code: u8) {
        if let Some(m) = &self.inner {
            m.breaker_transitions_total
                .with_label_values(&[breaker, to])
                .inc();
            m.breaker_state
                .with_label_values(&[breaker])
                .set(f64::from(state_code));
        }
    }

    pub fn record_fallback(&self, service: &str, strategy: &str, success: bool) {
        if let Some(m) = &self.inner {
            let success = if success { "true" } else { "false" };
            m.fallback_executions_total
                .with_label_values(&[service, strategy, success])
                .inc();
        }
    }

    pub fn set_service_level(&self, level_code: u8) {
        if let Some(m) = &self.inner {
            m.service_level.set(f64::from(level_code));
        }
    }

    pub fn set_resource_usage(&self, resource: &str, percent: f64) {
        if let Some(m) = &self.inner {
            m.resource_usage.with_label_values(&[resource]).set(percent);
        }
    }

    pub fn record_scaling_action(&self, action: &str) {
        if let Some(m) = &self.inner {
            m.scaling_actions_total.with_label_values(&[action]).inc();
        }
    }

    pub fn record_throttle_rejection(&self, service: &str) {
        if let Some(m) = &self.inner {
            m.throttle_rejections_total
                .with_label_values(&[service])
                .inc();
        }
    }

    pub fn set_health_score(&self, score: f64) {
        if let Some(m) = &self.inner {
            m.health_score.set(score);
        }
    }

    pub fn record_alert(&self, rule: &str, severity: &str) {
        if let Some(m) = &self.inner {
            m.alerts_total.with_label_values(&[rule, severity]).inc();
        }
    }

    /// Prometheus text exposition, or a comment line when disabled.
    pub fn export(&self) -> String {
        match &self.inner {
            Some(m) => m.export(),
            None => "# Metrics disabled\n".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_collector_is_noop() {
        let collector = MetricsCollector::disabled();
        assert!(!collector.is_enabled());
        collector.record_job("echo", "finished", Some(1.0));
        collector.set_queue_depth("queued", 4);
        assert_eq!(collector.export(), "# Metrics disabled\n");
    }

    #[test]
    fn test_record_job_and_depth() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let collector = MetricsCollector::new(Arc::clone(&metrics));

        collector.record_job("echo", "finished", Some(0.25));
        collector.record_job("echo", "error", None);
        collector.set_queue_depth("queued", 7);

        assert_eq!(
            metrics
                .jobs_total
                .with_label_values(&["echo", "finished"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics.queue_depth.with_label_values(&["queued"]).get(),
            7.0
        );
        assert_eq!(
            metrics
                .job_duration
                .with_label_values(&["echo"])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn test_busy_workers_gauge() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let collector = MetricsCollector::new(Arc::clone(&metrics));

        collector.inc_busy_workers();
        collector.inc_busy_workers();
        collector.dec_busy_workers();
        assert_eq!(metrics.busy_workers.get(), 1.0);
    }
}
