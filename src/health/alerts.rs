//! Threshold alerts over named engine metrics.
//!
//! An [`AlertRule`] compares one metric against a threshold. When the
//! condition starts to hold, the rule fires an [`Alert`] that stays active
//! until a later evaluation finds the condition cleared. A rule that fired
//! stays quiet for its cooldown, even if it resolved and tripped again in
//! between.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;

/// Alerts kept in the history ring.
const ALERT_HISTORY: usize = 500;

/// Two values closer than this are equal for [`AlertCondition::Equal`].
const EQUAL_EPSILON: f64 = 0.001;

pub mod metric {
    //! Metric names the engine publishes to the alert manager.

    pub const HEALTH_SCORE: &str = "health_score";
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const DEAD_LETTER_JOBS: &str = "dead_letter_jobs";
    pub const LIVE_WORKERS: &str = "live_workers";
    pub const OPEN_BREAKERS: &str = "open_breakers";
    pub const NEW_ERRORS: &str = "new_errors";
    pub const CPU_PERCENT: &str = "cpu_percent";
    pub const MEMORY_PERCENT: &str = "memory_percent";
    pub const DISK_PERCENT: &str = "disk_percent";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::High => "high",
            AlertSeverity::Medium => "medium",
            AlertSeverity::Low => "low",
            AlertSeverity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertCondition {
    #[serde(rename = "gt")]
    Above,
    #[serde(rename = "lt")]
    Below,
    #[serde(rename = "eq")]
    Equal,
}

impl AlertCondition {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlertCondition::Above => value > threshold,
            AlertCondition::Below => value < threshold,
            AlertCondition::Equal => (value - threshold).abs() < EQUAL_EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub condition: AlertCondition,
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        condition: AlertCondition,
        threshold: f64,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            threshold,
            severity,
            condition,
            cooldown: Duration::from_secs(300),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Rules installed by [`AlertManager::with_default_rules`].
pub fn default_rules() -> Vec<AlertRule> {
    use AlertCondition::{Above, Below};
    use AlertSeverity::{Critical, High, Medium};

    vec![
        AlertRule::new("no_live_workers", metric::LIVE_WORKERS, Below, 1.0, Critical),
        AlertRule::new("low_health_score", metric::HEALTH_SCORE, Below, 50.0, Critical),
        AlertRule::new("disk_nearly_full", metric::DISK_PERCENT, Above, 95.0, Critical),
        AlertRule::new("high_cpu", metric::CPU_PERCENT, Above, 90.0, High),
        AlertRule::new("high_memory", metric::MEMORY_PERCENT, Above, 90.0, High),
        AlertRule::new("error_burst", metric::NEW_ERRORS, Above, 10.0, High),
        AlertRule::new("queue_backlog", metric::QUEUE_DEPTH, Above, 50.0, Medium),
        AlertRule::new("breakers_open", metric::OPEN_BREAKERS, Above, 0.0, Medium),
        AlertRule::new("dead_letter_growing", metric::DEAD_LETTER_JOBS, Above, 100.0, Medium),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertSummary {
    pub total_alerts_all_time: u64,
    pub active_alerts: usize,
    /// Active alerts per severity.
    pub alerts_by_severity: BTreeMap<String, usize>,
    pub last_alert: Option<DateTime<Utc>>,
}

/// Receives every alert as it fires.
pub trait AlertNotifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

#[derive(Default)]
struct AlertState {
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    last_fired: HashMap<String, Instant>,
    total_fired: u64,
}

pub struct AlertManager {
    rules: RwLock<Vec<AlertRule>>,
    state: Mutex<AlertState>,
    notifiers: RwLock<Vec<Arc<dyn AlertNotifier>>>,
    metrics: MetricsCollector,
}

impl AlertManager {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            state: Mutex::new(AlertState::default()),
            notifiers: RwLock::new(Vec::new()),
            metrics,
        }
    }

    pub fn with_default_rules(metrics: MetricsCollector) -> Self {
        let manager = Self::new(metrics);
        *manager.rules.write() = default_rules();
        manager
    }

    /// Adds `rule`, replacing any rule with the same name.
    pub fn add_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write();
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
    }

    /// Removes a rule and resolves its active alert; false when unknown.
    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = {
            let mut rules = self.rules.write();
            let before = rules.len();
            rules.retain(|r| r.name != name);
            rules.len() != before
        };
        if removed {
            let mut state = self.state.lock();
            if let Some(alert) = state.active.remove(name) {
                resolve_in_history(&mut state.history, alert.id, Utc::now());
            }
            state.last_fired.remove(name);
        }
        removed
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().clone()
    }

    pub fn add_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        self.notifiers.write().push(notifier);
    }

    /// Evaluates every rule against `values` and returns the alerts that fired.
    ///
    /// Rules whose metric is missing from `values` are skipped and keep their
    /// current state.
    pub fn evaluate(&self, values: &BTreeMap<String, f64>) -> Vec<Alert> {
        let rules = self.rules.read().clone();
        let now = Utc::now();
        let mut fired = Vec::new();

        {
            let mut state = self.state.lock();
            for rule in &rules {
                let Some(&value) = values.get(&rule.metric) else {
                    continue;
                };

                if !rule.condition.holds(value, rule.threshold) {
                    if let Some(alert) = state.active.remove(&rule.name) {
                        resolve_in_history(&mut state.history, alert.id, now);
                        info!(rule = %rule.name, value, "Alert resolved");
                    }
                    continue;
                }

                if state.active.contains_key(&rule.name) {
                    continue;
                }
                if state
                    .last_fired
                    .get(&rule.name)
                    .is_some_and(|at| at.elapsed() < rule.cooldown)
                {
                    continue;
                }

                let alert = Alert {
                    id: Uuid::new_v4(),
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    message: format!("{} is {}, threshold: {}", rule.metric, value, rule.threshold),
                    metric: rule.metric.clone(),
                    value,
                    threshold: rule.threshold,
                    triggered_at: now,
                    resolved_at: None,
                };
                state.active.insert(rule.name.clone(), alert.clone());
                if state.history.len() >= ALERT_HISTORY {
                    state.history.pop_front();
                }
                state.history.push_back(alert.clone());
                state.last_fired.insert(rule.name.clone(), Instant::now());
                state.total_fired += 1;
                fired.push(alert);
            }
        }

        if !fired.is_empty() {
            let notifiers = self.notifiers.read().clone();
            for alert in &fired {
                warn!(
                    rule = %alert.rule,
                    severity = alert.severity.as_str(),
                    value = alert.value,
                    threshold = alert.threshold,
                    "ALERT: {}",
                    alert.message
                );
                self.metrics.record_alert(&alert.rule, alert.severity.as_str());
                for notifier in &notifiers {
                    notifier.notify(alert);
                }
            }
        }
        fired
    }

    /// Active alerts, most severe first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.state.lock().active.values().cloned().collect();
        alerts.sort_by(|a, b| a.severity.cmp(&b.severity).then(a.triggered_at.cmp(&b.triggered_at)));
        alerts
    }

    /// Up to `limit` most recent alerts, newest first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        self.state
            .lock()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> AlertSummary {
        let state = self.state.lock();
        let mut alerts_by_severity = BTreeMap::new();
        for alert in state.active.values() {
            *alerts_by_severity
                .entry(alert.severity.as_str().to_string())
                .or_insert(0) += 1;
        }
        AlertSummary {
            total_alerts_all_time: state.total_fired,
            active_alerts: state.active.len(),
            alerts_by_severity,
            last_alert: state.history.back().map(|a| a.triggered_at),
        }
    }
}

fn resolve_in_history(history: &mut VecDeque<Alert>, id: Uuid, at: DateTime<Utc>) {
    if let Some(entry) = history.iter_mut().rev().find(|a| a.id == id) {
        entry.resolved_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn manager_with(rule: AlertRule) -> AlertManager {
        let manager = AlertManager::new(MetricsCollector::disabled());
        manager.add_rule(rule);
        manager
    }

    #[test]
    fn test_conditions() {
        assert!(AlertCondition::Above.holds(2.0, 1.0));
        assert!(!AlertCondition::Above.holds(1.0, 1.0));
        assert!(AlertCondition::Below.holds(0.0, 1.0));
        assert!(AlertCondition::Equal.holds(1.0005, 1.0));
        assert!(!AlertCondition::Equal.holds(1.01, 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_resolve_and_cooldown() {
        let manager = manager_with(
            AlertRule::new("backlog", "queue_depth", AlertCondition::Above, 50.0, AlertSeverity::Medium)
                .with_cooldown(Duration::from_secs(60)),
        );

        let fired = manager.evaluate(&values(&[("queue_depth", 80.0)]));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].message, "queue_depth is 80, threshold: 50");
        // Still above: the active alert is not fired again.
        assert!(manager.evaluate(&values(&[("queue_depth", 90.0)])).is_empty());
        assert_eq!(manager.active_alerts().len(), 1);

        assert!(manager.evaluate(&values(&[("queue_depth", 10.0)])).is_empty());
        assert!(manager.active_alerts().is_empty());
        assert!(manager.history(10)[0].is_resolved());

        // Tripped again inside the cooldown.
        assert!(manager.evaluate(&values(&[("queue_depth", 80.0)])).is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.evaluate(&values(&[("queue_depth", 80.0)])).len(), 1);

        let summary = manager.summary();
        assert_eq!(summary.total_alerts_all_time, 2);
        assert_eq!(summary.active_alerts, 1);
        assert_eq!(summary.alerts_by_severity.get("medium"), Some(&1));
        assert!(summary.last_alert.is_some());
    }

    #[test]
    fn test_missing_metric_keeps_state() {
        let manager = manager_with(AlertRule::new(
            "no_workers",
            "live_workers",
            AlertCondition::Below,
            1.0,
            AlertSeverity::Critical,
        ));
        assert_eq!(manager.evaluate(&values(&[("live_workers", 0.0)])).len(), 1);
        assert!(manager.evaluate(&values(&[("queue_depth", 3.0)])).is_empty());
        assert_eq!(manager.active_alerts().len(), 1);
    }

    #[test]
    fn test_remove_rule_resolves_alert() {
        let manager = manager_with(AlertRule::new(
            "hot",
            "cpu_percent",
            AlertCondition::Above,
            90.0,
            AlertSeverity::High,
        ));
        manager.evaluate(&values(&[("cpu_percent", 99.0)]));
        assert!(manager.remove_rule("hot"));
        assert!(!manager.remove_rule("hot"));
        assert!(manager.active_alerts().is_empty());
        assert!(manager.history(1)[0].is_resolved());
        assert!(manager.rules().is_empty());
    }

    struct Recorder(Mutex<Vec<String>>);

    impl AlertNotifier for Recorder {
        fn notify(&self, alert: &Alert) {
            self.0.lock().push(alert.rule.clone());
        }
    }

    #[test]
    fn test_default_rules_and_notifier() {
        let manager = AlertManager::with_default_rules(MetricsCollector::disabled());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        manager.add_notifier(recorder.clone());

        let fired = manager.evaluate(&values(&[
            (metric::LIVE_WORKERS, 0.0),
            (metric::OPEN_BREAKERS, 2.0),
            (metric::CPU_PERCENT, 20.0),
        ]));
        assert_eq!(fired.len(), 2);
        assert_eq!(*recorder.0.lock(), vec!["no_live_workers", "breakers_open"]);

        let active = manager.active_alerts();
        assert_eq!(active[0].severity, AlertSeverity::Critical);
        assert_eq!(active[1].severity, AlertSeverity::Medium);
    }

    #[test]
    fn test_rule_yaml() {
        let rule: AlertRule = serde_yaml::from_str(
            "name: slow\nmetric: queue_depth\nthreshold: 5\nseverity: low\ncondition: gt\ncooldown: 30\n",
        )
        .unwrap();
        assert_eq!(rule.condition, AlertCondition::Above);
        assert_eq!(rule.cooldown, Duration::from_secs(30));
    }
}
