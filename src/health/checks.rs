//! Component checks and the readiness aggregate.
//!
//! Each check turns a snapshot of one component into a [`ComponentHealth`].
//! [`Readiness::from_components`] weighs them into an overall status and
//! decides whether the engine should take traffic: the store and the
//! execution runtime are critical, so either one failing makes the engine
//! unready regardless of the weighted score.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::resilience::{BreakerSummary, HealthSummary, ServiceLevel};
use crate::resources::ResourceSnapshot;
use crate::scheduler::{PoolStats, WorkerStatus};

/// A worker with this many consecutive failures no longer counts as healthy.
pub const WORKER_FAILURE_LIMIT: u32 = 3;

const CPU_WARNING: f64 = 80.0;
const CPU_CRITICAL: f64 = 90.0;
const MEMORY_WARNING: f64 = 80.0;
const MEMORY_CRITICAL: f64 = 90.0;
const DISK_WARNING: f64 = 85.0;
const DISK_CRITICAL: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Contribution to the weighted readiness score.
    pub fn score(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
            HealthStatus::Unknown => 0.25,
        }
    }

    /// Status for a check that took `elapsed`.
    pub fn from_latency(elapsed: Duration, degraded: Duration, unhealthy: Duration) -> Self {
        if elapsed > unhealthy {
            HealthStatus::Unhealthy
        } else if elapsed > degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parts of the engine that are checked for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Runtime,
    Store,
    WorkerPool,
    Breakers,
    Fallback,
    Resources,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::Runtime,
        Component::Store,
        Component::WorkerPool,
        Component::Breakers,
        Component::Fallback,
        Component::Resources,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Runtime => "runtime",
            Component::Store => "store",
            Component::WorkerPool => "worker_pool",
            Component::Breakers => "circuit_breakers",
            Component::Fallback => "fallback",
            Component::Resources => "resources",
        }
    }

    /// Share of the readiness score; the weights sum to 1.
    pub fn weight(&self) -> f64 {
        match self {
            Component::Runtime => 0.25,
            Component::Store => 0.20,
            Component::WorkerPool => 0.20,
            Component::Breakers => 0.15,
            Component::Fallback => 0.10,
            Component::Resources => 0.10,
        }
    }

    /// Critical components block traffic when unhealthy.
    pub fn is_critical(&self) -> bool {
        matches!(self, Component::Runtime | Component::Store)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub status: HealthStatus,
    pub message: String,
    pub response_time_ms: f64,
    pub details: Value,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(component: Component, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            component,
            status,
            message: message.into(),
            response_time_ms: 0.0,
            details: Value::Null,
            checked_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time_ms = elapsed.as_secs_f64() * 1000.0;
        self
    }
}

/// Alive, not stuck in a failure streak.
pub fn worker_is_healthy(worker: &WorkerStatus) -> bool {
    worker.alive && worker.consecutive_failures < WORKER_FAILURE_LIMIT
}

pub fn check_worker_pool(stats: &PoolStats) -> ComponentHealth {
    let total = stats.workers.len();
    let healthy = stats.workers.iter().filter(|w| worker_is_healthy(w)).count();

    let (status, message) = if total == 0 {
        (HealthStatus::Unhealthy, "No workers available".to_string())
    } else if healthy == 0 {
        (
            HealthStatus::Unhealthy,
            format!("No healthy workers (0/{})", total),
        )
    } else if (healthy as f64) < total as f64 * 0.5 {
        (
            HealthStatus::Degraded,
            format!("Low worker availability ({}/{})", healthy, total),
        )
    } else {
        (
            HealthStatus::Healthy,
            format!("Worker pool healthy ({}/{})", healthy, total),
        )
    };

    ComponentHealth::new(Component::WorkerPool, status, message).with_details(json!({
        "total_workers": total,
        "healthy_workers": healthy,
        "busy_workers": stats.busy_workers,
    }))
}

pub fn check_breakers(summary: &BreakerSummary) -> ComponentHealth {
    let (status, message) = if summary.total == 0 {
        (HealthStatus::Healthy, "No circuit breakers in use".to_string())
    } else if summary.open == 0 {
        (
            HealthStatus::Healthy,
            format!("All circuit breakers closed ({})", summary.total),
        )
    } else if (summary.open as f64) < summary.total as f64 * 0.5 {
        (
            HealthStatus::Degraded,
            format!("Some circuit breakers open ({}/{})", summary.open, summary.total),
        )
    } else {
        (
            HealthStatus::Unhealthy,
            format!("Many circuit breakers open ({}/{})", summary.open, summary.total),
        )
    };

    ComponentHealth::new(Component::Breakers, status, message).with_details(json!({
        "total_breakers": summary.total,
        "open_breakers": summary.open,
        "half_open_breakers": summary.half_open,
    }))
}

pub fn check_fallback(summary: &HealthSummary) -> ComponentHealth {
    let degraded = summary.total_services.saturating_sub(summary.healthy_services);
    let (status, message) = match summary.service_level {
        ServiceLevel::Full => (
            HealthStatus::Healthy,
            "Full service level".to_string(),
        ),
        ServiceLevel::Degraded => (
            HealthStatus::Degraded,
            format!(
                "Service level degraded ({}/{} services unhealthy)",
                degraded, summary.total_services
            ),
        ),
        level => (
            HealthStatus::Unhealthy,
            format!("Service level {}", level.as_str()),
        ),
    };

    ComponentHealth::new(Component::Fallback, status, message).with_details(json!({
        "service_level": summary.service_level.as_str(),
        "total_services": summary.total_services,
        "unhealthy_services": degraded,
        "overall_availability": summary.overall_availability,
    }))
}

pub fn check_resources(snapshot: &ResourceSnapshot) -> ComponentHealth {
    let mut critical = Vec::new();
    let mut high = Vec::new();
    for (name, value, warning, limit) in [
        ("CPU", snapshot.cpu_percent, CPU_WARNING, CPU_CRITICAL),
        ("Memory", snapshot.memory_percent, MEMORY_WARNING, MEMORY_CRITICAL),
        ("Disk", snapshot.disk_percent, DISK_WARNING, DISK_CRITICAL),
    ] {
        if value > limit {
            critical.push(format!("{} usage critical ({:.1}%)", name, value));
        } else if value > warning {
            high.push(format!("{} usage high ({:.1}%)", name, value));
        }
    }

    let (status, message) = if !critical.is_empty() {
        critical.extend(high);
        (
            HealthStatus::Unhealthy,
            format!("Critical resource usage: {}", critical.join("; ")),
        )
    } else if !high.is_empty() {
        (
            HealthStatus::Degraded,
            format!("High resource usage: {}", high.join("; ")),
        )
    } else {
        (HealthStatus::Healthy, "Resource usage normal".to_string())
    };

    ComponentHealth::new(Component::Resources, status, message).with_details(json!({
        "cpu_percent": snapshot.cpu_percent,
        "memory_percent": snapshot.memory_percent,
        "memory_available_mb": snapshot.memory_available_mb,
        "disk_percent": snapshot.disk_percent,
    }))
}

/// Weighted view over every component check.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub status: HealthStatus,
    /// Weighted score between 0 and 1.
    pub score: f64,
    pub ready_for_traffic: bool,
    pub degraded_components: Vec<Component>,
    pub failed_components: Vec<Component>,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl Readiness {
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let (status, score) = if components.is_empty() {
            (HealthStatus::Unknown, 0.0)
        } else {
            let total_weight: f64 = components.iter().map(|c| c.component.weight()).sum();
            let weighted: f64 = components
                .iter()
                .map(|c| c.status.score() * c.component.weight())
                .sum();
            let score = weighted / total_weight.max(1.0);
            let status = if score >= 0.8 {
                HealthStatus::Healthy
            } else if score >= 0.5 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            };
            (status, score)
        };

        let critical_down = components
            .iter()
            .any(|c| c.component.is_critical() && c.status == HealthStatus::Unhealthy);
        let ready_for_traffic =
            !components.is_empty() && !critical_down && status != HealthStatus::Unhealthy;

        let with_status = |wanted: HealthStatus| {
            components
                .iter()
                .filter(|c| c.status == wanted)
                .map(|c| c.component)
                .collect::<Vec<_>>()
        };

        Self {
            status,
            score,
            ready_for_traffic,
            degraded_components: with_status(HealthStatus::Degraded),
            failed_components: with_status(HealthStatus::Unhealthy),
            checked_at: Utc::now(),
            components,
        }
    }

    pub fn component(&self, component: Component) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == component)
    }
}

/// Answer to "is the process alive".
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub status: HealthStatus,
    pub message: String,
    pub uptime_secs: f64,
    pub checked_at: DateTime<Utc>,
}
