//! Liveness, readiness, health scoring and alerting.
//!
//! - [`checks`]: per-component checks and the weighted readiness aggregate
//! - [`alerts`]: threshold rules over engine metrics with active-alert tracking
//! - [`monitor`]: [`HealthMonitor`], which runs both against a live engine

pub mod alerts;
pub mod checks;
pub mod monitor;

pub use alerts::{
    default_rules, Alert, AlertCondition, AlertManager, AlertNotifier, AlertRule, AlertSeverity,
    AlertSummary,
};
pub use checks::{Component, ComponentHealth, HealthStatus, Liveness, Readiness};
pub use monitor::{health_score, HealthConfig, HealthDeps, HealthMonitor, ScoreInputs, SystemHealth};
