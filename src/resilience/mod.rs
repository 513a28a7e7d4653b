//! Failure isolation for downstream targets.
//!
//! - [`circuit_breaker`]: per-target breakers that fail fast once a target is unhealthy
//! - [`fallback`]: degraded responses chosen from service health and the global service level

pub mod circuit_breaker;
pub mod fallback;

pub use circuit_breaker::{
    BreakerMetrics, BreakerSummary, CallError, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerManager, CircuitState, StateTransition,
};
pub use fallback::{
    FallbackConfig, FallbackExecution, FallbackManager, FallbackManagerConfig, FallbackMetrics,
    FallbackStrategy, HealthSummary, ServiceHealth, ServiceLevel,
};
