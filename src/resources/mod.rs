//! Resource monitoring, adaptive scaling and per-target throttling.

pub mod monitor;
pub mod throttler;

pub use monitor::{
    efficiency_score, AdaptiveController, ControllerConfig, ControllerStats, FixedSampler,
    LoadInputs, ResourceMonitor, ResourceSampler, ResourceSnapshot, ResourceState,
    ResourceTrends, ScalingAction, SystemReading, SystemSampler, WorkerLoad,
};
pub use throttler::{ConcurrencyThrottler, ServiceLimit, ServiceStatus, SlotGuard, ThrottleError};
