//! Per-target admission control.
//!
//! Every external target can be given a [`ServiceLimit`]: a cap on in-flight
//! requests plus a 60-second sliding-window rate limit. Targets without a
//! limit are never throttled.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::metrics::MetricsCollector;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Longest a waiter sleeps before re-checking its slot.
const MAX_WAIT_STEP: Duration = Duration::from_secs(1);

/// Limits for one external target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLimit {
    pub max_concurrent: usize,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
}

fn default_requests_per_minute() -> usize {
    60
}

impl ServiceLimit {
    pub fn new(max_concurrent: usize, requests_per_minute: usize) -> Self {
        Self {
            max_concurrent,
            requests_per_minute,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("Service '{service}' has {active}/{max} requests in flight")]
    Saturated {
        service: String,
        active: usize,
        max: usize,
    },

    #[error("Service '{service}' exceeded {limit} requests per minute")]
    RateLimited { service: String, limit: usize },
}

/// Current admission state of one target.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub active_requests: usize,
    pub max_concurrent: usize,
    pub requests_last_minute: usize,
    pub rate_limit: usize,
    pub utilization_percent: f64,
}

#[derive(Debug)]
struct Slots {
    limit: ServiceLimit,
    active: usize,
    started: VecDeque<Instant>,
}

impl Slots {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.started.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                self.started.pop_front();
            } else {
                break;
            }
        }
    }

    /// How long until the oldest request leaves the rate window.
    fn rate_wait(&self, now: Instant) -> Duration {
        self.started
            .front()
            .map(|oldest| RATE_WINDOW.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(Duration::ZERO)
    }
}

/// Concurrency and rate limits per external target.
pub struct ConcurrencyThrottler {
    services: Mutex<HashMap<String, Slots>>,
    released: Notify,
    metrics: MetricsCollector,
}

impl ConcurrencyThrottler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            released: Notify::new(),
            metrics,
        }
    }

    /// Sets (or replaces) the limits for `service`.
    pub fn add_service_limit(&self, service: impl Into<String>, limit: ServiceLimit) {
        let service = service.into();
        info!(
            service = %service,
            max_concurrent = limit.max_concurrent,
            requests_per_minute = limit.requests_per_minute,
            "Added service limit"
        );
        let mut services = self.services.lock();
        match services.get_mut(&service) {
            Some(slots) => slots.limit = limit,
            None => {
                services.insert(
                    service,
                    Slots {
                        limit,
                        active: 0,
                        started: VecDeque::new(),
                    },
                );
            }
        }
        drop(services);
        self.released.notify_waiters();
    }

    /// Admits one request for `service` or explains why not.
    pub fn try_acquire(&self, service: &str) -> Result<(), ThrottleError> {
        let now = Instant::now();
        let mut services = self.services.lock();
        let Some(slots) = services.get_mut(service) else {
            return Ok(());
        };

        if slots.active >= slots.limit.max_concurrent {
            self.metrics.record_throttle_rejection(service);
            return Err(ThrottleError::Saturated {
                service: service.to_string(),
                active: slots.active,
                max: slots.limit.max_concurrent,
            });
        }

        slots.prune(now);
        if slots.started.len() >= slots.limit.requests_per_minute {
            self.metrics.record_throttle_rejection(service);
            return Err(ThrottleError::RateLimited {
                service: service.to_string(),
                limit: slots.limit.requests_per_minute,
            });
        }

        slots.active += 1;
        slots.started.push_back(now);
        Ok(())
    }

    /// Admits one request for `service`; false when it must wait.
    pub fn acquire_slot(&self, service: &str) -> bool {
        self.try_acquire(service).is_ok()
    }

    pub fn release_slot(&self, service: &str) {
        if let Some(slots) = self.services.lock().get_mut(service) {
            slots.active = slots.active.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    /// Waits until a slot for `service` is free and holds it until the guard drops.
    pub async fn wait_for_slot(self: &Arc<Self>, service: &str) -> SlotGuard {
        loop {
            let released = self.released.notified();
            match self.try_acquire(service) {
                Ok(()) => {
                    return SlotGuard {
                        throttler: Arc::clone(self),
                        service: service.to_string(),
                        released: false,
                    };
                }
                Err(e) => {
                    let wait = match e {
                        ThrottleError::RateLimited { .. } => self
                            .services
                            .lock()
                            .get(service)
                            .map(|s| s.rate_wait(Instant::now()))
                            .unwrap_or(MAX_WAIT_STEP)
                            .min(MAX_WAIT_STEP),
                        ThrottleError::Saturated { .. } => MAX_WAIT_STEP,
                    };
                    debug!(service = %service, reason = %e, "Waiting for throttler slot");
                    tokio::select! {
                        _ = released => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    pub fn service_status(&self, service: &str) -> Option<ServiceStatus> {
        let now = Instant::now();
        let mut services = self.services.lock();
        let slots = services.get_mut(service)?;
        slots.prune(now);
        Some(ServiceStatus {
            active_requests: slots.active,
            max_concurrent: slots.limit.max_concurrent,
            requests_last_minute: slots.started.len(),
            rate_limit: slots.limit.requests_per_minute,
            utilization_percent: slots.active as f64 / slots.limit.max_concurrent.max(1) as f64
                * 100.0,
        })
    }

    pub fn all_status(&self) -> BTreeMap<String, ServiceStatus> {
        let names: Vec<String> = self.services.lock().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.service_status(&name).map(|s| (name, s)))
            .collect()
    }
}

/// A held throttler slot, released on drop.
pub struct SlotGuard {
    throttler: Arc<ConcurrencyThrottler>,
    service: String,
    released: bool,
}

impl SlotGuard {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.throttler.release_slot(&self.service);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
