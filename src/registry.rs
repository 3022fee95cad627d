use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::types::{EndpointConfig, HealthStatus};

const EWMA_ALPHA: f64 = 0.2;
const FAILURES_TO_DOWN: u32 = 3;
const MAX_PROBE_BACKOFF_SECS: u64 = 300;

/// Point-in-time view of one endpoint, cloned out per dispatch so readers
/// never hold the registry lock across I/O.
#[derive(Clone, Debug)]
pub struct EndpointSnapshot {
    pub config: EndpointConfig,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    pub total_requests: u64,
}

impl EndpointSnapshot {
    pub fn eligible(&self) -> bool {
        self.config.is_active
            && matches!(self.health, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

#[derive(Debug)]
struct EndpointEntry {
    config: EndpointConfig,
    health: HealthStatus,
    consecutive_failures: u32,
    avg_latency_ms: f64,
    total_requests: u64,
    next_check_at_ms: u64,
    permits: Arc<Semaphore>,
}

impl EndpointEntry {
    fn new(config: EndpointConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Self {
            config,
            health: HealthStatus::Unknown,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            total_requests: 0,
            next_check_at_ms: 0,
            permits,
        }
    }

    fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            config: self.config.clone(),
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            avg_latency_ms: self.avg_latency_ms,
            total_requests: self.total_requests,
        }
    }

    fn observe_latency(&mut self, latency_ms: u64) {
        let sample = latency_ms as f64;
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = sample;
        } else {
            self.avg_latency_ms = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * self.avg_latency_ms;
        }
    }

    fn on_success(&mut self) {
        self.health = HealthStatus::Healthy;
        self.consecutive_failures = 0;
    }

    fn on_probe_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.health = match self.health {
            HealthStatus::Down => HealthStatus::Down,
            _ if self.consecutive_failures >= FAILURES_TO_DOWN => HealthStatus::Down,
            _ => HealthStatus::Degraded,
        };
    }

    /// Request outcomes share the failure counter but only demote at the
    /// down threshold; a single failed request leaves a healthy endpoint in
    /// rotation until a probe says otherwise.
    fn on_request_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= FAILURES_TO_DOWN {
            self.health = HealthStatus::Down;
        }
    }
}

/// Process-wide live state for every configured endpoint: health, latency
/// EWMA, in-flight permits, probe schedule. One writer discipline: the health
/// scheduler and the proxy apply transitions through the methods below, and
/// everything else reads snapshots.
#[derive(Default)]
pub struct EndpointRegistry {
    inner: Mutex<HashMap<String, EndpointEntry>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configured set, preserving live state for endpoints that
    /// are still present and active. Deactivated or removed endpoints drop
    /// out of selection immediately.
    pub async fn load(&self, configs: Vec<EndpointConfig>) {
        let mut inner = self.inner.lock().await;
        let mut next: HashMap<String, EndpointEntry> = HashMap::new();
        for config in configs {
            if !config.is_active {
                continue;
            }
            match inner.remove(&config.id) {
                Some(mut entry) => {
                    if entry.config.max_concurrent_requests != config.max_concurrent_requests {
                        entry.permits =
                            Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
                    }
                    entry.config = config;
                    next.insert(entry.config.id.clone(), entry);
                }
                None => {
                    next.insert(config.id.clone(), EndpointEntry::new(config));
                }
            }
        }
        *inner = next;
    }

    pub async fn snapshot_for_model(&self, model_id: &str) -> Vec<EndpointSnapshot> {
        let inner = self.inner.lock().await;
        let mut out: Vec<EndpointSnapshot> = inner
            .values()
            .filter(|entry| entry.config.model_id == model_id)
            .map(EndpointEntry::snapshot)
            .collect();
        out.sort_by(|a, b| {
            a.config
                .routing_priority
                .cmp(&b.config.routing_priority)
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        out
    }

    pub async fn snapshot_all(&self) -> Vec<EndpointSnapshot> {
        let inner = self.inner.lock().await;
        let mut out: Vec<EndpointSnapshot> =
            inner.values().map(EndpointEntry::snapshot).collect();
        out.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        out
    }

    /// Claims an in-flight slot; `None` means the endpoint is at its
    /// `max_concurrent_requests` cap.
    pub async fn try_acquire(&self, endpoint_id: &str) -> Option<OwnedSemaphorePermit> {
        let inner = self.inner.lock().await;
        let entry = inner.get(endpoint_id)?;
        entry.permits.clone().try_acquire_owned().ok()
    }

    pub async fn available_permits(&self, endpoint_id: &str) -> Option<usize> {
        let inner = self.inner.lock().await;
        inner
            .get(endpoint_id)
            .map(|entry| entry.permits.available_permits())
    }

    /// Probe outcome: transition plus the next probe slot.
    pub async fn record_probe_success(&self, endpoint_id: &str, latency_ms: u64, now_ms: u64) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(endpoint_id) else {
            return;
        };
        entry.on_success();
        entry.observe_latency(latency_ms);
        entry.next_check_at_ms = now_ms + entry.config.health_check_interval_secs * 1000;
    }

    pub async fn record_probe_failure(&self, endpoint_id: &str, now_ms: u64) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(endpoint_id) else {
            return;
        };
        entry.on_probe_failure();
        let backoff_secs = entry
            .config
            .health_check_interval_secs
            .saturating_mul(1u64 << entry.consecutive_failures.min(16))
            .min(MAX_PROBE_BACKOFF_SECS);
        entry.next_check_at_ms = now_ms + backoff_secs * 1000;
    }

    /// Real-request outcome: same transition table as probes, plus the
    /// dispatch counters. Probe scheduling is left alone.
    pub async fn record_request_success(&self, endpoint_id: &str, latency_ms: u64) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(endpoint_id) else {
            return;
        };
        entry.on_success();
        entry.observe_latency(latency_ms);
        entry.total_requests = entry.total_requests.saturating_add(1);
    }

    pub async fn record_request_failure(&self, endpoint_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(endpoint_id) else {
            return;
        };
        entry.on_request_failure();
        entry.total_requests = entry.total_requests.saturating_add(1);
    }

    pub async fn due_probes(&self, now_ms: u64, batch: usize) -> Vec<EndpointConfig> {
        let inner = self.inner.lock().await;
        let mut due: Vec<(&EndpointEntry, u64)> = inner
            .values()
            .filter(|entry| entry.next_check_at_ms <= now_ms)
            .map(|entry| (entry, entry.next_check_at_ms))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.into_iter()
            .take(batch)
            .map(|(entry, _)| entry.config.clone())
            .collect()
    }
}
