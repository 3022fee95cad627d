use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;

use crate::registry::EndpointRegistry;
use crate::types::{now_epoch_millis, EndpointConfig};

/// Aborts the wrapped task when the owner goes away.
pub struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
    pub fn new(handle: tokio::task::AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Background prober: visits endpoints whose `next_check_at` has elapsed and
/// feeds the outcomes into the registry's transition table.
#[derive(Clone)]
pub struct HealthChecker {
    registry: Arc<EndpointRegistry>,
    http: reqwest::Client,
    poll_interval: Duration,
    batch_size: usize,
}

impl HealthChecker {
    pub fn new(registry: Arc<EndpointRegistry>, poll_interval_secs: u64, batch_size: usize) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
            batch_size: batch_size.max(1),
        }
    }

    pub fn spawn(self) -> AbortOnDrop {
        let handle = tokio::spawn(async move {
            loop {
                self.run_due_probes().await;
                tokio::time::sleep(self.poll_interval).await;
            }
        });
        AbortOnDrop::new(handle.abort_handle())
    }

    /// One scheduler pass; probes within a batch run concurrently.
    pub async fn run_due_probes(&self) {
        let now_ms = now_epoch_millis();
        let due = self.registry.due_probes(now_ms, self.batch_size).await;
        if due.is_empty() {
            return;
        }

        let probes = due.into_iter().map(|endpoint| {
            let checker = self.clone();
            async move { checker.probe(endpoint).await }
        });
        join_all(probes).await;
    }

    async fn probe(&self, endpoint: EndpointConfig) {
        let url = probe_url(&endpoint);
        let timeout = Duration::from_secs(endpoint.health_check_timeout_secs.max(1));
        let started = Instant::now();

        let outcome = self.http.get(&url).timeout(timeout).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let now_ms = now_epoch_millis();

        match outcome {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(endpoint_id = %endpoint.id, latency_ms, "health check passed");
                self.registry
                    .record_probe_success(&endpoint.id, latency_ms, now_ms)
                    .await;
            }
            Ok(response) => {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    status = response.status().as_u16(),
                    "health check returned non-success"
                );
                self.registry.record_probe_failure(&endpoint.id, now_ms).await;
            }
            Err(err) => {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    error = %crate::sanitize::sanitize_message(&err.to_string()),
                    "health check failed"
                );
                self.registry.record_probe_failure(&endpoint.id, now_ms).await;
            }
        }
    }
}

fn probe_url(endpoint: &EndpointConfig) -> String {
    match endpoint.health_check_url.as_deref() {
        Some(url) if !url.trim().is_empty() => url.to_string(),
        _ => format!("{}/health", endpoint.base_url.trim_end_matches('/')),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointKind, HealthStatus, RoutingStrategy};

    fn endpoint(id: &str, base_url: &str, health_check_url: Option<String>) -> EndpointConfig {
        EndpointConfig {
            id: id.to_string(),
            model_id: "gpt-4o".to_string(),
            kind: EndpointKind::Vllm,
            base_url: base_url.to_string(),
            routing_priority: 1,
            routing_strategy: RoutingStrategy::RoundRobin,
            timeout_secs: 120,
            max_concurrent_requests: 4,
            health_check_url,
            health_check_interval_secs: 60,
            health_check_timeout_secs: 2,
            is_active: true,
        }
    }

    #[test]
    fn probe_url_defaults_to_base_health() {
        let plain = endpoint("ep-1", "http://10.0.0.1:8000/", None);
        assert_eq!(probe_url(&plain), "http://10.0.0.1:8000/health");

        let custom = endpoint(
            "ep-2",
            "http://10.0.0.1:8000",
            Some("http://10.0.0.1:8000/v1/models".to_string()),
        );
        assert_eq!(probe_url(&custom), "http://10.0.0.1:8000/v1/models");
    }

    #[tokio::test]
    async fn probe_outcomes_update_the_registry() {
        let upstream = httpmock::MockServer::start_async().await;
        upstream
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/health");
                then.status(200).body("ok");
            })
            .await;

        let registry = Arc::new(EndpointRegistry::new());
        registry
            .load(vec![
                endpoint("ep-good", &upstream.base_url(), None),
                // Connection refused: reserved TEST-NET-1 address.
                endpoint("ep-bad", "http://192.0.2.1:9", None),
            ])
            .await;

        let checker = HealthChecker::new(registry.clone(), 5, 50);
        checker.run_due_probes().await;

        let snaps = registry.snapshot_for_model("gpt-4o").await;
        let good = snaps.iter().find(|s| s.config.id == "ep-good").unwrap();
        let bad = snaps.iter().find(|s| s.config.id == "ep-bad").unwrap();

        assert_eq!(good.health, HealthStatus::Healthy);
        assert_eq!(good.consecutive_failures, 0);
        assert_eq!(bad.health, HealthStatus::Degraded);
        assert_eq!(bad.consecutive_failures, 1);
    }
}
