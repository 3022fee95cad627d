use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::OwnedSemaphorePermit;

use crate::error::GatewayError;
use crate::registry::{EndpointRegistry, EndpointSnapshot};
use crate::types::{HealthStatus, RoutingStrategy};

/// A chosen endpoint plus its claimed in-flight slot. Dropping the selection
/// releases the slot.
#[derive(Debug)]
pub struct Selection {
    pub endpoint: EndpointSnapshot,
    pub permit: OwnedSemaphorePermit,
}

/// Health-aware endpoint selection: healthy candidates by routing priority,
/// degraded ones only when no healthy endpoint exists, ties broken by the
/// candidates' routing strategy.
pub struct LoadBalancer {
    registry: Arc<EndpointRegistry>,
    round_robin: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    /// Picks one endpoint for `model_id`, skipping `exclude` (endpoints this
    /// request already failed on) and endpoints at their concurrency cap.
    pub async fn select(
        &self,
        model_id: &str,
        seed: &str,
        exclude: &[String],
    ) -> Result<Selection, GatewayError> {
        let snapshots = self.registry.snapshot_for_model(model_id).await;
        let usable: Vec<EndpointSnapshot> = snapshots
            .into_iter()
            .filter(|snap| snap.eligible() && !exclude.contains(&snap.config.id))
            .collect();

        let healthy: Vec<EndpointSnapshot> = usable
            .iter()
            .filter(|snap| snap.health == HealthStatus::Healthy)
            .cloned()
            .collect();
        let candidates = if healthy.is_empty() {
            usable
        } else {
            healthy
        };

        if candidates.is_empty() {
            return Err(GatewayError::NoEndpoint {
                model: model_id.to_string(),
            });
        }

        let ordered = self.order_candidates(model_id, seed, candidates).await;
        for snapshot in ordered {
            if let Some(permit) = self.registry.try_acquire(&snapshot.config.id).await {
                return Ok(Selection {
                    endpoint: snapshot,
                    permit,
                });
            }
        }

        Err(GatewayError::Overloaded {
            model: model_id.to_string(),
        })
    }

    /// Priority classes stay in order; within each equal-priority class the
    /// class's strategy decides the order.
    async fn order_candidates(
        &self,
        model_id: &str,
        seed: &str,
        candidates: Vec<EndpointSnapshot>,
    ) -> Vec<EndpointSnapshot> {
        let mut classes: Vec<(i32, Vec<EndpointSnapshot>)> = Vec::new();
        for snapshot in candidates {
            let priority = snapshot.config.routing_priority;
            match classes.iter_mut().find(|(p, _)| *p == priority) {
                Some((_, class)) => class.push(snapshot),
                None => classes.push((priority, vec![snapshot])),
            }
        }
        classes.sort_by_key(|(priority, _)| *priority);

        let mut out = Vec::new();
        for (_, mut class) in classes {
            if class.len() > 1 {
                self.order_class(model_id, seed, &mut class).await;
            }
            out.extend(class);
        }
        out
    }

    async fn order_class(&self, model_id: &str, seed: &str, class: &mut Vec<EndpointSnapshot>) {
        match class[0].config.routing_strategy {
            RoutingStrategy::RoundRobin => {
                let start = self.next_round_robin(model_id) % class.len();
                class.rotate_left(start);
            }
            RoutingStrategy::UsageBased => {
                let mut free: HashMap<String, usize> = HashMap::new();
                for snapshot in class.iter() {
                    let permits = self
                        .registry
                        .available_permits(&snapshot.config.id)
                        .await
                        .unwrap_or(0);
                    free.insert(snapshot.config.id.clone(), permits);
                }
                // Fewest in-flight first, i.e. most free permits.
                class.sort_by(|a, b| {
                    free.get(&b.config.id)
                        .cmp(&free.get(&a.config.id))
                        .then_with(|| a.config.id.cmp(&b.config.id))
                });
            }
            RoutingStrategy::LatencyBased => {
                class.sort_by(|a, b| {
                    a.avg_latency_ms
                        .partial_cmp(&b.avg_latency_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.config.id.cmp(&b.config.id))
                });
            }
            RoutingStrategy::Random => {
                let start = (hash64_fnv1a(seed.as_bytes()) as usize) % class.len();
                class.rotate_left(start);
            }
        }
    }

    fn next_round_robin(&self, model_id: &str) -> usize {
        let counter = {
            let mut counters = self.round_robin.lock().expect("round robin poisoned");
            counters
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone()
        };
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

fn hash64_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
