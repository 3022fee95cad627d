use std::sync::Arc;

use crate::error::GatewayError;
use crate::kv::{ReserveOutcome, SharedKv};
use crate::store::SqliteStore;
use crate::types::{current_month, ApiKeyRecord, ModelConfig};

/// A pre-flight hold on the worst-case cost of one request, later committed
/// to the actual cost or released. Keys without a monthly budget skip
/// reservation entirely.
#[derive(Clone, Debug)]
pub struct BudgetReservation {
    pub api_key_id: String,
    pub month: String,
    pub estimate_jpy_micros: u64,
}

impl BudgetReservation {
    fn pending_key(&self) -> String {
        pending_key(&self.api_key_id, &self.month)
    }
}

fn pending_key(api_key_id: &str, month: &str) -> String {
    format!("budget:pending:{api_key_id}:{month}")
}

/// Worst case for the request: every estimated input token plus the full
/// requested output allowance, at the model's per-million rates.
pub fn estimate_cost_jpy_micros(
    model: &ModelConfig,
    input_tokens_est: u32,
    max_output_tokens: u32,
) -> u64 {
    let input = input_tokens_est as f64 * model.input_cost;
    let output = max_output_tokens as f64 * model.output_cost;
    let total = input + output;
    if !total.is_finite() || total <= 0.0 {
        return 0;
    }
    total.round() as u64
}

#[derive(Clone)]
pub struct BudgetLedger {
    store: SqliteStore,
    kv: Arc<dyn SharedKv>,
    http: reqwest::Client,
    reservation_ttl_slack_secs: u64,
    soft_limit_ratio: f64,
    warning_webhook_url: Option<String>,
}

impl BudgetLedger {
    pub fn new(
        store: SqliteStore,
        kv: Arc<dyn SharedKv>,
        reservation_ttl_slack_secs: u64,
        soft_limit_ratio: f64,
        warning_webhook_url: Option<String>,
    ) -> Self {
        Self {
            store,
            kv,
            http: reqwest::Client::new(),
            reservation_ttl_slack_secs,
            soft_limit_ratio,
            warning_webhook_url,
        }
    }

    /// Atomically holds the estimate against the key's monthly budget.
    ///
    /// The month lives in the pending-counter key, so rollover starts from an
    /// empty hold; the durable `usage_current_month` is reset in the same
    /// admission when `last_reset_month` disagrees with the current month.
    /// The hold's TTL reclaims reservations from workers that died before
    /// commit or release.
    pub async fn reserve(
        &self,
        key: &ApiKeyRecord,
        model: &ModelConfig,
        input_tokens_est: u32,
        max_output_tokens: u32,
        endpoint_timeout_secs: u64,
    ) -> Result<Option<BudgetReservation>, GatewayError> {
        let month = current_month();

        let mut spent = key.usage_current_month_jpy_micros;
        if key.last_reset_month != month {
            self.store.reset_monthly_usage(&key.id, &month).await?;
            spent = 0;
        }

        let Some(limit) = key.budget_monthly_jpy_micros else {
            return Ok(None);
        };

        let estimate = estimate_cost_jpy_micros(model, input_tokens_est, max_output_tokens);
        let ttl = endpoint_timeout_secs + self.reservation_ttl_slack_secs;

        let outcome = self
            .kv
            .reserve_budget(&pending_key(&key.id, &month), spent, limit, estimate, ttl)
            .await?;

        match outcome {
            ReserveOutcome::Reserved => {
                self.maybe_warn_soft_limit(key, &month, spent + estimate, limit)
                    .await;
                Ok(Some(BudgetReservation {
                    api_key_id: key.id.clone(),
                    month,
                    estimate_jpy_micros: estimate,
                }))
            }
            ReserveOutcome::Exceeded {
                attempted_jpy_micros,
            } => Err(GatewayError::BudgetExceeded {
                limit_jpy_micros: limit,
                attempted_jpy_micros,
            }),
        }
    }

    /// Post-flight reconciliation: charges the observed cost and returns the
    /// estimate to the pool. The durable increment lands first so a
    /// concurrent reserve can only over-count during the handoff, never
    /// under-count.
    pub async fn commit(
        &self,
        reservation: &BudgetReservation,
        actual_jpy_micros: u64,
    ) -> Result<(), GatewayError> {
        self.store
            .add_key_usage(&reservation.api_key_id, actual_jpy_micros)
            .await?;
        self.kv
            .release_reservation(&reservation.pending_key(), reservation.estimate_jpy_micros)
            .await?;
        Ok(())
    }

    /// Returns the hold without charging anything (cancellation, dispatch
    /// failure).
    pub async fn release(&self, reservation: &BudgetReservation) -> Result<(), GatewayError> {
        self.kv
            .release_reservation(&reservation.pending_key(), reservation.estimate_jpy_micros)
            .await?;
        Ok(())
    }

    /// Fires the warning webhook the first time a key's projected spend
    /// crosses the soft limit in a month. Delivery is at-least-once: the
    /// dedup claim is dropped again if the POST fails, so the next admission
    /// retries it.
    async fn maybe_warn_soft_limit(
        &self,
        key: &ApiKeyRecord,
        month: &str,
        projected_jpy_micros: u64,
        limit_jpy_micros: u64,
    ) {
        let Some(webhook_url) = self.warning_webhook_url.as_deref() else {
            return;
        };
        let threshold_pct = (self.soft_limit_ratio * 100.0).round() as u64;
        let soft_limit = (limit_jpy_micros as f64 * self.soft_limit_ratio) as u64;
        if projected_jpy_micros < soft_limit {
            return;
        }

        let dedup_key = format!("budget:warned:{}:{month}:{threshold_pct}", key.id);
        match self.kv.acquire_once(&dedup_key, 40 * 24 * 3600).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, "soft limit dedup check failed");
                return;
            }
        }

        let payload = serde_json::json!({
            "event": "budget_soft_limit",
            "api_key_id": key.id,
            "month": month,
            "threshold_pct": threshold_pct,
            "projected_jpy_micros": projected_jpy_micros,
            "budget_jpy_micros": limit_jpy_micros,
        });
        let sent = self
            .http
            .post(webhook_url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => {
                tracing::info!(api_key_id = %key.id, threshold_pct, "budget soft limit warning sent");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "budget warning webhook rejected");
                let _ = self.kv.cache_delete(&dedup_key).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "budget warning webhook failed");
                let _ = self.kv.cache_delete(&dedup_key).await;
            }
        }
    }
}
