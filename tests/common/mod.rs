#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, Response};
use serde_json::Value;
use tower::ServiceExt;

use sekisho::auth::generate_api_key;
use sekisho::kv::MemoryKv;
use sekisho::settings::Settings;
use sekisho::store::SqliteStore;
use sekisho::types::{
    now_epoch_millis, ApiKeyRecord, AppRecord, EndpointConfig, EndpointKind, ModelConfig,
    PaymentStatus, RoutingStrategy, UsageRecord, UserRecord,
};
use sekisho::{GatewayState, UsageStatus};

pub const SHARED_SECRET: &str = "test-shared-secret";

pub struct TestGateway {
    pub dir: tempfile::TempDir,
    pub store: SqliteStore,
    pub state: GatewayState,
    pub api_key_plaintext: String,
}

impl TestGateway {
    pub fn router(&self) -> axum::Router {
        sekisho::router(self.state.clone())
    }

    pub async fn add_endpoint(&self, endpoint: EndpointConfig) {
        let id = endpoint.id.clone();
        self.store.upsert_endpoint(&endpoint).await.unwrap();
        self.state.reload_endpoints().await.unwrap();
        self.state
            .registry()
            .record_probe_success(&id, 50, now_epoch_millis())
            .await;
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.store
            .usage_records_for_month(&sekisho::types::current_month())
            .await
            .unwrap()
    }

    /// Streaming settlement runs after the response body is consumed; poll
    /// briefly for the terminal record.
    pub async fn wait_for_record(&self, status: UsageStatus) -> UsageRecord {
        for _ in 0..40 {
            if let Some(record) = self
                .usage_records()
                .await
                .into_iter()
                .find(|record| record.status == status)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no {status:?} usage record appeared");
    }

    pub async fn api_key(&self) -> ApiKeyRecord {
        self.store
            .api_key_by_id("key-1")
            .await
            .unwrap()
            .expect("key-1")
    }
}

pub async fn gateway() -> TestGateway {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("gw.db"));
    store.init().await.unwrap();

    let settings = Settings {
        gateway_shared_secret: SHARED_SECRET.to_string(),
        spool_dir: dir.path().join("spool"),
        default_rate_limit_rpm: 60,
        ..Settings::default()
    };

    seed_user(&store, "owner-1").await;
    seed_model(&store, "gpt-4o", 2.5, 10.0).await;

    let generated = generate_api_key("sk-gate-");
    store
        .upsert_api_key(&ApiKeyRecord {
            id: "key-1".to_string(),
            user_oid: "owner-1".to_string(),
            secret_digest: generated.secret_digest.clone(),
            salt: generated.salt.clone(),
            display_prefix: generated.display_prefix.clone(),
            rate_limit_rpm: 60,
            budget_monthly_jpy_micros: None,
            usage_current_month_jpy_micros: 0,
            last_reset_month: sekisho::types::current_month(),
            allowed_models: None,
            allowed_ips: None,
            is_active: true,
            expires_at: None,
        })
        .await
        .unwrap();

    let state = GatewayState::build(settings, store.clone(), Arc::new(MemoryKv::new()));

    TestGateway {
        dir,
        store,
        state,
        api_key_plaintext: generated.plaintext,
    }
}

pub async fn seed_user(store: &SqliteStore, oid: &str) {
    store
        .upsert_user(&UserRecord {
            oid: oid.to_string(),
            email: format!("{oid}@example.test"),
            payment_status: PaymentStatus::Active,
            payment_valid_until: None,
            total_cost_jpy_micros: 0,
        })
        .await
        .unwrap();
}

pub async fn seed_app(store: &SqliteStore, app_id: &str, owner_oid: &str) {
    store
        .upsert_app(&AppRecord {
            app_id: app_id.to_string(),
            name: app_id.to_string(),
            owner_oid: owner_oid.to_string(),
            is_active: true,
        })
        .await
        .unwrap();
}

pub async fn seed_model(store: &SqliteStore, id: &str, input_cost: f64, output_cost: f64) {
    store
        .upsert_model(&ModelConfig {
            id: id.to_string(),
            upstream_name: id.to_string(),
            provider: "vllm".to_string(),
            input_cost,
            output_cost,
            context_window: 128_000,
            max_output_tokens: 16_384,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: false,
            traffic_weight: 1.0,
            is_active: true,
            fallback_models: Vec::new(),
            max_retries: 2,
        })
        .await
        .unwrap();
}

pub fn endpoint(id: &str, base_url: &str, priority: i32) -> EndpointConfig {
    EndpointConfig {
        id: id.to_string(),
        model_id: "gpt-4o".to_string(),
        kind: EndpointKind::Vllm,
        base_url: base_url.to_string(),
        routing_priority: priority,
        routing_strategy: RoutingStrategy::RoundRobin,
        timeout_secs: 30,
        max_concurrent_requests: 8,
        health_check_url: None,
        health_check_interval_secs: 60,
        health_check_timeout_secs: 5,
        is_active: true,
    }
}

pub fn chat_body(model: &str, content: &str, max_tokens: u32, stream: bool) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
        "max_tokens": max_tokens,
        "stream": stream,
    })
}

pub async fn post_chat(
    router: axum::Router,
    uri: &str,
    bearer: Option<&str>,
    extra_headers: &[(&str, &str)],
    body: &Value,
) -> Response<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    for (name, value) in extra_headers {
        request = request.header(*name, *value);
    }
    router
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

pub async fn response_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn response_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}
