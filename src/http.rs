use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::auth::CredentialStore;
use crate::balancer::LoadBalancer;
use crate::budget::{BudgetLedger, BudgetReservation};
use crate::context::{estimate_chat_input_tokens, validate_context};
use crate::error::GatewayError;
use crate::kv::SharedKv;
use crate::observability::Observability;
use crate::principal::{resolve_delegation, Principal};
use crate::proxy::{DispatchContext, ProxyEngine};
use crate::ratelimit::RateLimiter;
use crate::registry::EndpointRegistry;
use crate::sanitize;
use crate::settings::Settings;
use crate::store::SqliteStore;
use crate::types::{now_epoch_secs, ModelConfig};
use crate::usage::UsageRecorder;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_RESERVATION_TIMEOUT_SECS: u64 = 120;

/// Shared handles for the request pipeline. Cheap to clone; axum clones it
/// per request.
#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    settings: Settings,
    store: SqliteStore,
    kv: Arc<dyn SharedKv>,
    credentials: CredentialStore,
    limiter: RateLimiter,
    budget: BudgetLedger,
    registry: Arc<EndpointRegistry>,
    proxy: ProxyEngine,
    recorder: UsageRecorder,
    observability: Arc<Observability>,
}

impl GatewayState {
    /// Wires the full pipeline from its three externals: settings, the
    /// durable store, and the shared KV store.
    pub fn build(settings: Settings, store: SqliteStore, kv: Arc<dyn SharedKv>) -> Self {
        let observability = Arc::new(Observability::default());
        let registry = Arc::new(EndpointRegistry::new());
        let balancer = Arc::new(LoadBalancer::new(registry.clone()));

        let credentials = CredentialStore::new(
            store.clone(),
            kv.clone(),
            settings.api_key_prefix.clone(),
            settings.gateway_shared_secret.clone(),
            settings.api_key_cache_ttl_secs,
            settings.api_key_negative_cache_ttl_secs,
        );
        let limiter = RateLimiter::new(kv.clone(), settings.default_rate_limit_rpm);
        let budget = BudgetLedger::new(
            store.clone(),
            kv.clone(),
            settings.budget_reservation_ttl_slack_secs,
            settings.budget_soft_limit_ratio,
            settings.budget_warning_webhook_url.clone(),
        );
        let recorder = UsageRecorder::new(
            store.clone(),
            observability.clone(),
            settings.spool_dir.clone(),
        );
        let proxy = ProxyEngine::new(
            registry.clone(),
            balancer,
            budget.clone(),
            recorder.clone(),
            store.clone(),
        );

        Self {
            inner: Arc::new(GatewayInner {
                settings,
                store,
                kv,
                credentials,
                limiter,
                budget,
                registry,
                proxy,
                recorder,
                observability,
            }),
        }
    }

    pub fn registry(&self) -> Arc<EndpointRegistry> {
        self.inner.registry.clone()
    }

    pub fn recorder(&self) -> UsageRecorder {
        self.inner.recorder.clone()
    }

    pub fn observability(&self) -> Arc<Observability> {
        self.inner.observability.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Loads the endpoint set from the durable store into the registry.
    pub async fn reload_endpoints(&self) -> Result<(), GatewayError> {
        let endpoints = self.inner.store.all_endpoints().await?;
        self.inner.registry.load(endpoints).await;
        Ok(())
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

async fn health(State(state): State<GatewayState>) -> Response {
    let store_ok = state.inner.store.ping().await.is_ok();
    let kv_ok = state.inner.kv.ping().await.is_ok();
    if store_ok && kv_ok {
        (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "store": store_ok,
                "kv": kv_ok,
            })),
        )
            .into_response()
    }
}

async fn metrics(State(state): State<GatewayState>) -> Response {
    Json(state.inner.observability.snapshot()).into_response()
}

/// Everything admission produced for dispatch.
struct Admitted {
    principal: Principal,
    model: ModelConfig,
    body: Value,
    stream: bool,
    estimated_input_tokens: u32,
    reservation: Option<BudgetReservation>,
    requested_model: String,
}

async fn chat_completions(
    State(state): State<GatewayState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inner = &state.inner;
    inner.observability.record_request();

    let request_id = header_string(&headers, "x-request-id").unwrap_or_else(generate_request_id);
    let started = Instant::now();

    let admission = tokio::time::timeout(
        Duration::from_secs(inner.settings.admission_timeout_secs.max(1)),
        admit(inner, &query, &headers, &body),
    )
    .await;

    let admitted = match admission {
        Err(_) => {
            tracing::warn!(request_id = %request_id, "admission timed out");
            return error_response(&GatewayError::AdmissionTimeout, &request_id);
        }
        Ok(Err(err)) => {
            match &err {
                GatewayError::RateLimited { .. } => inner.observability.record_rate_limited(),
                GatewayError::BudgetExceeded { .. } => inner.observability.record_budget_exceeded(),
                _ => inner.observability.record_rejected(),
            }
            tracing::info!(
                request_id = %request_id,
                code = %err.error_code(),
                "request rejected at admission"
            );
            return error_response(&err, &request_id);
        }
        Ok(Ok(admitted)) => admitted,
    };

    tracing::info!(
        request_id = %request_id,
        user_oid = %admitted.principal.user_oid,
        api_key_id = admitted.principal.api_key_id(),
        app_id = admitted.principal.app_id.as_deref(),
        model = %admitted.model.id,
        stream = admitted.stream,
        "request admitted"
    );

    let ctx = DispatchContext {
        request_id: request_id.clone(),
        principal: admitted.principal,
        requested_model: admitted.requested_model,
        estimated_input_tokens: admitted.estimated_input_tokens,
        reservation: admitted.reservation,
        ip_address: client_ip(&headers),
        user_agent: header_string(&headers, "user-agent"),
        started,
    };

    match inner
        .proxy
        .dispatch(ctx, admitted.model, admitted.body, admitted.stream)
        .await
    {
        Ok(response) => response,
        Err(err) => error_response(&err, &request_id),
    }
}

/// The admission pipeline in order: credentials, principal, user validation,
/// rate limit, model permission, context, budget reservation. Any failure
/// here is terminal and writes no usage record.
async fn admit(
    inner: &GatewayInner,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    raw_body: &Bytes,
) -> Result<Admitted, GatewayError> {
    if raw_body.len() > MAX_BODY_BYTES {
        return Err(GatewayError::Validation {
            reason: "request body too large".to_string(),
        });
    }
    let mut body: Value =
        serde_json::from_slice(raw_body).map_err(|err| GatewayError::Validation {
            reason: format!("invalid JSON body: {err}"),
        })?;
    if !body.is_object() {
        return Err(GatewayError::Validation {
            reason: "request body must be a JSON object".to_string(),
        });
    }

    let now = now_epoch_secs();
    let ip = client_ip(headers).unwrap_or_else(|| "unknown".to_string());

    // Delegation parameters may live in the body, so resolution happens
    // before authentication and may rewrite the payload.
    let delegation = resolve_delegation(query, headers, &mut body)?;

    let principal = if let Some(secret) = header_string(headers, "x-gateway-secret") {
        let Some(params) = delegation else {
            return Err(GatewayError::Unauthorized {
                reason: "x_user_oid and x_app_id are required with the gateway secret".to_string(),
            });
        };
        let (app, user) = inner
            .credentials
            .verify_delegation(&secret, &params.app_id, &params.user_oid)
            .await?;
        tracing::debug!(channel = params.channel.as_str(), app_id = %app.app_id, "delegation resolved");
        Principal {
            user_oid: user.oid,
            app_id: Some(app.app_id),
            api_key: None,
        }
    } else if let Some(bearer) = extract_bearer(headers) {
        let key = inner.credentials.verify_bearer(&bearer, &ip, now).await?;
        match delegation {
            Some(params) => {
                let app = inner.credentials.resolve_app(&params.app_id).await?;
                let user = inner.credentials.validate_user(&params.user_oid).await?;
                tracing::debug!(
                    channel = params.channel.as_str(),
                    app_id = %app.app_id,
                    "delegated billing resolved"
                );
                Principal {
                    user_oid: user.oid,
                    app_id: Some(app.app_id),
                    api_key: Some(key),
                }
            }
            None => {
                let user = inner.credentials.validate_user(&key.user_oid).await?;
                Principal {
                    user_oid: user.oid,
                    app_id: None,
                    api_key: Some(key),
                }
            }
        }
    } else {
        return Err(GatewayError::Unauthorized {
            reason: "no authentication provided".to_string(),
        });
    };

    inner.limiter.check(&principal, now).await?;

    let requested_model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| inner.settings.default_model.clone())
        .ok_or_else(|| GatewayError::Validation {
            reason: "model is required".to_string(),
        })?;

    let has_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|messages| !messages.is_empty());
    if !has_messages {
        return Err(GatewayError::Validation {
            reason: "messages must be a non-empty array".to_string(),
        });
    }

    let model = inner
        .store
        .model_by_id(&requested_model)
        .await?
        .filter(|model| model.is_active)
        .ok_or_else(|| GatewayError::Validation {
            reason: format!("model '{requested_model}' not found or inactive"),
        })?;

    if let Some(key) = &principal.api_key {
        if !key.allows_model(&model.id) {
            return Err(GatewayError::Forbidden {
                reason: format!("API key does not have access to model '{}'", model.id),
            });
        }
    }

    let estimated_input_tokens = estimate_chat_input_tokens(&model.id, &body);
    let requested_max_tokens = body
        .get("max_tokens")
        .and_then(Value::as_u64)
        .map(|value| value.min(u64::from(u32::MAX)) as u32);
    let requested_output = validate_context(&model, estimated_input_tokens, requested_max_tokens)?;

    let reservation = match &principal.api_key {
        Some(key) => {
            let ttl_basis = reservation_timeout_basis(inner, &model.id).await;
            inner
                .budget
                .reserve(key, &model, estimated_input_tokens, requested_output, ttl_basis)
                .await?
        }
        None => None,
    };

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    Ok(Admitted {
        principal,
        model,
        body,
        stream,
        estimated_input_tokens,
        reservation,
        requested_model,
    })
}

/// The reservation TTL tracks the slowest endpoint the request could land
/// on, so a crashed worker's hold outlives any legitimate in-flight request.
async fn reservation_timeout_basis(inner: &GatewayInner, model_id: &str) -> u64 {
    inner
        .registry
        .snapshot_for_model(model_id)
        .await
        .iter()
        .map(|snapshot| snapshot.config.timeout_secs)
        .max()
        .unwrap_or(DEFAULT_RESERVATION_TIMEOUT_SECS)
}

fn error_response(err: &GatewayError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match err {
        GatewayError::Internal(detail) => {
            tracing::error!(request_id = %request_id, detail = %detail, "internal error");
            "internal server error".to_string()
        }
        other => sanitize::sanitize_message(&other.to_string()),
    };

    let body = json!({
        "error": {
            "code": err.error_code(),
            "message": message,
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    if let GatewayError::RateLimited {
        retry_after_secs, ..
    } = err
    {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, header::AUTHORIZATION.as_str())?;
    raw.strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "x-forwarded-for")
        .map(|raw| raw.split(',').next().unwrap_or(&raw).trim().to_string())
        .or_else(|| header_string(headers, "x-real-ip"))
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("sekisho-{ts_ms}-{seq}")
}
