use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;

use crate::adapter;
use crate::balancer::{LoadBalancer, Selection};
use crate::budget::{BudgetLedger, BudgetReservation};
use crate::context::estimate_text_tokens;
use crate::error::GatewayError;
use crate::principal::Principal;
use crate::registry::EndpointRegistry;
use crate::sanitize;
use crate::sse::SseUsageTracker;
use crate::store::SqliteStore;
use crate::types::{
    now_epoch_millis, EndpointConfig, ModelConfig, TokenUsage, UsageRecord, UsageStatus,
};
use crate::usage::UsageRecorder;

const UPSTREAM_ERROR_BODY_CAP: usize = 64 * 1024;
const MAX_FALLBACK_CHAIN: usize = 4;

/// Everything admission resolved about one request, handed to dispatch.
pub struct DispatchContext {
    pub request_id: String,
    pub principal: Principal,
    pub requested_model: String,
    pub estimated_input_tokens: u32,
    pub reservation: Option<BudgetReservation>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub started: Instant,
}

/// Forwards one admitted request to a selected endpoint, streaming or
/// buffered, and guarantees exactly one terminal settlement (usage record,
/// reservation commit/release, endpoint health outcome) on every path,
/// including client disconnects mid-stream.
#[derive(Clone)]
pub struct ProxyEngine {
    http: reqwest::Client,
    registry: Arc<EndpointRegistry>,
    balancer: Arc<LoadBalancer>,
    budget: BudgetLedger,
    recorder: UsageRecorder,
    store: SqliteStore,
}

impl ProxyEngine {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        balancer: Arc<LoadBalancer>,
        budget: BudgetLedger,
        recorder: UsageRecorder,
        store: SqliteStore,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            registry,
            balancer,
            budget,
            recorder,
            store,
        }
    }

    /// Endpoint-level retries first, then fallback models, each with a fresh
    /// whitelist check. The rate limiter and the reservation are never
    /// touched again here; admission charged them once.
    pub async fn dispatch(
        &self,
        ctx: DispatchContext,
        model: ModelConfig,
        body: Value,
        client_stream: bool,
    ) -> Result<Response, GatewayError> {
        let mut attempted: Vec<String> = Vec::new();
        let mut models = vec![model];
        let mut seen_models: Vec<String> = vec![models[0].id.clone()];
        let mut last_err = GatewayError::NoEndpoint {
            model: models[0].id.clone(),
        };

        let mut model_idx = 0;
        while model_idx < models.len() {
            let model = models[model_idx].clone();
            let mut retries = 0u32;

            loop {
                let selection = match self
                    .balancer
                    .select(&model.id, &ctx.request_id, &attempted)
                    .await
                {
                    Ok(selection) => selection,
                    Err(err) => {
                        // After a real upstream attempt, an exhausted
                        // candidate set must not mask the upstream error.
                        if attempted.is_empty() {
                            last_err = err;
                        }
                        break;
                    }
                };
                let endpoint_id = selection.endpoint.config.id.clone();

                match self
                    .attempt(&ctx, &model, selection, &body, client_stream)
                    .await
                {
                    Ok(response) => return Ok(response),
                    Err(err) if err.is_retriable() => {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            endpoint_id = %endpoint_id,
                            error = %err,
                            "endpoint attempt failed, trying next candidate"
                        );
                        self.registry.record_request_failure(&endpoint_id).await;
                        attempted.push(endpoint_id);
                        last_err = err;
                        if retries >= model.max_retries {
                            break;
                        }
                        retries += 1;
                    }
                    Err(err) => {
                        if matches!(&err, GatewayError::Upstream { status, .. } if *status >= 500)
                        {
                            self.registry.record_request_failure(&endpoint_id).await;
                        }
                        self.settle_failed(&ctx, &model, Some(endpoint_id.as_str()), &err)
                            .await;
                        return Err(err);
                    }
                }
            }

            if seen_models.len() < MAX_FALLBACK_CHAIN {
                self.queue_fallbacks(&ctx, &model, &mut models, &mut seen_models)
                    .await;
            }
            model_idx += 1;
        }

        let last_model = models.last().cloned().unwrap_or_else(|| models[0].clone());
        self.settle_failed(&ctx, &last_model, None, &last_err).await;
        Err(last_err)
    }

    async fn queue_fallbacks(
        &self,
        ctx: &DispatchContext,
        model: &ModelConfig,
        models: &mut Vec<ModelConfig>,
        seen: &mut Vec<String>,
    ) {
        for fallback_id in &model.fallback_models {
            if seen.contains(fallback_id) || seen.len() >= MAX_FALLBACK_CHAIN {
                continue;
            }
            if let Some(key) = &ctx.principal.api_key {
                if !key.allows_model(fallback_id) {
                    continue;
                }
            }
            match self.store.model_by_id(fallback_id).await {
                Ok(Some(fallback)) if fallback.is_active => {
                    tracing::info!(
                        request_id = %ctx.request_id,
                        from = %model.id,
                        to = %fallback.id,
                        "queueing fallback model"
                    );
                    seen.push(fallback.id.clone());
                    models.push(fallback);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, fallback = %fallback_id, "fallback lookup failed");
                }
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &DispatchContext,
        model: &ModelConfig,
        selection: Selection,
        body: &Value,
        client_stream: bool,
    ) -> Result<Response, GatewayError> {
        let endpoint = selection.endpoint.config.clone();
        let native_sse = client_stream
            && model.supports_streaming
            && adapter::supports_native_sse(endpoint.kind);

        let upstream_request = adapter::build_upstream_request(
            endpoint.kind,
            &endpoint.base_url,
            &model.upstream_name,
            body,
            native_sse,
        );

        let total_deadline = Duration::from_secs(endpoint.timeout_secs.max(1));
        let ttfb_deadline = Duration::from_secs((endpoint.timeout_secs / 3).max(1));

        let send = self
            .http
            .post(&upstream_request.url)
            .json(&upstream_request.body)
            .timeout(total_deadline)
            .send();

        let response = match tokio::time::timeout(ttfb_deadline, send).await {
            Err(_) => return Err(GatewayError::UpstreamTimeout),
            Ok(Err(err)) => return Err(classify_transport_error(err)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let raw = response.bytes().await.unwrap_or_default();
            let capped = &raw[..raw.len().min(UPSTREAM_ERROR_BODY_CAP)];
            let body_text = String::from_utf8_lossy(capped);
            let (_, message) = sanitize::classify_upstream_error(status.as_u16(), &body_text);
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        if native_sse {
            self.stream_response(ctx, model, endpoint, selection.permit, response)
        } else {
            self.buffered_response(ctx, model, endpoint, selection.permit, response, client_stream)
                .await
        }
    }

    async fn buffered_response(
        &self,
        ctx: &DispatchContext,
        model: &ModelConfig,
        endpoint: EndpointConfig,
        permit: OwnedSemaphorePermit,
        response: reqwest::Response,
        client_stream: bool,
    ) -> Result<Response, GatewayError> {
        let ttft_ms = ctx.started.elapsed().as_millis() as u64;
        let bytes = response.bytes().await.map_err(|err| GatewayError::Upstream {
            status: 502,
            message: sanitize::sanitize_message(&err.to_string()),
        })?;
        let latency_ms = ctx.started.elapsed().as_millis() as u64;

        let upstream_json: Value =
            serde_json::from_slice(&bytes).map_err(|_| GatewayError::Upstream {
                status: 502,
                message: "upstream returned a non-JSON response".to_string(),
            })?;

        let actual_model = upstream_json
            .get("model")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(&model.id)
            .to_string();
        let reported_usage = adapter::parse_buffered_usage(endpoint.kind, &upstream_json);
        let translated = adapter::translate_buffered_response(
            endpoint.kind,
            &ctx.request_id,
            &ctx.requested_model,
            upstream_json,
        );
        let usage = reported_usage.unwrap_or_else(|| TokenUsage {
            input_tokens: ctx.estimated_input_tokens,
            output_tokens: adapter::response_content_text(&translated)
                .map(|content| estimate_text_tokens(&model.id, content))
                .unwrap_or(0),
            ..TokenUsage::default()
        });
        let cost_jpy_micros = model.cost_jpy_micros(&usage);

        if let Some(reservation) = &ctx.reservation {
            if let Err(err) = self.budget.commit(reservation, cost_jpy_micros).await {
                tracing::error!(request_id = %ctx.request_id, error = %err, "reservation commit failed");
            }
        }
        self.registry
            .record_request_success(&endpoint.id, latency_ms)
            .await;
        self.recorder
            .record(UsageRecord {
                request_id: ctx.request_id.clone(),
                user_oid: ctx.principal.user_oid.clone(),
                api_key_id: ctx.principal.api_key_id().map(str::to_string),
                app_id: ctx.principal.app_id.clone(),
                ip_address: ctx.ip_address.clone(),
                user_agent: ctx.user_agent.clone(),
                requested_model: ctx.requested_model.clone(),
                actual_model: Some(actual_model),
                endpoint_id: Some(endpoint.id.clone()),
                usage,
                cost_jpy_micros,
                status: UsageStatus::Completed,
                error_code: None,
                error_message: None,
                latency_ms: Some(latency_ms),
                ttft_ms: Some(ttft_ms),
                created_at_ms: now_epoch_millis(),
            })
            .await;
        drop(permit);

        if client_stream {
            let payload = format!("data: {translated}\n\ndata: [DONE]\n\n");
            Ok(sse_response(&ctx.request_id, Body::from(payload)))
        } else {
            let mut response = Response::new(Body::from(translated.to_string()));
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            insert_request_id(&mut response, &ctx.request_id);
            Ok(response)
        }
    }

    fn stream_response(
        &self,
        ctx: &DispatchContext,
        model: &ModelConfig,
        endpoint: EndpointConfig,
        permit: OwnedSemaphorePermit,
        response: reqwest::Response,
    ) -> Result<Response, GatewayError> {
        let upstream: BoxStream<'static, Result<Bytes, std::io::Error>> = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        let finalizer = StreamFinalizer {
            budget: self.budget.clone(),
            recorder: self.recorder.clone(),
            registry: self.registry.clone(),
            reservation: ctx.reservation.clone(),
            request_id: ctx.request_id.clone(),
            user_oid: ctx.principal.user_oid.clone(),
            api_key_id: ctx.principal.api_key_id().map(str::to_string),
            app_id: ctx.principal.app_id.clone(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            requested_model: ctx.requested_model.clone(),
            model: model.clone(),
            endpoint_id: endpoint.id.clone(),
            estimated_input_tokens: ctx.estimated_input_tokens,
            started: ctx.started,
        };

        let state = ProxyStreamState {
            upstream,
            tracker: SseUsageTracker::default(),
            ttft_ms: None,
            started: ctx.started,
            finalizer: Some(finalizer),
            _permit: permit,
        };

        let stream = futures_util::stream::try_unfold(state, |mut state| async move {
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    if state.ttft_ms.is_none() {
                        state.ttft_ms = Some(state.started.elapsed().as_millis() as u64);
                    }
                    state.tracker.ingest(&chunk);
                    Ok(Some((chunk, state)))
                }
                Some(Err(err)) => {
                    state.finalize_now(StreamEnd::Error).await;
                    Err(err)
                }
                None => {
                    state.finalize_now(StreamEnd::Completed).await;
                    Ok(None)
                }
            }
        });

        Ok(sse_response(&ctx.request_id, Body::from_stream(stream)))
    }

    async fn settle_failed(
        &self,
        ctx: &DispatchContext,
        model: &ModelConfig,
        endpoint_id: Option<&str>,
        err: &GatewayError,
    ) {
        if let Some(reservation) = &ctx.reservation {
            if let Err(release_err) = self.budget.release(reservation).await {
                tracing::error!(request_id = %ctx.request_id, error = %release_err, "reservation release failed");
            }
        }

        let latency_ms = ctx.started.elapsed().as_millis() as u64;
        self.recorder
            .record(UsageRecord {
                request_id: ctx.request_id.clone(),
                user_oid: ctx.principal.user_oid.clone(),
                api_key_id: ctx.principal.api_key_id().map(str::to_string),
                app_id: ctx.principal.app_id.clone(),
                ip_address: ctx.ip_address.clone(),
                user_agent: ctx.user_agent.clone(),
                requested_model: ctx.requested_model.clone(),
                actual_model: Some(model.id.clone()),
                endpoint_id: endpoint_id.map(str::to_string),
                usage: TokenUsage::default(),
                cost_jpy_micros: 0,
                status: UsageStatus::Failed,
                error_code: Some(err.error_code()),
                error_message: Some(sanitize::sanitize_message(&err.to_string())),
                latency_ms: Some(latency_ms),
                ttft_ms: None,
                created_at_ms: now_epoch_millis(),
            })
            .await;
    }
}

fn classify_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::UpstreamTimeout;
    }
    GatewayError::Upstream {
        status: 502,
        message: sanitize::sanitize_message(&err.to_string()),
    }
}

fn sse_response(request_id: &str, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    insert_request_id(&mut response, request_id);
    response
}

fn insert_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
}

#[derive(Clone, Copy, Debug)]
enum StreamEnd {
    Completed,
    Error,
    Cancelled,
}

/// Owns everything needed to settle a streaming request once. Consumed by
/// exactly one of: normal completion, upstream error, or the Drop path when
/// the client disconnects.
struct StreamFinalizer {
    budget: BudgetLedger,
    recorder: UsageRecorder,
    registry: Arc<EndpointRegistry>,
    reservation: Option<BudgetReservation>,
    request_id: String,
    user_oid: String,
    api_key_id: Option<String>,
    app_id: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    requested_model: String,
    model: ModelConfig,
    endpoint_id: String,
    estimated_input_tokens: u32,
    started: Instant,
}

impl StreamFinalizer {
    async fn finalize(
        self,
        end: StreamEnd,
        observed_usage: Option<TokenUsage>,
        actual_model: Option<String>,
        streamed_content: String,
        ttft_ms: Option<u64>,
    ) {
        let usage = observed_usage.unwrap_or_else(|| TokenUsage {
            input_tokens: self.estimated_input_tokens,
            output_tokens: estimate_text_tokens(&self.model.id, &streamed_content),
            ..TokenUsage::default()
        });
        let cost_jpy_micros = self.model.cost_jpy_micros(&usage);
        let latency_ms = self.started.elapsed().as_millis() as u64;

        let (status, error_code, error_message) = match end {
            StreamEnd::Completed => (UsageStatus::Completed, None, None),
            StreamEnd::Error => (
                UsageStatus::Failed,
                Some("upstream_stream_aborted".to_string()),
                Some("upstream closed the stream before completion".to_string()),
            ),
            StreamEnd::Cancelled => (
                UsageStatus::Cancelled,
                Some("client_disconnected".to_string()),
                None,
            ),
        };

        match end {
            StreamEnd::Completed => {
                if let Some(reservation) = &self.reservation {
                    if let Err(err) = self.budget.commit(reservation, cost_jpy_micros).await {
                        tracing::error!(request_id = %self.request_id, error = %err, "reservation commit failed");
                    }
                }
                self.registry
                    .record_request_success(&self.endpoint_id, latency_ms)
                    .await;
            }
            StreamEnd::Error => {
                if let Some(reservation) = &self.reservation {
                    if let Err(err) = self.budget.release(reservation).await {
                        tracing::error!(request_id = %self.request_id, error = %err, "reservation release failed");
                    }
                }
                self.registry.record_request_failure(&self.endpoint_id).await;
            }
            StreamEnd::Cancelled => {
                if let Some(reservation) = &self.reservation {
                    if let Err(err) = self.budget.release(reservation).await {
                        tracing::error!(request_id = %self.request_id, error = %err, "reservation release failed");
                    }
                }
            }
        }

        self.recorder
            .record(UsageRecord {
                request_id: self.request_id.clone(),
                user_oid: self.user_oid,
                api_key_id: self.api_key_id,
                app_id: self.app_id,
                ip_address: self.ip_address,
                user_agent: self.user_agent,
                requested_model: self.requested_model,
                actual_model: actual_model.or(Some(self.model.id.clone())),
                endpoint_id: Some(self.endpoint_id),
                usage,
                cost_jpy_micros: match status {
                    UsageStatus::Failed => 0,
                    _ => cost_jpy_micros,
                },
                status,
                error_code,
                error_message,
                latency_ms: Some(latency_ms),
                ttft_ms,
                created_at_ms: now_epoch_millis(),
            })
            .await;
    }
}

struct ProxyStreamState {
    upstream: BoxStream<'static, Result<Bytes, std::io::Error>>,
    tracker: SseUsageTracker,
    ttft_ms: Option<u64>,
    started: Instant,
    finalizer: Option<StreamFinalizer>,
    _permit: OwnedSemaphorePermit,
}

impl ProxyStreamState {
    async fn finalize_now(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let tracker = std::mem::take(&mut self.tracker);
        let actual_model = tracker.actual_model().map(str::to_string);
        finalizer
            .finalize(
                end,
                tracker.observed_usage(),
                actual_model,
                tracker.content().to_string(),
                self.ttft_ms,
            )
            .await;
    }
}

impl Drop for ProxyStreamState {
    fn drop(&mut self) {
        // Dropping `upstream` aborts the reqwest connection, which propagates
        // the cancellation upstream. The settlement itself must run on a
        // runtime, so hand it off.
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let tracker = std::mem::take(&mut self.tracker);
        let actual_model = tracker.actual_model().map(str::to_string);
        let observed_usage = tracker.observed_usage();
        let content = tracker.content().to_string();
        let ttft_ms = self.ttft_ms;

        let settle = async move {
            finalizer
                .finalize(
                    StreamEnd::Cancelled,
                    observed_usage,
                    actual_model,
                    content,
                    ttft_ms,
                )
                .await;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(settle);
            }
            Err(_) => {
                let _ = std::thread::Builder::new()
                    .name("sekisho-stream-finalizer".to_string())
                    .spawn(move || {
                        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        else {
                            return;
                        };
                        runtime.block_on(settle);
                    });
            }
        }
    }
}
