mod common;

use std::time::Duration;

use axum::http::StatusCode;
use futures_util::StreamExt;
use httpmock::prelude::*;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::*;
use sekisho::types::{EndpointKind, HealthStatus};
use sekisho::UsageStatus;

fn openai_completion(model: &str, input: u32, output: u32) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "ok"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": input, "completion_tokens": output},
    })
}

#[tokio::test]
async fn connection_refused_fails_over_to_the_next_endpoint() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(openai_completion("gpt-4o", 5, 4));
        })
        .await;

    let gateway = gateway().await;
    // Port 1 on loopback refuses immediately.
    gateway
        .add_endpoint(endpoint("ep-a", "http://127.0.0.1:1", 1))
        .await;
    gateway
        .add_endpoint(endpoint("ep-b", &upstream.base_url(), 2))
        .await;

    let body = chat_body("gpt-4o", "hi", 16, false);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;

    let records = gateway.usage_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, UsageStatus::Completed);
    assert_eq!(records[0].endpoint_id.as_deref(), Some("ep-b"));

    // One refused connection: counter bumped, endpoint still in rotation.
    let snapshots = gateway.state.registry().snapshot_for_model("gpt-4o").await;
    let ep_a = snapshots.iter().find(|s| s.config.id == "ep-a").unwrap();
    assert_eq!(ep_a.consecutive_failures, 1);
    assert_eq!(ep_a.health, HealthStatus::Healthy);
}

#[tokio::test]
async fn non_retriable_upstream_error_returns_sanitized_envelope() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500)
                .header("content-type", "application/json")
                .json_body(json!({"error": {"message": "CUDA out of memory on worker sk-internal-123"}}));
        })
        .await;

    let gateway = gateway().await;
    let mut key = gateway.api_key().await;
    key.budget_monthly_jpy_micros = Some(1_000_000);
    gateway.store.upsert_api_key(&key).await.unwrap();
    gateway
        .add_endpoint(endpoint("ep-1", &upstream.base_url(), 1))
        .await;

    let body = chat_body("gpt-4o", "hi", 16, false);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let payload = response_json(response).await;
    assert_eq!(payload["error"]["code"], json!("upstream.500"));
    let message = payload["error"]["message"].as_str().unwrap();
    assert!(!message.contains("sk-internal-123"));

    let record = gateway.wait_for_record(UsageStatus::Failed).await;
    assert_eq!(record.error_code.as_deref(), Some("upstream.500"));
    assert_eq!(record.usage.output_tokens, 0);
    assert_eq!(record.cost_jpy_micros, 0);

    // The reservation was released, not committed.
    let key = gateway.api_key().await;
    assert_eq!(key.usage_current_month_jpy_micros, 0);
}

#[tokio::test]
async fn retriable_upstream_errors_exhaust_into_502() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("overloaded");
        })
        .await;

    let gateway = gateway().await;
    gateway
        .add_endpoint(endpoint("ep-1", &upstream.base_url(), 1))
        .await;

    let body = chat_body("gpt-4o", "hi", 16, false);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    // The single endpoint is only attempted once per candidate walk.
    mock.assert_async().await;
    let record = gateway.wait_for_record(UsageStatus::Failed).await;
    assert_eq!(record.error_code.as_deref(), Some("upstream.503"));
}

#[tokio::test]
async fn no_healthy_endpoint_returns_503() {
    let gateway = gateway().await;

    let body = chat_body("gpt-4o", "hi", 16, false);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let payload = response_json(response).await;
    assert_eq!(payload["error"]["code"], json!("no_endpoint"));
    let record = gateway.wait_for_record(UsageStatus::Failed).await;
    assert_eq!(record.error_code.as_deref(), Some("no_endpoint"));
}

#[tokio::test]
async fn fallback_model_serves_when_primary_has_no_endpoints() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(openai_completion("gpt-4o-mini", 5, 4));
        })
        .await;

    let gateway = gateway().await;
    seed_model(&gateway.store, "gpt-4o-mini", 0.5, 2.0).await;
    let mut primary = gateway
        .store
        .model_by_id("gpt-4o")
        .await
        .unwrap()
        .expect("model");
    primary.fallback_models = vec!["gpt-4o-mini".to_string()];
    gateway.store.upsert_model(&primary).await.unwrap();

    // Only the fallback model has an endpoint.
    let mut fallback_endpoint = endpoint("ep-mini", &upstream.base_url(), 1);
    fallback_endpoint.model_id = "gpt-4o-mini".to_string();
    gateway.add_endpoint(fallback_endpoint).await;

    let body = chat_body("gpt-4o", "hi", 16, false);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let record = gateway.wait_for_record(UsageStatus::Completed).await;
    assert_eq!(record.requested_model, "gpt-4o");
    assert_eq!(record.endpoint_id.as_deref(), Some("ep-mini"));
}

#[tokio::test]
async fn streaming_forwards_chunks_and_reconciles_usage() {
    let sse_body = concat!(
        "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(move |when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body);
        })
        .await;

    let gateway = gateway().await;
    let mut key = gateway.api_key().await;
    key.budget_monthly_jpy_micros = Some(1_000_000);
    gateway.store.upsert_api_key(&key).await.unwrap();
    gateway
        .add_endpoint(endpoint("ep-1", &upstream.base_url(), 1))
        .await;

    let body = chat_body("gpt-4o", "Hello", 16, true);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let text = response_text(response).await;
    assert!(text.contains("Hel"));
    assert!(text.contains("data: [DONE]"));

    let record = gateway.wait_for_record(UsageStatus::Completed).await;
    assert_eq!(record.usage.input_tokens, 5);
    assert_eq!(record.usage.output_tokens, 4);
    assert!(record.ttft_ms.is_some());

    let key = gateway.api_key().await;
    assert_eq!(key.usage_current_month_jpy_micros, record.cost_jpy_micros);
}

#[tokio::test]
async fn ollama_endpoints_serve_translated_responses() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .json_body_partial(r#"{"model":"gpt-4o"}"#);
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "model": "gpt-4o",
                    "message": {"role": "assistant", "content": "from ollama"},
                    "prompt_eval_count": 7,
                    "eval_count": 2,
                    "done": true,
                }));
        })
        .await;

    let gateway = gateway().await;
    let mut ep = endpoint("ep-ollama", &upstream.base_url(), 1);
    ep.kind = EndpointKind::Ollama;
    gateway.add_endpoint(ep).await;

    // A streaming client against a non-SSE endpoint gets the buffered
    // response re-framed as a single SSE event.
    let body = chat_body("gpt-4o", "hi", 16, true);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let text = response_text(response).await;
    assert!(text.starts_with("data: "));
    assert!(text.contains("from ollama"));
    assert!(text.ends_with("data: [DONE]\n\n"));
    mock.assert_async().await;

    let record = gateway.wait_for_record(UsageStatus::Completed).await;
    assert_eq!(record.usage.input_tokens, 7);
    assert_eq!(record.usage.output_tokens, 2);
}

/// Minimal upstream that emits a few SSE chunks and then stalls with the
/// connection open, so the client can cancel mid-stream.
async fn stalling_sse_upstream() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 16 * 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                    )
                    .await;
                for idx in 0..3 {
                    let event = format!(
                        "data: {{\"choices\":[{{\"delta\":{{\"content\":\"chunk-{idx}\"}}}}]}}\n\n"
                    );
                    let framed = format!("{:x}\r\n{event}\r\n", event.len());
                    if socket.write_all(framed.as_bytes()).await.is_err() {
                        return;
                    }
                }
                // Hold the stream open until the gateway aborts us.
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn client_cancel_mid_stream_settles_as_cancelled() {
    let upstream_addr = stalling_sse_upstream().await;

    let gateway = gateway().await;
    let mut key = gateway.api_key().await;
    key.budget_monthly_jpy_micros = Some(1_000_000);
    gateway.store.upsert_api_key(&key).await.unwrap();
    gateway
        .add_endpoint(endpoint("ep-1", &format!("http://{upstream_addr}"), 1))
        .await;

    // Serve the router for real so the client can disconnect.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    let router = gateway.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{gateway_addr}/v1/chat/completions"))
        .header("authorization", format!("Bearer {}", gateway.api_key_plaintext))
        .json(&chat_body("gpt-4o", "hi", 16, true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut stream = response.bytes_stream();
    let mut seen = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        seen += String::from_utf8_lossy(&chunk).matches("chunk-").count();
        if seen >= 3 {
            break;
        }
    }
    // Disconnect mid-stream.
    drop(stream);

    let record = gateway.wait_for_record(UsageStatus::Cancelled).await;
    assert_eq!(record.error_code.as_deref(), Some("client_disconnected"));
    assert!(record.usage.output_tokens > 0);

    // Cancelled streams release the reservation instead of committing it.
    let key = gateway.api_key().await;
    assert_eq!(key.usage_current_month_jpy_micros, 0);
}

#[tokio::test]
async fn concurrency_cap_yields_overloaded() {
    let gateway = gateway().await;
    let mut ep = endpoint("ep-1", "http://127.0.0.1:1", 1);
    ep.max_concurrent_requests = 1;
    gateway.add_endpoint(ep).await;

    // Hold the only permit so admission-side selection sees a full endpoint.
    let _permit = gateway.state.registry().try_acquire("ep-1").await.unwrap();

    let body = chat_body("gpt-4o", "hi", 16, false);
    let response = post_chat(
        gateway.router(),
        "/v1/chat/completions",
        Some(&gateway.api_key_plaintext),
        &[],
        &body,
    )
    .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let payload = response_json(response).await;
    assert_eq!(payload["error"]["code"], json!("overloaded"));
}
