use serde_json::{json, Value};

use crate::sse::extract_openai_usage;
use crate::types::{EndpointKind, TokenUsage};

/// A fully-formed upstream call for one endpoint kind.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub body: Value,
}

/// True when the endpoint speaks OpenAI SSE natively and stream bytes can be
/// forwarded to the client as-is. Other kinds are served buffered and, for a
/// streaming client, re-framed as a single SSE chunk.
pub fn supports_native_sse(kind: EndpointKind) -> bool {
    matches!(kind, EndpointKind::Vllm | EndpointKind::Custom)
}

/// Translates the admitted OpenAI-shaped body into the endpoint's wire form.
/// The model field always becomes the upstream-facing name.
pub fn build_upstream_request(
    kind: EndpointKind,
    base_url: &str,
    upstream_model: &str,
    body: &Value,
    stream: bool,
) -> UpstreamRequest {
    let base = base_url.trim_end_matches('/');
    match kind {
        EndpointKind::Vllm | EndpointKind::Custom => {
            let mut out = body.clone();
            if let Some(map) = out.as_object_mut() {
                map.insert("model".to_string(), json!(upstream_model));
                map.insert("stream".to_string(), json!(stream));
            }
            UpstreamRequest {
                url: format!("{base}/v1/chat/completions"),
                body: out,
            }
        }
        EndpointKind::Ollama => {
            let messages: Vec<Value> = body
                .get("messages")
                .and_then(Value::as_array)
                .map(|messages| {
                    messages
                        .iter()
                        .map(|message| {
                            json!({
                                "role": message.get("role").and_then(Value::as_str).unwrap_or("user"),
                                "content": flatten_content(message.get("content")),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            let mut options = serde_json::Map::new();
            if let Some(max_tokens) = body.get("max_tokens").and_then(Value::as_u64) {
                options.insert("num_predict".to_string(), json!(max_tokens));
            }
            if let Some(temperature) = body.get("temperature") {
                options.insert("temperature".to_string(), temperature.clone());
            }
            if let Some(top_p) = body.get("top_p") {
                options.insert("top_p".to_string(), top_p.clone());
            }

            UpstreamRequest {
                url: format!("{base}/api/chat"),
                body: json!({
                    "model": upstream_model,
                    "messages": messages,
                    "stream": false,
                    "options": options,
                }),
            }
        }
        EndpointKind::Tgi => {
            let mut parameters = serde_json::Map::new();
            if let Some(max_tokens) = body.get("max_tokens").and_then(Value::as_u64) {
                parameters.insert("max_new_tokens".to_string(), json!(max_tokens));
            }
            if let Some(temperature) = body.get("temperature") {
                parameters.insert("temperature".to_string(), temperature.clone());
            }

            UpstreamRequest {
                url: format!("{base}/generate"),
                body: json!({
                    "inputs": render_prompt(body.get("messages")),
                    "parameters": parameters,
                }),
            }
        }
    }
}

/// Token usage from a buffered upstream response, in whatever dialect the
/// endpoint speaks. `None` hands accounting over to the estimator.
pub fn parse_buffered_usage(kind: EndpointKind, response: &Value) -> Option<TokenUsage> {
    match kind {
        EndpointKind::Vllm | EndpointKind::Custom => extract_openai_usage(response),
        EndpointKind::Ollama => {
            let input = response.get("prompt_eval_count").and_then(Value::as_u64)?;
            let output = response.get("eval_count").and_then(Value::as_u64)?;
            Some(TokenUsage {
                input_tokens: input as u32,
                output_tokens: output as u32,
                ..TokenUsage::default()
            })
        }
        EndpointKind::Tgi => None,
    }
}

/// Maps a buffered upstream response back into the OpenAI completion shape
/// the client expects.
pub fn translate_buffered_response(
    kind: EndpointKind,
    request_id: &str,
    requested_model: &str,
    upstream: Value,
) -> Value {
    match kind {
        EndpointKind::Vllm | EndpointKind::Custom => upstream,
        EndpointKind::Ollama => {
            let content = upstream
                .pointer("/message/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let usage = parse_buffered_usage(kind, &upstream);
            completion_envelope(request_id, requested_model, content, usage)
        }
        EndpointKind::Tgi => {
            let content = upstream
                .get("generated_text")
                .and_then(Value::as_str)
                .or_else(|| {
                    upstream
                        .as_array()
                        .and_then(|items| items.first())
                        .and_then(|item| item.get("generated_text"))
                        .and_then(Value::as_str)
                })
                .unwrap_or_default()
                .to_string();
            completion_envelope(request_id, requested_model, content, None)
        }
    }
}

/// Response content text, for estimator fallback when no usage was reported.
pub fn response_content_text(response: &Value) -> Option<&str> {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
}

fn completion_envelope(
    request_id: &str,
    model: &str,
    content: String,
    usage: Option<TokenUsage>,
) -> Value {
    let usage_value = usage
        .map(|usage| {
            json!({
                "prompt_tokens": usage.input_tokens,
                "completion_tokens": usage.output_tokens,
                "total_tokens": usage.input_tokens + usage.output_tokens,
            })
        })
        .unwrap_or(Value::Null);

    json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": usage_value,
    })
}

fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                let obj = part.as_object()?;
                if obj.get("type")?.as_str()? != "text" {
                    return None;
                }
                obj.get("text")?.as_str().map(str::to_string)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn render_prompt(messages: Option<&Value>) -> String {
    let Some(messages) = messages.and_then(Value::as_array) else {
        return String::new();
    };
    messages
        .iter()
        .map(|message| {
            format!(
                "{}: {}",
                message.get("role").and_then(Value::as_str).unwrap_or("user"),
                flatten_content(message.get("content"))
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
