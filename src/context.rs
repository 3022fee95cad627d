use serde_json::Value;
use tiktoken_rs::{tokenizer, CoreBPE};

use crate::error::GatewayError;
use crate::types::ModelConfig;

/// Estimates input tokens for a chat-completions body.
///
/// The contract is a monotone upper bound on what the upstream will count:
/// role, content (string or text parts), name, plus the serialized tool and
/// format fields, with the per-message framing constants tiktoken documents.
pub fn estimate_chat_input_tokens(model: &str, request: &Value) -> u32 {
    let bpe = bpe_for_model(model);
    let Some(messages) = request.get("messages").and_then(Value::as_array) else {
        return 0;
    };

    let tokens_per_message: i64 = 3;
    let tokens_per_name: i64 = 1;

    let mut num_tokens: i64 = 0;
    for message in messages {
        num_tokens = num_tokens.saturating_add(tokens_per_message);
        if let Some(role) = message.get("role").and_then(Value::as_str) {
            num_tokens = num_tokens.saturating_add(count_text(bpe, role));
        }
        if let Some(content) = message.get("content") {
            num_tokens = num_tokens.saturating_add(count_content(bpe, content));
        }
        if let Some(name) = message.get("name").and_then(Value::as_str) {
            num_tokens = num_tokens.saturating_add(count_text(bpe, name));
            num_tokens = num_tokens.saturating_add(tokens_per_name);
        }
    }
    num_tokens = num_tokens.saturating_add(3);

    for field in ["tools", "tool_choice", "response_format", "stop"] {
        if let Some(value) = request.get(field) {
            let json = serde_json::to_string(value).unwrap_or_default();
            num_tokens = num_tokens.saturating_add(count_text(bpe, &json));
        }
    }

    clamp_i64_to_u32(num_tokens)
}

/// Token count of plain text, used to estimate streamed output when the
/// upstream omits a usage object.
pub fn estimate_text_tokens(model: &str, text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    clamp_i64_to_u32(count_text(bpe_for_model(model), text))
}

/// Rejects requests that cannot fit the model. Exactly filling the window is
/// accepted; one token over is not.
pub fn validate_context(
    model: &ModelConfig,
    estimated_input_tokens: u32,
    requested_max_tokens: Option<u32>,
) -> Result<u32, GatewayError> {
    let requested_output = requested_max_tokens.unwrap_or(model.max_output_tokens);

    if requested_output > model.max_output_tokens {
        return Err(GatewayError::ContextTooLarge {
            estimated_input_tokens,
            requested_output_tokens: requested_output,
            context_window: model.context_window,
        });
    }

    let total = u64::from(estimated_input_tokens) + u64::from(requested_output);
    if total > u64::from(model.context_window) {
        return Err(GatewayError::ContextTooLarge {
            estimated_input_tokens,
            requested_output_tokens: requested_output,
            context_window: model.context_window,
        });
    }

    Ok(requested_output)
}

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

fn count_text(bpe: &CoreBPE, text: &str) -> i64 {
    let count = bpe.encode_with_special_tokens(text).len();
    if count > i64::MAX as usize {
        i64::MAX
    } else {
        count as i64
    }
}

fn count_content(bpe: &CoreBPE, content: &Value) -> i64 {
    match content {
        Value::String(text) => count_text(bpe, text),
        Value::Array(parts) => parts
            .iter()
            .map(|part| {
                let Some(obj) = part.as_object() else {
                    return 0;
                };
                if obj.get("type").and_then(Value::as_str) != Some("text") {
                    return 0;
                }
                obj.get("text")
                    .and_then(Value::as_str)
                    .map(|text| count_text(bpe, text))
                    .unwrap_or(0)
            })
            .fold(0i64, i64::saturating_add),
        _ => 0,
    }
}

fn clamp_i64_to_u32(value: i64) -> u32 {
    if value <= 0 {
        0
    } else if value > i64::from(u32::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}
