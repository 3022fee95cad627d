use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::types::TokenUsage;

const TRACKER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const TRACKER_TAIL_BYTES: usize = 128 * 1024;
const TRACKER_MAX_CONTENT_BYTES: usize = 128 * 1024;

/// Incremental scanner over a forwarded SSE byte stream.
///
/// Splits the stream at event boundaries, remembers the last usage object
/// and model the upstream reported, and accumulates delta text (bounded) so
/// a cancelled stream's output can still be estimated.
#[derive(Default)]
pub struct SseUsageTracker {
    buffer: BytesMut,
    observed_usage: Option<TokenUsage>,
    actual_model: Option<String>,
    content: String,
    saw_done: bool,
}

impl SseUsageTracker {
    pub fn ingest(&mut self, chunk: &Bytes) {
        self.buffer.extend_from_slice(chunk.as_ref());

        loop {
            let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) else {
                break;
            };

            let event_bytes = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);

            let Some(data) = extract_sse_data(event_bytes.as_ref()) else {
                continue;
            };
            let trimmed = trim_ascii_whitespace(&data);
            if trimmed == b"[DONE]" {
                self.saw_done = true;
                continue;
            }
            if !trimmed.starts_with(b"{") {
                continue;
            }

            let Ok(event) = serde_json::from_slice::<Value>(trimmed) else {
                continue;
            };
            if let Some(usage) = extract_openai_usage(&event) {
                self.observed_usage = Some(usage);
            }
            if let Some(model) = event.get("model").and_then(Value::as_str) {
                if !model.is_empty() {
                    self.actual_model = Some(model.to_string());
                }
            }
            if self.content.len() < TRACKER_MAX_CONTENT_BYTES {
                if let Some(delta) = event
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                {
                    self.content.push_str(delta);
                }
            }
        }

        if self.buffer.len() > TRACKER_MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len().saturating_sub(TRACKER_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    pub fn observed_usage(&self) -> Option<TokenUsage> {
        self.observed_usage
    }

    pub fn actual_model(&self) -> Option<&str> {
        self.actual_model.as_deref()
    }

    /// Delta text streamed so far, capped; the estimator input when the
    /// upstream never reported usage.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }
}

/// Position and length of the earliest event delimiter, handling both `\n\n`
/// and `\r\n\r\n` in one forward scan.
pub fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

/// Joined payload of the event's `data:` lines.
pub fn extract_sse_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Usage object from an OpenAI-shaped response or chunk, including the
/// cached-token detail fields when present.
pub fn extract_openai_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }

    let input = read_u32(usage, "prompt_tokens").or_else(|| read_u32(usage, "input_tokens"))?;
    let output =
        read_u32(usage, "completion_tokens").or_else(|| read_u32(usage, "output_tokens"))?;

    let cache_read = usage
        .pointer("/prompt_tokens_details/cached_tokens")
        .and_then(Value::as_u64)
        .or_else(|| usage.get("cache_read_input_tokens").and_then(Value::as_u64))
        .unwrap_or(0) as u32;
    let cache_creation = usage
        .get("cache_creation_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    Some(TokenUsage {
        // Cached tokens are billed separately; keep the uncached count here.
        input_tokens: input.saturating_sub(cache_read),
        output_tokens: output,
        cache_creation_tokens: cache_creation,
        cache_read_tokens: cache_read,
    })
}

fn read_u32(value: &Value, key: &str) -> Option<u32> {
    value.get(key).and_then(Value::as_u64).map(|v| v as u32)
}
