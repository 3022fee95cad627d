use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const MAX_MESSAGE_LEN: usize = 200;

fn regexes() -> &'static [(Regex, &'static str)] {
    static REGEXES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        vec![
            // Credentials first, before path rewriting can split them.
            (Regex::new(r"Bearer [^\s]+").expect("regex"), "Bearer [REDACTED]"),
            (Regex::new(r"sk-[A-Za-z0-9_\-]+").expect("regex"), "sk-[REDACTED]"),
            (
                Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("regex"),
                "[IP]",
            ),
            (Regex::new(r"(/[^\s/]+)+/").expect("regex"), "[PATH]/"),
        ]
    })
}

/// Strips internal paths, addresses and credentials from a message before it
/// becomes user-visible or is written to a usage record.
pub fn sanitize_message(message: &str) -> String {
    let mut out = if message.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &message[..end])
    } else {
        message.to_string()
    };

    for (regex, replacement) in regexes() {
        if regex.is_match(&out) {
            out = regex.replace_all(&out, *replacement).to_string();
        }
    }
    out
}

/// Classifies an upstream error body into a short code and a sanitized,
/// user-safe message.
pub fn classify_upstream_error(status: u16, body: &str) -> (String, String) {
    let raw_message = extract_error_message(body);
    let lowered = raw_message.to_ascii_lowercase();

    let message = if lowered.contains("out of memory") || lowered.contains("oom") {
        "Model ran out of memory. Try reducing max_tokens or prompt length.".to_string()
    } else if lowered.contains("timeout") {
        "Upstream request timed out. Model may be overloaded.".to_string()
    } else if lowered.contains("rate limit") {
        "Upstream rate limit exceeded. Please retry later.".to_string()
    } else if lowered.contains("not found") || lowered.contains("model not loaded") {
        "Model is not currently loaded.".to_string()
    } else {
        sanitize_message(&raw_message)
    };

    (format!("upstream.{status}"), message)
}

fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.pointer("/error"),
            value.pointer("/message"),
            value.pointer("/detail"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(text) = candidate.as_str() {
                if !text.trim().is_empty() {
                    return text.trim().to_string();
                }
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "upstream error".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_tokens_paths_and_ips() {
        let out = sanitize_message("failed: Bearer sk-abc123 at /srv/gateway/conf from 10.1.2.3");
        assert!(!out.contains("sk-abc123"));
        assert!(!out.contains("10.1.2.3"));
        assert!(!out.contains("/srv/gateway/"));
        assert!(out.contains("Bearer [REDACTED]"));
        assert!(out.contains("[IP]"));
    }

    #[test]
    fn truncates_long_messages() {
        let out = sanitize_message(&"x".repeat(500));
        assert!(out.len() < 300);
        assert!(out.ends_with("... (truncated)"));
    }

    #[test]
    fn classifies_common_upstream_failures() {
        let (code, message) =
            classify_upstream_error(500, r#"{"error":{"message":"CUDA out of memory"}}"#);
        assert_eq!(code, "upstream.500");
        assert!(message.contains("out of memory"));
        assert!(!message.contains("CUDA"));

        let (code, message) = classify_upstream_error(503, "plain text failure");
        assert_eq!(code, "upstream.503");
        assert_eq!(message, "plain text failure");
    }

    #[test]
    fn upstream_secrets_never_reach_the_message() {
        let (_, message) = classify_upstream_error(
            502,
            r#"{"error":{"message":"auth failed for key sk-prov-12345 at https://10.0.0.5/v1/"}}"#,
        );
        assert!(!message.contains("sk-prov-12345"));
        assert!(!message.contains("10.0.0.5"));
    }
}
