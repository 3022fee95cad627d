use std::collections::HashMap;

use axum::http::HeaderMap;
use serde_json::Value;

use crate::error::GatewayError;
use crate::types::ApiKeyRecord;

/// The billable identity for one request: an API key's owner, a delegated
/// (app, end-user) pair billed through a key, or a shared-secret pair.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_oid: String,
    pub app_id: Option<String>,
    pub api_key: Option<ApiKeyRecord>,
}

impl Principal {
    pub fn api_key_id(&self) -> Option<&str> {
        self.api_key.as_ref().map(|key| key.id.as_str())
    }

    /// Rate-limit scope: per key for bearer mode, per (app, user) pair under
    /// delegation without a key.
    pub fn rate_scope(&self) -> String {
        match (&self.api_key, &self.app_id) {
            (Some(key), _) => format!("ratelimit:{}", key.id),
            (None, Some(app_id)) => format!("ratelimit:app:{app_id}:{}", self.user_oid),
            (None, None) => format!("ratelimit:user:{}", self.user_oid),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelegationChannel {
    Query,
    BodyTopLevel,
    MessageContent,
    Header,
}

impl DelegationChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query_param",
            Self::BodyTopLevel => "body_top_level",
            Self::MessageContent => "message_content",
            Self::Header => "header",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelegationParams {
    pub user_oid: String,
    pub app_id: String,
    pub channel: DelegationChannel,
}

/// Resolves delegated billing identity from the four ingress channels, in
/// strict precedence: query parameters, body top-level fields, first user
/// message content, headers. The first channel supplying BOTH values wins.
///
/// Channels 2 and 3 mutate `body` so the delegation keys never reach the
/// upstream: top-level fields are stripped, and an embedded message is
/// rewritten to its `message` value.
pub fn resolve_delegation(
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &mut Value,
) -> Result<Option<DelegationParams>, GatewayError> {
    let mut partial_seen = false;

    let from_query = (
        query.get("x_user_oid").cloned(),
        query.get("x_app_id").cloned(),
    );
    if let Some(params) = take_pair(from_query, DelegationChannel::Query, &mut partial_seen) {
        strip_body_fields(body);
        return Ok(Some(params));
    }

    let from_body = extract_body_top_level(body);
    if let Some(params) = take_pair(from_body, DelegationChannel::BodyTopLevel, &mut partial_seen) {
        return Ok(Some(params));
    }

    if let Some((user_oid, app_id)) = extract_from_first_user_message(body) {
        return Ok(Some(DelegationParams {
            user_oid,
            app_id,
            channel: DelegationChannel::MessageContent,
        }));
    }

    let from_headers = (
        header_string(headers, "x-user-oid"),
        header_string(headers, "x-app-id"),
    );
    if let Some(params) = take_pair(from_headers, DelegationChannel::Header, &mut partial_seen) {
        return Ok(Some(params));
    }

    if partial_seen {
        return Err(GatewayError::Unauthorized {
            reason: "delegation requires both x_user_oid and x_app_id".to_string(),
        });
    }
    Ok(None)
}

fn take_pair(
    pair: (Option<String>, Option<String>),
    channel: DelegationChannel,
    partial_seen: &mut bool,
) -> Option<DelegationParams> {
    match pair {
        (Some(user_oid), Some(app_id)) => Some(DelegationParams {
            user_oid,
            app_id,
            channel,
        }),
        (None, None) => None,
        _ => {
            *partial_seen = true;
            None
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_body_top_level(body: &mut Value) -> (Option<String>, Option<String>) {
    let Some(map) = body.as_object_mut() else {
        return (None, None);
    };
    let user_oid = map.remove("x_user_oid").and_then(value_to_id);
    let app_id = map.remove("x_app_id").and_then(value_to_id);
    (user_oid, app_id)
}

fn strip_body_fields(body: &mut Value) {
    if let Some(map) = body.as_object_mut() {
        map.remove("x_user_oid");
        map.remove("x_app_id");
    }
}

fn value_to_id(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Scans the first `user`-role message for embedded delegation JSON and, on a
/// hit, rewrites its content in place to the `message` value so the upstream
/// receives clean text. System and assistant messages are never inspected.
fn extract_from_first_user_message(body: &mut Value) -> Option<(String, String)> {
    let messages = body.get_mut("messages")?.as_array_mut()?;
    let message = messages.iter_mut().find(|message| {
        message.get("role").and_then(Value::as_str) == Some("user")
    })?;

    let content = message.get_mut("content")?;
    match content {
        Value::String(text) => {
            let parsed = try_parse_delegation_json(text)?;
            let clean = parsed
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let user_oid = value_to_id(parsed.get("x_user_oid")?.clone())?;
            let app_id = value_to_id(parsed.get("x_app_id")?.clone())?;
            *text = clean;
            Some((user_oid, app_id))
        }
        Value::Array(parts) => {
            for part in parts.iter_mut() {
                let Some(obj) = part.as_object() else {
                    continue;
                };
                if obj.get("type").and_then(Value::as_str) != Some("text") {
                    continue;
                }
                let Some(text) = obj.get("text").and_then(Value::as_str) else {
                    continue;
                };
                let Some(parsed) = try_parse_delegation_json(text) else {
                    continue;
                };
                let clean = parsed
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let user_oid = value_to_id(parsed.get("x_user_oid")?.clone())?;
                let app_id = value_to_id(parsed.get("x_app_id")?.clone())?;
                *part = serde_json::json!({ "type": "text", "text": clean });
                return Some((user_oid, app_id));
            }
            None
        }
        _ => None,
    }
}

/// Accepts a full JSON object or the bare `"k": "v", ...` form. Templating
/// engines commonly consume the outer braces, so the bare form is wrapped in
/// braces before parsing. Both delegation keys must be present.
fn try_parse_delegation_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            if has_delegation_keys(&parsed) {
                return Some(parsed);
            }
        }
        return None;
    }

    if trimmed.contains("x_user_oid") && trimmed.contains("x_app_id") {
        let wrapped = format!("{{{trimmed}}}");
        if let Ok(parsed) = serde_json::from_str::<Value>(&wrapped) {
            if has_delegation_keys(&parsed) {
                return Some(parsed);
            }
        }
    }

    None
}

fn has_delegation_keys(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.contains_key("x_user_oid") && obj.contains_key("x_app_id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn empty_query() -> HashMap<String, String> {
        HashMap::new()
    }

    fn query_with(user: &str, app: &str) -> HashMap<String, String> {
        let mut query = HashMap::new();
        query.insert("x_user_oid".to_string(), user.to_string());
        query.insert("x_app_id".to_string(), app.to_string());
        query
    }

    #[test]
    fn no_channels_resolves_to_none() {
        let mut body = json!({"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]});
        let resolved =
            resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body).unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn query_wins_over_all_other_channels() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-oid", "U4".parse().unwrap());
        headers.insert("x-app-id", "A4".parse().unwrap());

        let mut body = json!({
            "model": "gpt-4o",
            "x_user_oid": "U2",
            "x_app_id": "A2",
            "messages": [{"role":"user","content":"hi"}]
        });

        let resolved = resolve_delegation(&query_with("U1", "A1"), &headers, &mut body)
            .unwrap()
            .expect("params");
        assert_eq!(resolved.user_oid, "U1");
        assert_eq!(resolved.app_id, "A1");
        assert_eq!(resolved.channel, DelegationChannel::Query);
        // Body copies of the delegation keys never reach the upstream.
        assert!(body.get("x_user_oid").is_none());
        assert!(body.get("x_app_id").is_none());
    }

    #[test]
    fn body_top_level_fields_are_consumed() {
        let mut body = json!({
            "model": "gpt-4o",
            "x_user_oid": "U2",
            "x_app_id": "A2",
            "messages": [{"role":"user","content":"hi"}]
        });

        let resolved = resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body)
            .unwrap()
            .expect("params");
        assert_eq!(resolved.channel, DelegationChannel::BodyTopLevel);
        assert_eq!(resolved.user_oid, "U2");
        assert!(body.get("x_user_oid").is_none());
    }

    #[test]
    fn embedded_message_json_is_extracted_and_rewritten() {
        let mut body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role":"system","content":"be brief"},
                {"role":"user","content":"{\"x_user_oid\": \"user-abc\", \"x_app_id\": \"dify-prod\", \"message\": \"こんにちは\"}"}
            ]
        });

        let resolved = resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body)
            .unwrap()
            .expect("params");
        assert_eq!(resolved.user_oid, "user-abc");
        assert_eq!(resolved.app_id, "dify-prod");
        assert_eq!(resolved.channel, DelegationChannel::MessageContent);
        assert_eq!(body["messages"][1]["content"], json!("こんにちは"));
    }

    #[test]
    fn bare_form_without_braces_is_wrapped() {
        let mut body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role":"user","content":"\"x_user_oid\": \"u9\", \"x_app_id\": \"a9\", \"message\": \"hello\""}
            ]
        });

        let resolved = resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body)
            .unwrap()
            .expect("params");
        assert_eq!(resolved.user_oid, "u9");
        assert_eq!(body["messages"][0]["content"], json!("hello"));
    }

    #[test]
    fn missing_message_key_rewrites_to_empty_string() {
        let mut body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role":"user","content":"{\"x_user_oid\": \"u1\", \"x_app_id\": \"a1\"}"}
            ]
        });

        resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body)
            .unwrap()
            .expect("params");
        assert_eq!(body["messages"][0]["content"], json!(""));
    }

    #[test]
    fn array_content_rewrites_text_part_and_preserves_rest() {
        let mut body = json!({
            "model": "gpt-4o",
            "messages": [{
                "role": "user",
                "content": [
                    {"type":"image_url","image_url":{"url":"data:image/png;base64,AAAA"}},
                    {"type":"text","text":"{\"x_user_oid\": \"u1\", \"x_app_id\": \"a1\", \"message\": \"look\"}"}
                ]
            }]
        });

        let resolved = resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body)
            .unwrap()
            .expect("params");
        assert_eq!(resolved.user_oid, "u1");

        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], json!("image_url"));
        assert_eq!(parts[1], json!({"type":"text","text":"look"}));
    }

    #[test]
    fn plain_chat_text_passes_through_untouched() {
        let original = json!({
            "model": "gpt-4o",
            "messages": [{"role":"user","content":"what is {x} in math?"}]
        });
        let mut body = original.clone();
        let resolved =
            resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body).unwrap();
        assert!(resolved.is_none());
        assert_eq!(body, original);
    }

    #[test]
    fn one_sided_pair_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-oid", "U4".parse().unwrap());

        let mut body = json!({"model":"gpt-4o","messages":[]});
        let err = resolve_delegation(&empty_query(), &headers, &mut body).unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn partial_early_channel_defers_to_complete_later_channel() {
        let mut query = HashMap::new();
        query.insert("x_user_oid".to_string(), "U1".to_string());

        let mut headers = HeaderMap::new();
        headers.insert("x-user-oid", "U4".parse().unwrap());
        headers.insert("x-app-id", "A4".parse().unwrap());

        let mut body = json!({"model":"gpt-4o","messages":[]});
        let resolved = resolve_delegation(&query, &headers, &mut body)
            .unwrap()
            .expect("params");
        assert_eq!(resolved.user_oid, "U4");
        assert_eq!(resolved.channel, DelegationChannel::Header);
    }

    #[test]
    fn only_first_user_message_is_inspected() {
        let mut body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role":"user","content":"plain text"},
                {"role":"user","content":"{\"x_user_oid\": \"u1\", \"x_app_id\": \"a1\", \"message\": \"hi\"}"}
            ]
        });

        let resolved =
            resolve_delegation(&empty_query(), &HeaderMap::new(), &mut body).unwrap();
        assert!(resolved.is_none());
        // The second message is left exactly as sent.
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("x_user_oid"));
    }
}
