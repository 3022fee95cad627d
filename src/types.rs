use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const MONTH_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]");

/// Billing state of a user account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Active,
    Trial,
    Expired,
    Banned,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trial => "trial",
            Self::Expired => "expired",
            Self::Banned => "banned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "trial" => Some(Self::Trial),
            "expired" => Some(Self::Expired),
            "banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub oid: String,
    pub email: String,
    pub payment_status: PaymentStatus,
    /// `YYYY-MM-DD`; a user past this date resolves as expired on next access.
    pub payment_valid_until: Option<String>,
    pub total_cost_jpy_micros: u64,
}

impl UserRecord {
    /// True when `payment_valid_until` lies strictly before `today`.
    pub fn payment_lapsed(&self, today: Date) -> bool {
        let Some(raw) = self.payment_valid_until.as_deref() else {
            return false;
        };
        match Date::parse(raw, DATE_FORMAT) {
            Ok(valid_until) => valid_until < today,
            Err(_) => false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_oid: String,
    /// Hex `sha256(plaintext || salt)`. The plaintext is never stored.
    pub secret_digest: String,
    pub salt: String,
    pub display_prefix: String,
    pub rate_limit_rpm: u32,
    /// Monthly budget in JPY-micros; `None` means unlimited.
    pub budget_monthly_jpy_micros: Option<u64>,
    pub usage_current_month_jpy_micros: u64,
    /// `YYYY-MM` the usage counter was last reset for.
    pub last_reset_month: String,
    pub allowed_models: Option<Vec<String>>,
    pub allowed_ips: Option<Vec<String>>,
    pub is_active: bool,
    /// Epoch seconds; expired keys never authorize a request.
    pub expires_at: Option<u64>,
}

impl std::fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("id", &self.id)
            .field("user_oid", &self.user_oid)
            .field("secret_digest", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("display_prefix", &self.display_prefix)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("budget_monthly_jpy_micros", &self.budget_monthly_jpy_micros)
            .field(
                "usage_current_month_jpy_micros",
                &self.usage_current_month_jpy_micros,
            )
            .field("last_reset_month", &self.last_reset_month)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl ApiKeyRecord {
    pub fn allows_model(&self, model_id: &str) -> bool {
        match &self.allowed_models {
            Some(allowed) => allowed.iter().any(|entry| entry == model_id),
            None => true,
        }
    }

    pub fn allows_ip(&self, client_ip: &str) -> bool {
        match &self.allowed_ips {
            Some(allowed) => allowed.iter().any(|entry| entry == client_ip),
            None => true,
        }
    }

    pub fn is_expired(&self, now_epoch_secs: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_epoch_secs)
    }
}

/// A named delegation identity owned by one user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppRecord {
    pub app_id: String,
    pub name: String,
    pub owner_oid: String,
    pub is_active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    /// Name sent to upstream endpoints, e.g. the vLLM served model name.
    pub upstream_name: String,
    pub provider: String,
    /// JPY per million input tokens (numerically: micro-JPY per token).
    pub input_cost: f64,
    /// JPY per million output tokens.
    pub output_cost: f64,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
    pub supports_functions: bool,
    pub supports_vision: bool,
    pub traffic_weight: f64,
    pub is_active: bool,
    pub fallback_models: Vec<String>,
    pub max_retries: u32,
}

impl ModelConfig {
    /// Cost of observed usage, rounded to whole JPY-micros. Cache-read tokens
    /// bill at the input rate; cache-creation tokens at 1.25x input, matching
    /// the admin tier's pricing convention.
    pub fn cost_jpy_micros(&self, usage: &TokenUsage) -> u64 {
        let input = usage.input_tokens as f64 * self.input_cost;
        let output = usage.output_tokens as f64 * self.output_cost;
        let cache_read = usage.cache_read_tokens as f64 * self.input_cost;
        let cache_creation = usage.cache_creation_tokens as f64 * self.input_cost * 1.25;
        let total = input + output + cache_read + cache_creation;
        if !total.is_finite() || total <= 0.0 {
            return 0;
        }
        total.round() as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Vllm,
    Ollama,
    Tgi,
    Custom,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vllm => "vllm",
            Self::Ollama => "ollama",
            Self::Tgi => "tgi",
            Self::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "vllm" => Some(Self::Vllm),
            "ollama" => Some(Self::Ollama),
            "tgi" => Some(Self::Tgi),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    RoundRobin,
    UsageBased,
    LatencyBased,
    Random,
}

impl RoutingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::UsageBased => "usage-based",
            Self::LatencyBased => "latency-based",
            Self::Random => "random",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "round-robin" => Some(Self::RoundRobin),
            "usage-based" => Some(Self::UsageBased),
            "latency-based" => Some(Self::LatencyBased),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "down" => Some(Self::Down),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub model_id: String,
    pub kind: EndpointKind,
    pub base_url: String,
    /// Lower values are preferred; ties break by `routing_strategy`.
    pub routing_priority: i32,
    pub routing_strategy: RoutingStrategy,
    pub timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub health_check_url: Option<String>,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_tokens: u32,
    pub cache_read_tokens: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One immutable row per dispatched request. Never contains prompt or
/// completion text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_oid: String,
    pub api_key_id: Option<String>,
    pub app_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub requested_model: String,
    pub actual_model: Option<String>,
    pub endpoint_id: Option<String>,
    pub usage: TokenUsage,
    pub cost_jpy_micros: u64,
    pub status: UsageStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub latency_ms: Option<u64>,
    pub ttft_ms: Option<u64>,
    pub created_at_ms: u64,
}

pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub fn now_epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Current UTC month as `YYYY-MM`, the budget accounting period.
pub fn current_month() -> String {
    OffsetDateTime::now_utc()
        .date()
        .format(MONTH_FORMAT)
        .unwrap_or_else(|_| "1970-01".to_string())
}

pub fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn payment_lapses_strictly_before_today() {
        let mut user = UserRecord {
            oid: "u1".to_string(),
            email: "u1@example.test".to_string(),
            payment_status: PaymentStatus::Active,
            payment_valid_until: Some("2026-07-31".to_string()),
            total_cost_jpy_micros: 0,
        };

        assert!(user.payment_lapsed(date!(2026 - 08 - 01)));
        assert!(!user.payment_lapsed(date!(2026 - 07 - 31)));

        user.payment_valid_until = None;
        assert!(!user.payment_lapsed(date!(2026 - 08 - 01)));
    }

    #[test]
    fn cost_rounds_to_whole_micros() {
        let model = ModelConfig {
            id: "gpt-4o".to_string(),
            upstream_name: "gpt-4o".to_string(),
            provider: "vllm".to_string(),
            input_cost: 2.5,
            output_cost: 10.0,
            context_window: 128_000,
            max_output_tokens: 16_384,
            supports_streaming: true,
            supports_functions: true,
            supports_vision: false,
            traffic_weight: 1.0,
            is_active: true,
            fallback_models: Vec::new(),
            max_retries: 2,
        };

        // 5 input + 4 output tokens: 12.5 + 40.0 = 52.5 micro-JPY, within
        // 0.0001 JPY of the exact 0.0000525 after rounding.
        let usage = TokenUsage {
            input_tokens: 5,
            output_tokens: 4,
            ..TokenUsage::default()
        };
        let cost = model.cost_jpy_micros(&usage);
        assert!((cost as f64 - 52.5).abs() <= 100.0);
        assert_eq!(cost, 53);
    }

    #[test]
    fn key_model_and_ip_allowlists() {
        let mut key = ApiKeyRecord {
            id: "k1".to_string(),
            user_oid: "u1".to_string(),
            secret_digest: String::new(),
            salt: String::new(),
            display_prefix: "sk-gate-abc...".to_string(),
            rate_limit_rpm: 60,
            budget_monthly_jpy_micros: None,
            usage_current_month_jpy_micros: 0,
            last_reset_month: "2026-08".to_string(),
            allowed_models: None,
            allowed_ips: None,
            is_active: true,
            expires_at: None,
        };

        assert!(key.allows_model("gpt-4o"));
        key.allowed_models = Some(vec!["gpt-4o".to_string()]);
        assert!(key.allows_model("gpt-4o"));
        assert!(!key.allows_model("gpt-4o-mini"));

        key.allowed_ips = Some(vec!["10.0.0.1".to_string()]);
        assert!(!key.allows_ip("10.0.0.2"));

        key.expires_at = Some(100);
        assert!(key.is_expired(100));
        assert!(!key.is_expired(99));
    }
}
