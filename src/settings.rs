use std::path::PathBuf;

/// Process configuration, read once at startup from the environment.
///
/// Every field has a development default so `sekisho-gateway` starts with no
/// environment at all; production deployments set `DATABASE_URL`, `REDIS_URL`
/// and `GATEWAY_SHARED_SECRET` at minimum.
#[derive(Clone)]
pub struct Settings {
    pub listen: String,
    /// Path of the sqlite database file.
    pub database_path: PathBuf,
    /// Redis connection URL. `None` selects the in-process shared store,
    /// which is only suitable for single-replica deployments and tests.
    pub redis_url: Option<String>,
    pub gateway_shared_secret: String,
    /// Required prefix of bearer API keys.
    pub api_key_prefix: String,
    /// RPM applied to delegation-mode principals, which carry no per-key limit.
    pub default_rate_limit_rpm: u32,
    pub api_key_cache_ttl_secs: u64,
    pub api_key_negative_cache_ttl_secs: u64,
    /// Added to the endpoint timeout when computing the reservation TTL, so a
    /// crashed worker's hold expires shortly after its request could have.
    pub budget_reservation_ttl_slack_secs: u64,
    /// Fraction of the monthly budget that triggers the warning webhook.
    pub budget_soft_limit_ratio: f64,
    pub budget_warning_webhook_url: Option<String>,
    pub admission_timeout_secs: u64,
    pub health_check_poll_interval_secs: u64,
    pub health_check_batch_size: usize,
    pub spool_dir: PathBuf,
    pub default_model: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("sekisho.db"),
            redis_url: None,
            gateway_shared_secret: "change-me".to_string(),
            api_key_prefix: "sk-gate-".to_string(),
            default_rate_limit_rpm: 60,
            api_key_cache_ttl_secs: 60,
            api_key_negative_cache_ttl_secs: 5,
            budget_reservation_ttl_slack_secs: 60,
            budget_soft_limit_ratio: 0.8,
            budget_warning_webhook_url: None,
            admission_timeout_secs: 5,
            health_check_poll_interval_secs: 5,
            health_check_batch_size: 50,
            spool_dir: PathBuf::from("spool"),
            default_model: None,
            log_level: "info".to_string(),
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("listen", &self.listen)
            .field("database_path", &self.database_path)
            .field("redis_url", &self.redis_url.as_deref().map(|_| "<redacted>"))
            .field("gateway_shared_secret", &"<redacted>")
            .field("api_key_prefix", &self.api_key_prefix)
            .field("default_rate_limit_rpm", &self.default_rate_limit_rpm)
            .field("admission_timeout_secs", &self.admission_timeout_secs)
            .field("default_model", &self.default_model)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen: env_string("LISTEN").unwrap_or(defaults.listen),
            database_path: env_string("DATABASE_URL")
                .map(|raw| PathBuf::from(strip_sqlite_scheme(&raw)))
                .unwrap_or(defaults.database_path),
            redis_url: env_string("REDIS_URL"),
            gateway_shared_secret: env_string("GATEWAY_SHARED_SECRET")
                .unwrap_or(defaults.gateway_shared_secret),
            api_key_prefix: env_string("API_KEY_PREFIX").unwrap_or(defaults.api_key_prefix),
            default_rate_limit_rpm: env_parse("RATE_LIMIT_REQUESTS_PER_MINUTE")
                .unwrap_or(defaults.default_rate_limit_rpm),
            api_key_cache_ttl_secs: env_parse("API_KEY_CACHE_TTL")
                .unwrap_or(defaults.api_key_cache_ttl_secs),
            api_key_negative_cache_ttl_secs: env_parse("API_KEY_NEGATIVE_CACHE_TTL")
                .unwrap_or(defaults.api_key_negative_cache_ttl_secs),
            budget_reservation_ttl_slack_secs: env_parse("BUDGET_RESERVATION_TTL_SLACK")
                .unwrap_or(defaults.budget_reservation_ttl_slack_secs),
            budget_soft_limit_ratio: env_parse("BUDGET_SOFT_LIMIT_RATIO")
                .unwrap_or(defaults.budget_soft_limit_ratio),
            budget_warning_webhook_url: env_string("BUDGET_WARNING_WEBHOOK_URL"),
            admission_timeout_secs: env_parse("ADMISSION_TIMEOUT_SECS")
                .unwrap_or(defaults.admission_timeout_secs),
            health_check_poll_interval_secs: env_parse("HEALTH_CHECK_POLL_INTERVAL")
                .unwrap_or(defaults.health_check_poll_interval_secs),
            health_check_batch_size: env_parse("HEALTH_CHECK_BATCH_SIZE")
                .unwrap_or(defaults.health_check_batch_size),
            spool_dir: env_string("SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),
            default_model: env_string("DEFAULT_MODEL"),
            log_level: env_string("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse().ok())
}

fn strip_sqlite_scheme(raw: &str) -> &str {
    raw.strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_scheme_is_stripped() {
        assert_eq!(strip_sqlite_scheme("sqlite:///var/db/gw.db"), "/var/db/gw.db");
        assert_eq!(strip_sqlite_scheme("sqlite:gw.db"), "gw.db");
        assert_eq!(strip_sqlite_scheme("gw.db"), "gw.db");
    }

    #[test]
    fn debug_redacts_secret() {
        let settings = Settings::default();
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("change-me"));
    }
}
