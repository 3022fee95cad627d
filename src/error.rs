use thiserror::Error;

use crate::kv::KvError;
use crate::store::StoreError;

/// Request-scoped failure taxonomy.
///
/// Admission errors (`Validation` through `ContextTooLarge`) terminate before
/// dispatch and never produce a usage record. Dispatch errors (`NoEndpoint`
/// through `UpstreamTimeout`) settle as a `failed` usage record.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error("rate limit of {limit_rpm} RPM exceeded")]
    RateLimited { limit_rpm: u32, retry_after_secs: u64 },
    #[error("monthly budget exceeded: limit_jpy_micros={limit_jpy_micros} attempted_jpy_micros={attempted_jpy_micros}")]
    BudgetExceeded {
        limit_jpy_micros: u64,
        attempted_jpy_micros: u64,
    },
    #[error(
        "request exceeds model context window: input={estimated_input_tokens} output={requested_output_tokens} window={context_window}"
    )]
    ContextTooLarge {
        estimated_input_tokens: u32,
        requested_output_tokens: u32,
        context_window: u32,
    },
    #[error("no healthy endpoint for model {model}")]
    NoEndpoint { model: String },
    #[error("all endpoints for model {model} are at capacity")]
    Overloaded { model: String },
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("admission timed out")]
    AdmissionTimeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status for the user-visible response.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Unauthorized { .. } => 401,
            Self::BudgetExceeded { .. } => 402,
            Self::Forbidden { .. } => 403,
            Self::ContextTooLarge { .. } => 413,
            Self::RateLimited { .. } => 429,
            Self::Internal(_) => 500,
            Self::Upstream { .. } => 502,
            Self::NoEndpoint { .. } | Self::Overloaded { .. } => 503,
            Self::UpstreamTimeout | Self::AdmissionTimeout => 504,
        }
    }

    /// Short machine-readable code carried in error envelopes and usage records.
    pub fn error_code(&self) -> String {
        match self {
            Self::Validation { .. } => "invalid_request".to_string(),
            Self::Unauthorized { .. } => "unauthorized".to_string(),
            Self::Forbidden { .. } => "forbidden".to_string(),
            Self::RateLimited { .. } => "rate_limit_exceeded".to_string(),
            Self::BudgetExceeded { .. } => "budget_exceeded".to_string(),
            Self::ContextTooLarge { .. } => "context_length_exceeded".to_string(),
            Self::NoEndpoint { .. } => "no_endpoint".to_string(),
            Self::Overloaded { .. } => "overloaded".to_string(),
            Self::Upstream { status, .. } => format!("upstream.{status}"),
            Self::UpstreamTimeout => "upstream_timeout".to_string(),
            Self::AdmissionTimeout => "admission_timeout".to_string(),
            Self::Internal(_) => "internal_error".to_string(),
        }
    }

    /// True when the dispatch loop may try another endpoint after this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => matches!(status, 502 | 503 | 504),
            Self::UpstreamTimeout => true,
            _ => false,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::Internal(format!("store error: {err}"))
    }
}

impl From<KvError> for GatewayError {
    fn from(err: KvError) -> Self {
        Self::Internal(format!("kv error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(
            GatewayError::BudgetExceeded {
                limit_jpy_micros: 1,
                attempted_jpy_micros: 2
            }
            .status_code(),
            402
        );
        assert_eq!(
            GatewayError::ContextTooLarge {
                estimated_input_tokens: 1,
                requested_output_tokens: 1,
                context_window: 1
            }
            .status_code(),
            413
        );
        assert_eq!(
            GatewayError::NoEndpoint {
                model: "m".to_string()
            }
            .status_code(),
            503
        );
        assert_eq!(GatewayError::AdmissionTimeout.status_code(), 504);
    }

    #[test]
    fn upstream_code_carries_status() {
        let err = GatewayError::Upstream {
            status: 503,
            message: "busy".to_string(),
        };
        assert_eq!(err.error_code(), "upstream.503");
        assert!(err.is_retriable());

        let err = GatewayError::Upstream {
            status: 400,
            message: "bad".to_string(),
        };
        assert!(!err.is_retriable());
    }
}
