use std::sync::Arc;

use crate::error::GatewayError;
use crate::kv::SharedKv;
use crate::principal::Principal;

/// Per-principal sliding-window admission counter over the shared store.
///
/// Bearer principals use their key's `rate_limit_rpm`; delegation-mode
/// principals share a configurable default per (app, user) pair. The counter
/// is consumed exactly once per admission, never on endpoint retries.
#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn SharedKv>,
    default_rpm: u32,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn SharedKv>, default_rpm: u32) -> Self {
        Self { kv, default_rpm }
    }

    pub async fn check(
        &self,
        principal: &Principal,
        now_epoch_secs: u64,
    ) -> Result<(), GatewayError> {
        let rpm = principal
            .api_key
            .as_ref()
            .map(|key| key.rate_limit_rpm)
            .unwrap_or(self.default_rpm);

        let decision = self
            .kv
            .rate_limit_consume(&principal.rate_scope(), rpm, now_epoch_secs)
            .await?;

        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                limit_rpm: rpm,
                retry_after_secs: decision.retry_after_secs,
            });
        }
        Ok(())
    }
}
