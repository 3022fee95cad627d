use std::sync::Arc;

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::GatewayError;
use crate::kv::SharedKv;
use crate::store::SqliteStore;
use crate::types::{today_utc, ApiKeyRecord, AppRecord, PaymentStatus, UserRecord};

const NEGATIVE_CACHE_MARKER: &str = "!";

/// Everything an operator needs to hand out a new key. The plaintext exists
/// only in this value; the store keeps digest and salt.
pub struct GeneratedKey {
    pub plaintext: String,
    pub secret_digest: String,
    pub salt: String,
    pub display_prefix: String,
}

impl std::fmt::Debug for GeneratedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKey")
            .field("plaintext", &"<redacted>")
            .field("display_prefix", &self.display_prefix)
            .finish()
    }
}

pub fn generate_api_key(prefix: &str) -> GeneratedKey {
    let mut rng = rand::thread_rng();

    let mut secret = [0u8; 32];
    rng.fill_bytes(&mut secret);
    let plaintext = format!(
        "{prefix}{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret)
    );

    let mut salt_bytes = [0u8; 16];
    rng.fill_bytes(&mut salt_bytes);
    let salt = hex_encode(&salt_bytes);

    let secret_digest = digest_hex(&plaintext, &salt);
    let display_prefix = format!("{}...", &plaintext[..plaintext.len().min(15)]);

    GeneratedKey {
        plaintext,
        secret_digest,
        salt,
        display_prefix,
    }
}

/// Hex `sha256(plaintext || salt)`, the persisted key digest.
pub fn digest_hex(plaintext: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hasher.update(salt.as_bytes());
    hex_encode(&hasher.finalize())
}

fn cache_digest(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    left.len() == right.len() && left.as_bytes().ct_eq(right.as_bytes()).into()
}

/// Resolves bearer keys and shared-secret delegation tuples to validated
/// records, caching verified bearer lookups in the shared store.
#[derive(Clone)]
pub struct CredentialStore {
    store: SqliteStore,
    kv: Arc<dyn SharedKv>,
    api_key_prefix: String,
    shared_secret: String,
    cache_ttl_secs: u64,
    negative_cache_ttl_secs: u64,
}

impl CredentialStore {
    pub fn new(
        store: SqliteStore,
        kv: Arc<dyn SharedKv>,
        api_key_prefix: impl Into<String>,
        shared_secret: impl Into<String>,
        cache_ttl_secs: u64,
        negative_cache_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            kv,
            api_key_prefix: api_key_prefix.into(),
            shared_secret: shared_secret.into(),
            cache_ttl_secs,
            negative_cache_ttl_secs,
        }
    }

    /// Bearer mode. Returns the key record after prefix, digest, activity,
    /// expiry and IP checks.
    pub async fn verify_bearer(
        &self,
        plaintext: &str,
        client_ip: &str,
        now_epoch_secs: u64,
    ) -> Result<ApiKeyRecord, GatewayError> {
        if !plaintext.starts_with(&self.api_key_prefix) {
            return Err(GatewayError::Unauthorized {
                reason: "invalid API key".to_string(),
            });
        }

        let cache_key = format!("apikey:{}", cache_digest(plaintext));
        if let Some(cached) = self.kv.cache_get(&cache_key).await? {
            if cached == NEGATIVE_CACHE_MARKER {
                return Err(GatewayError::Unauthorized {
                    reason: "invalid API key".to_string(),
                });
            }
            if let Some(key) = self.store.api_key_by_id(&cached).await? {
                if key.is_active && constant_time_eq(&digest_hex(plaintext, &key.salt), &key.secret_digest) {
                    return self.admit_key(key, client_ip, now_epoch_secs);
                }
            }
            // Stale cache entry (revoked or rotated key): fall through to a
            // full verification pass.
        }

        let verified = self.verify_against_store(plaintext).await?;
        match verified {
            Some(key) => {
                self.kv
                    .cache_set(&cache_key, &key.id, self.cache_ttl_secs)
                    .await?;
                self.admit_key(key, client_ip, now_epoch_secs)
            }
            None => {
                self.kv
                    .cache_set(&cache_key, NEGATIVE_CACHE_MARKER, self.negative_cache_ttl_secs)
                    .await?;
                Err(GatewayError::Unauthorized {
                    reason: "invalid API key".to_string(),
                })
            }
        }
    }

    async fn verify_against_store(
        &self,
        plaintext: &str,
    ) -> Result<Option<ApiKeyRecord>, GatewayError> {
        let keys = self.store.active_api_keys().await?;
        for key in keys {
            if constant_time_eq(&digest_hex(plaintext, &key.salt), &key.secret_digest) {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    fn admit_key(
        &self,
        key: ApiKeyRecord,
        client_ip: &str,
        now_epoch_secs: u64,
    ) -> Result<ApiKeyRecord, GatewayError> {
        if !key.is_active {
            return Err(GatewayError::Unauthorized {
                reason: "invalid API key".to_string(),
            });
        }
        if key.is_expired(now_epoch_secs) {
            return Err(GatewayError::Unauthorized {
                reason: "API key expired".to_string(),
            });
        }
        if !key.allows_ip(client_ip) {
            tracing::warn!(api_key_id = %key.id, client_ip, "ip not allowed");
            return Err(GatewayError::Forbidden {
                reason: "IP address not allowed".to_string(),
            });
        }
        Ok(key)
    }

    /// Delegation mode: constant-time shared-secret check, then App and User
    /// resolution. The returned principal bills the named user directly.
    pub async fn verify_delegation(
        &self,
        presented_secret: &str,
        app_id: &str,
        user_oid: &str,
    ) -> Result<(AppRecord, UserRecord), GatewayError> {
        if !constant_time_eq(presented_secret, &self.shared_secret) {
            return Err(GatewayError::Unauthorized {
                reason: "gateway secret mismatch".to_string(),
            });
        }

        let app = self.resolve_app(app_id).await?;
        let user = self.validate_user(user_oid).await?;
        Ok((app, user))
    }

    pub async fn resolve_app(&self, app_id: &str) -> Result<AppRecord, GatewayError> {
        let Some(app) = self.store.app_by_id(app_id).await? else {
            return Err(GatewayError::Unauthorized {
                reason: format!("invalid app id: {app_id}"),
            });
        };
        if !app.is_active {
            return Err(GatewayError::Forbidden {
                reason: format!("app is disabled: {app_id}"),
            });
        }
        Ok(app)
    }

    /// Checks the billed user exists and may spend. A user whose
    /// `payment_valid_until` has passed is synced to expired here, so the
    /// durable row converges on what this request already observed.
    pub async fn validate_user(&self, user_oid: &str) -> Result<UserRecord, GatewayError> {
        let Some(mut user) = self.store.user_by_oid(user_oid).await? else {
            return Err(GatewayError::Unauthorized {
                reason: "user not found".to_string(),
            });
        };

        if user.payment_lapsed(today_utc())
            && !matches!(
                user.payment_status,
                PaymentStatus::Expired | PaymentStatus::Banned
            )
        {
            self.store
                .set_user_payment_status(&user.oid, PaymentStatus::Expired)
                .await?;
            user.payment_status = PaymentStatus::Expired;
            tracing::info!(user_oid = %user.oid, "payment expiry synced");
        }

        match user.payment_status {
            PaymentStatus::Active | PaymentStatus::Trial => Ok(user),
            PaymentStatus::Banned => Err(GatewayError::Forbidden {
                reason: "account banned".to_string(),
            }),
            PaymentStatus::Expired => Err(GatewayError::Forbidden {
                reason: "payment expired".to_string(),
            }),
        }
    }

    /// Drops the cached verification for a plaintext key. The admin tier
    /// calls this on revocation; until then the TTL bounds staleness.
    pub async fn invalidate_cache(&self, plaintext: &str) -> Result<(), GatewayError> {
        let cache_key = format!("apikey:{}", cache_digest(plaintext));
        self.kv.cache_delete(&cache_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::types::now_epoch_secs;

    fn sample_key(generated: &GeneratedKey) -> ApiKeyRecord {
        ApiKeyRecord {
            id: "k1".to_string(),
            user_oid: "u1".to_string(),
            secret_digest: generated.secret_digest.clone(),
            salt: generated.salt.clone(),
            display_prefix: generated.display_prefix.clone(),
            rate_limit_rpm: 60,
            budget_monthly_jpy_micros: None,
            usage_current_month_jpy_micros: 0,
            last_reset_month: "2026-08".to_string(),
            allowed_models: None,
            allowed_ips: None,
            is_active: true,
            expires_at: None,
        }
    }

    async fn credential_store() -> (tempfile::TempDir, SqliteStore, CredentialStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gw.db"));
        store.init().await.unwrap();
        let credentials = CredentialStore::new(
            store.clone(),
            Arc::new(MemoryKv::new()),
            "sk-gate-",
            "shared-secret",
            60,
            5,
        );
        (dir, store, credentials)
    }

    #[test]
    fn generated_keys_verify_and_differ() {
        let first = generate_api_key("sk-gate-");
        let second = generate_api_key("sk-gate-");

        assert!(first.plaintext.starts_with("sk-gate-"));
        assert_ne!(first.plaintext, second.plaintext);
        assert_ne!(first.salt, second.salt);
        assert_eq!(
            digest_hex(&first.plaintext, &first.salt),
            first.secret_digest
        );
        assert_ne!(
            digest_hex(&first.plaintext, &second.salt),
            first.secret_digest
        );
        assert!(first.display_prefix.ends_with("..."));
    }

    #[tokio::test]
    async fn bearer_verifies_and_caches() {
        let (_dir, store, credentials) = credential_store().await;
        let generated = generate_api_key("sk-gate-");
        store.upsert_api_key(&sample_key(&generated)).await.unwrap();

        let now = now_epoch_secs();
        let key = credentials
            .verify_bearer(&generated.plaintext, "127.0.0.1", now)
            .await
            .unwrap();
        assert_eq!(key.id, "k1");

        // Second verification is served through the cache path.
        let key = credentials
            .verify_bearer(&generated.plaintext, "127.0.0.1", now)
            .await
            .unwrap();
        assert_eq!(key.id, "k1");

        let err = credentials
            .verify_bearer("sk-gate-wrong", "127.0.0.1", now)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);

        let err = credentials
            .verify_bearer("no-prefix", "127.0.0.1", now)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn revoked_key_is_rejected_despite_cache() {
        let (_dir, store, credentials) = credential_store().await;
        let generated = generate_api_key("sk-gate-");
        let mut key = sample_key(&generated);
        store.upsert_api_key(&key).await.unwrap();

        let now = now_epoch_secs();
        credentials
            .verify_bearer(&generated.plaintext, "127.0.0.1", now)
            .await
            .unwrap();

        key.is_active = false;
        store.upsert_api_key(&key).await.unwrap();

        let err = credentials
            .verify_bearer(&generated.plaintext, "127.0.0.1", now)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn ip_allowlist_yields_forbidden() {
        let (_dir, store, credentials) = credential_store().await;
        let generated = generate_api_key("sk-gate-");
        let mut key = sample_key(&generated);
        key.allowed_ips = Some(vec!["10.0.0.1".to_string()]);
        store.upsert_api_key(&key).await.unwrap();

        let err = credentials
            .verify_bearer(&generated.plaintext, "10.0.0.2", now_epoch_secs())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn delegation_checks_secret_app_and_user() {
        let (_dir, store, credentials) = credential_store().await;
        store
            .upsert_user(&UserRecord {
                oid: "user-abc".to_string(),
                email: "abc@example.test".to_string(),
                payment_status: PaymentStatus::Active,
                payment_valid_until: None,
                total_cost_jpy_micros: 0,
            })
            .await
            .unwrap();
        store
            .upsert_app(&AppRecord {
                app_id: "dify-prod".to_string(),
                name: "Dify".to_string(),
                owner_oid: "user-abc".to_string(),
                is_active: true,
            })
            .await
            .unwrap();

        let (app, user) = credentials
            .verify_delegation("shared-secret", "dify-prod", "user-abc")
            .await
            .unwrap();
        assert_eq!(app.app_id, "dify-prod");
        assert_eq!(user.oid, "user-abc");

        let err = credentials
            .verify_delegation("wrong", "dify-prod", "user-abc")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);

        let err = credentials
            .verify_delegation("shared-secret", "missing-app", "user-abc")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn lapsed_payment_is_synced_to_expired() {
        let (_dir, store, credentials) = credential_store().await;
        store
            .upsert_user(&UserRecord {
                oid: "u1".to_string(),
                email: "u1@example.test".to_string(),
                payment_status: PaymentStatus::Active,
                payment_valid_until: Some("2000-01-01".to_string()),
                total_cost_jpy_micros: 0,
            })
            .await
            .unwrap();

        let err = credentials.validate_user("u1").await.unwrap_err();
        assert_eq!(err.status_code(), 403);

        let user = store.user_by_oid("u1").await.unwrap().expect("user");
        assert_eq!(user.payment_status, PaymentStatus::Expired);
    }
}
