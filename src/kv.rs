use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use crate::types::now_epoch_millis;

const RATE_LIMIT_TTL_SECS: u64 = 3 * 60;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unexpected script response")]
    Script,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Exceeded { attempted_jpy_micros: u64 },
}

/// Atomic single-key operations on the shared store.
///
/// Two implementations honour the same contracts: [`RedisKv`] (Lua scripts,
/// shared across replicas) and [`MemoryKv`] (one mutex section per op,
/// single-replica deployments and tests).
#[async_trait]
pub trait SharedKv: Send + Sync {
    async fn ping(&self) -> Result<(), KvError>;

    async fn cache_get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn cache_set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn cache_delete(&self, key: &str) -> Result<(), KvError>;

    /// Counts this request against the scope's sliding 60 s window and says
    /// whether it is admitted. Blocked requests are not counted.
    async fn rate_limit_consume(
        &self,
        scope: &str,
        rpm: u32,
        now_epoch_secs: u64,
    ) -> Result<RateDecision, KvError>;

    /// One atomic step: read pending, compare `spent + pending + estimate`
    /// against the limit, and add the estimate with a TTL when within it.
    async fn reserve_budget(
        &self,
        pending_key: &str,
        spent_jpy_micros: u64,
        limit_jpy_micros: u64,
        estimate_jpy_micros: u64,
        ttl_secs: u64,
    ) -> Result<ReserveOutcome, KvError>;

    /// Returns a reservation's estimate to the pool, flooring at zero.
    async fn release_reservation(
        &self,
        pending_key: &str,
        estimate_jpy_micros: u64,
    ) -> Result<(), KvError>;

    /// SETNX-style claim used to deduplicate at-least-once deliveries.
    async fn acquire_once(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError>;
}

// ── Redis ────────────────────────────────────────────────────────

const RATE_LIMIT_SCRIPT: &str = r#"
local rpm = tonumber(ARGV[1])
local second = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local req_cur = tonumber(redis.call("GET", KEYS[1]) or "0")
local req_prev = tonumber(redis.call("GET", KEYS[2]) or "0")

local next_cur = req_cur + 1
local weighted = next_cur * 60 + req_prev * (60 - second)

if rpm <= 0 or weighted > rpm * 60 then
  return 0
end

redis.call("SET", KEYS[1], next_cur, "EX", ttl)
return 1
"#;

const RESERVE_SCRIPT: &str = r#"
local pending_key = KEYS[1]
local spent = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local estimate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local pending = tonumber(redis.call("GET", pending_key) or "0")
local attempted = spent + pending + estimate
if attempted > limit then
  return { 0, attempted }
end

redis.call("INCRBY", pending_key, estimate)
redis.call("EXPIRE", pending_key, ttl)
return { 1, attempted }
"#;

const RELEASE_SCRIPT: &str = r#"
local after = redis.call("DECRBY", KEYS[1], ARGV[1])
if after < 0 then
  redis.call("SET", KEYS[1], "0", "KEEPTTL")
end
return 1
"#;

#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
    prefix: String,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisKv {
    pub fn new(url: impl AsRef<str>) -> Result<Self, KvError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "sekisho".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

#[async_trait]
impl SharedKv for RedisKv {
    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(self.namespaced("__ping__")).await?;
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(self.namespaced(key)).await?)
    }

    async fn cache_set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(self.namespaced(key), value, ttl_secs).await?;
        Ok(())
    }

    async fn cache_delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(self.namespaced(key)).await?;
        Ok(())
    }

    async fn rate_limit_consume(
        &self,
        scope: &str,
        rpm: u32,
        now_epoch_secs: u64,
    ) -> Result<RateDecision, KvError> {
        let minute = now_epoch_secs / 60;
        let second = (now_epoch_secs % 60).min(59);

        let cur_key = self.namespaced(&format!("{scope}:{minute}"));
        let prev_key = self.namespaced(&format!("{scope}:{}", minute.saturating_sub(1)));

        let mut conn = self.connection().await?;
        let code: i64 = redis::Script::new(RATE_LIMIT_SCRIPT)
            .key(cur_key)
            .key(prev_key)
            .arg(i64::from(rpm))
            .arg(second as i64)
            .arg(RATE_LIMIT_TTL_SECS as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateDecision {
            allowed: code == 1,
            retry_after_secs: 60 - second,
        })
    }

    async fn reserve_budget(
        &self,
        pending_key: &str,
        spent_jpy_micros: u64,
        limit_jpy_micros: u64,
        estimate_jpy_micros: u64,
        ttl_secs: u64,
    ) -> Result<ReserveOutcome, KvError> {
        let mut conn = self.connection().await?;
        let result: Vec<i64> = redis::Script::new(RESERVE_SCRIPT)
            .key(self.namespaced(pending_key))
            .arg(clamp_to_i64(spent_jpy_micros))
            .arg(clamp_to_i64(limit_jpy_micros))
            .arg(clamp_to_i64(estimate_jpy_micros))
            .arg(ttl_secs.max(1) as i64)
            .invoke_async(&mut conn)
            .await?;

        match result.as_slice() {
            [1, _] => Ok(ReserveOutcome::Reserved),
            [0, attempted] => Ok(ReserveOutcome::Exceeded {
                attempted_jpy_micros: (*attempted).max(0) as u64,
            }),
            _ => Err(KvError::Script),
        }
    }

    async fn release_reservation(
        &self,
        pending_key: &str,
        estimate_jpy_micros: u64,
    ) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.namespaced(pending_key))
            .arg(clamp_to_i64(estimate_jpy_micros))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire_once(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }
}

fn clamp_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

// ── In-process ───────────────────────────────────────────────────

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at_ms: Option<u64>,
}

/// Single-process rendition of the shared store. Each trait method runs as
/// one mutex section, matching the atomicity of the Lua scripts.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_int(entries: &HashMap<String, MemoryEntry>, key: &str, now_ms: u64) -> i64 {
        match entries.get(key) {
            Some(entry) if !expired(entry, now_ms) => entry.value.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

fn expired(entry: &MemoryEntry, now_ms: u64) -> bool {
    matches!(entry.expires_at_ms, Some(at) if at <= now_ms)
}

#[async_trait]
impl SharedKv for MemoryKv {
    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now_ms = now_epoch_millis();
        let mut entries = self.entries.lock().expect("kv poisoned");
        match entries.get(key) {
            Some(entry) if expired(entry, now_ms) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn cache_set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at_ms: Some(now_epoch_millis() + ttl_secs * 1000),
            },
        );
        Ok(())
    }

    async fn cache_delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn rate_limit_consume(
        &self,
        scope: &str,
        rpm: u32,
        now_epoch_secs: u64,
    ) -> Result<RateDecision, KvError> {
        let minute = now_epoch_secs / 60;
        let second = (now_epoch_secs % 60).min(59);
        let cur_key = format!("{scope}:{minute}");
        let prev_key = format!("{scope}:{}", minute.saturating_sub(1));
        let now_ms = now_epoch_secs * 1000;

        let mut entries = self.entries.lock().expect("kv poisoned");
        let cur = Self::live_int(&entries, &cur_key, now_ms);
        let prev = Self::live_int(&entries, &prev_key, now_ms);

        let next_cur = cur + 1;
        let weighted = next_cur * 60 + prev * (60 - second as i64);
        if rpm == 0 || weighted > i64::from(rpm) * 60 {
            return Ok(RateDecision {
                allowed: false,
                retry_after_secs: 60 - second,
            });
        }

        entries.insert(
            cur_key,
            MemoryEntry {
                value: next_cur.to_string(),
                expires_at_ms: Some(now_ms + RATE_LIMIT_TTL_SECS * 1000),
            },
        );
        Ok(RateDecision {
            allowed: true,
            retry_after_secs: 60 - second,
        })
    }

    async fn reserve_budget(
        &self,
        pending_key: &str,
        spent_jpy_micros: u64,
        limit_jpy_micros: u64,
        estimate_jpy_micros: u64,
        ttl_secs: u64,
    ) -> Result<ReserveOutcome, KvError> {
        let now_ms = now_epoch_millis();
        let mut entries = self.entries.lock().expect("kv poisoned");
        let pending = Self::live_int(&entries, pending_key, now_ms).max(0) as u64;

        let attempted = spent_jpy_micros
            .saturating_add(pending)
            .saturating_add(estimate_jpy_micros);
        if attempted > limit_jpy_micros {
            return Ok(ReserveOutcome::Exceeded {
                attempted_jpy_micros: attempted,
            });
        }

        entries.insert(
            pending_key.to_string(),
            MemoryEntry {
                value: (pending + estimate_jpy_micros).to_string(),
                expires_at_ms: Some(now_ms + ttl_secs.max(1) * 1000),
            },
        );
        Ok(ReserveOutcome::Reserved)
    }

    async fn release_reservation(
        &self,
        pending_key: &str,
        estimate_jpy_micros: u64,
    ) -> Result<(), KvError> {
        let now_ms = now_epoch_millis();
        let mut entries = self.entries.lock().expect("kv poisoned");
        let pending = Self::live_int(&entries, pending_key, now_ms).max(0) as u64;
        let next = pending.saturating_sub(estimate_jpy_micros);
        if let Some(entry) = entries.get_mut(pending_key) {
            entry.value = next.to_string();
        }
        Ok(())
    }

    async fn acquire_once(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let now_ms = now_epoch_millis();
        let mut entries = self.entries.lock().expect("kv poisoned");
        match entries.get(key) {
            Some(entry) if !expired(entry, now_ms) => Ok(false),
            _ => {
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: "1".to_string(),
                        expires_at_ms: Some(now_ms + ttl_secs.max(1) * 1000),
                    },
                );
                Ok(true)
            }
        }
    }
}
