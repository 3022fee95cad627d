use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension;
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::types::{
    ApiKeyRecord, AppRecord, EndpointConfig, ModelConfig, PaymentStatus, TokenUsage, UsageRecord,
    UsageStatus, UserRecord,
};

const MONTH_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]");

/// Durable truth: principals, models, endpoints, and the monthly usage
/// partitions. All access funnels through `spawn_blocking` so the sqlite
/// calls never block a runtime worker.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid month: {0}")]
    InvalidMonth(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }

    // ── users ────────────────────────────────────────────────────

    pub async fn upsert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let user = user.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (oid, email, payment_status, payment_valid_until, total_cost_jpy_micros)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(oid) DO UPDATE SET
                   email = excluded.email,
                   payment_status = excluded.payment_status,
                   payment_valid_until = excluded.payment_valid_until",
                rusqlite::params![
                    user.oid,
                    user.email,
                    user.payment_status.as_str(),
                    user.payment_valid_until,
                    clamp_u64(user.total_cost_jpy_micros),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn user_by_oid(&self, oid: &str) -> Result<Option<UserRecord>, StoreError> {
        let oid = oid.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT oid, email, payment_status, payment_valid_until, total_cost_jpy_micros
                 FROM users WHERE oid = ?1",
                rusqlite::params![oid],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn set_user_payment_status(
        &self,
        oid: &str,
        status: PaymentStatus,
    ) -> Result<(), StoreError> {
        let oid = oid.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET payment_status = ?2 WHERE oid = ?1",
                rusqlite::params![oid, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_user_cost(&self, oid: &str, jpy_micros: u64) -> Result<(), StoreError> {
        let oid = oid.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users
                 SET total_cost_jpy_micros = total_cost_jpy_micros + ?2
                 WHERE oid = ?1",
                rusqlite::params![oid, clamp_u64(jpy_micros)],
            )?;
            Ok(())
        })
        .await
    }

    // ── apps ─────────────────────────────────────────────────────

    pub async fn upsert_app(&self, app: &AppRecord) -> Result<(), StoreError> {
        let app = app.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO apps (app_id, name, owner_oid, is_active)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(app_id) DO UPDATE SET
                   name = excluded.name,
                   owner_oid = excluded.owner_oid,
                   is_active = excluded.is_active",
                rusqlite::params![app.app_id, app.name, app.owner_oid, app.is_active],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn app_by_id(&self, app_id: &str) -> Result<Option<AppRecord>, StoreError> {
        let app_id = app_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT app_id, name, owner_oid, is_active FROM apps WHERE app_id = ?1",
                rusqlite::params![app_id],
                |row| {
                    Ok(AppRecord {
                        app_id: row.get(0)?,
                        name: row.get(1)?,
                        owner_oid: row.get(2)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    // ── api keys ─────────────────────────────────────────────────

    pub async fn upsert_api_key(&self, key: &ApiKeyRecord) -> Result<(), StoreError> {
        let key = key.clone();
        self.call(move |conn| {
            let allowed_models = match &key.allowed_models {
                Some(models) => Some(serde_json::to_string(models)?),
                None => None,
            };
            let allowed_ips = match &key.allowed_ips {
                Some(ips) => Some(serde_json::to_string(ips)?),
                None => None,
            };
            conn.execute(
                "INSERT INTO api_keys (
                   id, user_oid, secret_digest, salt, display_prefix, rate_limit_rpm,
                   budget_monthly_jpy_micros, usage_current_month_jpy_micros, last_reset_month,
                   allowed_models, allowed_ips, is_active, expires_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                   rate_limit_rpm = excluded.rate_limit_rpm,
                   budget_monthly_jpy_micros = excluded.budget_monthly_jpy_micros,
                   allowed_models = excluded.allowed_models,
                   allowed_ips = excluded.allowed_ips,
                   is_active = excluded.is_active,
                   expires_at = excluded.expires_at",
                rusqlite::params![
                    key.id,
                    key.user_oid,
                    key.secret_digest,
                    key.salt,
                    key.display_prefix,
                    key.rate_limit_rpm,
                    key.budget_monthly_jpy_micros.map(clamp_u64),
                    clamp_u64(key.usage_current_month_jpy_micros),
                    key.last_reset_month,
                    allowed_models,
                    allowed_ips,
                    key.is_active,
                    key.expires_at.map(clamp_u64),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn api_key_by_id(&self, id: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!("{API_KEY_SELECT} WHERE id = ?1"),
                    rusqlite::params![id],
                    row_to_api_key_raw,
                )
                .optional()?;
            row.map(finish_api_key).transpose()
        })
        .await
    }

    pub async fn api_key_by_digest(
        &self,
        secret_digest: &str,
    ) -> Result<Option<ApiKeyRecord>, StoreError> {
        let secret_digest = secret_digest.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!("{API_KEY_SELECT} WHERE secret_digest = ?1"),
                    rusqlite::params![secret_digest],
                    row_to_api_key_raw,
                )
                .optional()?;
            row.map(finish_api_key).transpose()
        })
        .await
    }

    /// Active keys only; bearer verification scans these, computing each
    /// candidate's salted digest.
    pub async fn active_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare(&format!("{API_KEY_SELECT} WHERE is_active = 1 ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_api_key_raw)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(finish_api_key(row?)?);
            }
            Ok(out)
        })
        .await
    }

    /// Zeroes the month-to-date counter, exactly once per month transition:
    /// the guard on `last_reset_month` makes concurrent resets idempotent.
    pub async fn reset_monthly_usage(&self, key_id: &str, month: &str) -> Result<(), StoreError> {
        let key_id = key_id.to_string();
        let month = month.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE api_keys
                 SET usage_current_month_jpy_micros = 0, last_reset_month = ?2
                 WHERE id = ?1 AND last_reset_month <> ?2",
                rusqlite::params![key_id, month],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_key_usage(&self, key_id: &str, jpy_micros: u64) -> Result<(), StoreError> {
        let key_id = key_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE api_keys
                 SET usage_current_month_jpy_micros = usage_current_month_jpy_micros + ?2
                 WHERE id = ?1",
                rusqlite::params![key_id, clamp_u64(jpy_micros)],
            )?;
            Ok(())
        })
        .await
    }

    // ── models & endpoints ───────────────────────────────────────

    pub async fn upsert_model(&self, model: &ModelConfig) -> Result<(), StoreError> {
        let id = model.id.clone();
        let value_json = serde_json::to_string(model)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO models (id, value_json) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET value_json = excluded.value_json",
                rusqlite::params![id, value_json],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn model_by_id(&self, id: &str) -> Result<Option<ModelConfig>, StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM models WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            Ok(Some(serde_json::from_str(&raw)?))
        })
        .await
    }

    pub async fn upsert_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), StoreError> {
        let id = endpoint.id.clone();
        let model_id = endpoint.model_id.clone();
        let value_json = serde_json::to_string(endpoint)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO endpoints (id, model_id, value_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                   model_id = excluded.model_id,
                   value_json = excluded.value_json",
                rusqlite::params![id, model_id, value_json],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn endpoints_for_model(
        &self,
        model_id: &str,
    ) -> Result<Vec<EndpointConfig>, StoreError> {
        let model_id = model_id.to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT value_json FROM endpoints WHERE model_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(rusqlite::params![model_id], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn all_endpoints(&self) -> Result<Vec<EndpointConfig>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT value_json FROM endpoints ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            Ok(out)
        })
        .await
    }

    // ── usage records ────────────────────────────────────────────

    pub async fn insert_usage_record(
        &self,
        month: &str,
        record: &UsageRecord,
    ) -> Result<(), StoreError> {
        let table = usage_table_name(month)?;
        let record = record.clone();
        self.call(move |conn| {
            ensure_usage_table(conn, &table)?;
            conn.execute(
                &format!(
                    "INSERT INTO {table} (
                       request_id, user_oid, api_key_id, app_id, ip_address, user_agent,
                       requested_model, actual_model, endpoint_id,
                       input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                       cost_jpy_micros, status, error_code, error_message,
                       latency_ms, ttft_ms, created_at_ms
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                rusqlite::params![
                    record.request_id,
                    record.user_oid,
                    record.api_key_id,
                    record.app_id,
                    record.ip_address,
                    record.user_agent,
                    record.requested_model,
                    record.actual_model,
                    record.endpoint_id,
                    record.usage.input_tokens,
                    record.usage.output_tokens,
                    record.usage.cache_creation_tokens,
                    record.usage.cache_read_tokens,
                    clamp_u64(record.cost_jpy_micros),
                    record.status.as_str(),
                    record.error_code,
                    record.error_message,
                    record.latency_ms.map(clamp_u64),
                    record.ttft_ms.map(clamp_u64),
                    clamp_u64(record.created_at_ms),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn usage_records_for_month(
        &self,
        month: &str,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let table = usage_table_name(month)?;
        self.call(move |conn| {
            ensure_usage_table(conn, &table)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT request_id, user_oid, api_key_id, app_id, ip_address, user_agent,
                        requested_model, actual_model, endpoint_id,
                        input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                        cost_jpy_micros, status, error_code, error_message,
                        latency_ms, ttft_ms, created_at_ms
                 FROM {table} ORDER BY created_at_ms, request_id"
            ))?;
            let rows = stmt.query_map([], row_to_usage_record)?;
            let mut out = Vec::new();
            for row in rows {
                let (record, status_raw) = row?;
                let status = UsageStatus::parse(&status_raw)
                    .ok_or_else(|| StoreError::InvalidRow(format!("status {status_raw}")))?;
                out.push(UsageRecord { status, ..record });
            }
            Ok(out)
        })
        .await
    }

    /// Pre-creates the partitions for the upcoming `months_ahead` months, the
    /// hook the external maintenance job calls on its schedule.
    pub async fn ensure_partitions(&self, months_ahead: u32) -> Result<(), StoreError> {
        let mut months = Vec::new();
        let mut cursor = OffsetDateTime::now_utc().date();
        for _ in 0..=months_ahead {
            months.push(
                cursor
                    .format(MONTH_FORMAT)
                    .map_err(|err| StoreError::InvalidMonth(err.to_string()))?,
            );
            let (next_year, next_month) = match cursor.month().next() {
                time::Month::January => (cursor.year() + 1, time::Month::January),
                other => (cursor.year(), other),
            };
            cursor = time::Date::from_calendar_date(next_year, next_month, 1)
                .map_err(|err| StoreError::InvalidMonth(err.to_string()))?;
        }

        let tables: Result<Vec<String>, StoreError> =
            months.iter().map(|month| usage_table_name(month)).collect();
        let tables = tables?;
        self.call(move |conn| {
            for table in &tables {
                ensure_usage_table(conn, table)?;
            }
            Ok(())
        })
        .await
    }
}

const API_KEY_SELECT: &str = "SELECT id, user_oid, secret_digest, salt, display_prefix, rate_limit_rpm,
        budget_monthly_jpy_micros, usage_current_month_jpy_micros, last_reset_month,
        allowed_models, allowed_ips, is_active, expires_at
 FROM api_keys";

struct RawApiKeyRow {
    key: ApiKeyRecord,
    allowed_models: Option<String>,
    allowed_ips: Option<String>,
}

fn row_to_api_key_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawApiKeyRow> {
    Ok(RawApiKeyRow {
        key: ApiKeyRecord {
            id: row.get(0)?,
            user_oid: row.get(1)?,
            secret_digest: row.get(2)?,
            salt: row.get(3)?,
            display_prefix: row.get(4)?,
            rate_limit_rpm: row.get(5)?,
            budget_monthly_jpy_micros: row.get::<_, Option<i64>>(6)?.map(|v| v.max(0) as u64),
            usage_current_month_jpy_micros: row.get::<_, i64>(7)?.max(0) as u64,
            last_reset_month: row.get(8)?,
            allowed_models: None,
            allowed_ips: None,
            is_active: row.get(11)?,
            expires_at: row.get::<_, Option<i64>>(12)?.map(|v| v.max(0) as u64),
        },
        allowed_models: row.get(9)?,
        allowed_ips: row.get(10)?,
    })
}

fn finish_api_key(raw: RawApiKeyRow) -> Result<ApiKeyRecord, StoreError> {
    let mut key = raw.key;
    if let Some(models) = raw.allowed_models {
        key.allowed_models = Some(serde_json::from_str(&models)?);
    }
    if let Some(ips) = raw.allowed_ips {
        key.allowed_ips = Some(serde_json::from_str(&ips)?);
    }
    Ok(key)
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let status_raw: String = row.get(2)?;
    Ok(UserRecord {
        oid: row.get(0)?,
        email: row.get(1)?,
        payment_status: PaymentStatus::parse(&status_raw).unwrap_or(PaymentStatus::Expired),
        payment_valid_until: row.get(3)?,
        total_cost_jpy_micros: row.get::<_, i64>(4)?.max(0) as u64,
    })
}

type UsageRow = (UsageRecord, String);

fn row_to_usage_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRow> {
    let record = UsageRecord {
        request_id: row.get(0)?,
        user_oid: row.get(1)?,
        api_key_id: row.get(2)?,
        app_id: row.get(3)?,
        ip_address: row.get(4)?,
        user_agent: row.get(5)?,
        requested_model: row.get(6)?,
        actual_model: row.get(7)?,
        endpoint_id: row.get(8)?,
        usage: TokenUsage {
            input_tokens: row.get(9)?,
            output_tokens: row.get(10)?,
            cache_creation_tokens: row.get(11)?,
            cache_read_tokens: row.get(12)?,
        },
        cost_jpy_micros: row.get::<_, i64>(13)?.max(0) as u64,
        status: UsageStatus::Pending,
        error_code: row.get(15)?,
        error_message: row.get(16)?,
        latency_ms: row.get::<_, Option<i64>>(17)?.map(|v| v.max(0) as u64),
        ttft_ms: row.get::<_, Option<i64>>(18)?.map(|v| v.max(0) as u64),
        created_at_ms: row.get::<_, i64>(19)?.max(0) as u64,
    };
    let status_raw: String = row.get(14)?;
    Ok((record, status_raw))
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, StoreError> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
           oid TEXT PRIMARY KEY,
           email TEXT NOT NULL UNIQUE,
           payment_status TEXT NOT NULL,
           payment_valid_until TEXT,
           total_cost_jpy_micros INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS apps (
           app_id TEXT PRIMARY KEY,
           name TEXT NOT NULL,
           owner_oid TEXT NOT NULL,
           is_active INTEGER NOT NULL DEFAULT 1
         );
         CREATE TABLE IF NOT EXISTS api_keys (
           id TEXT PRIMARY KEY,
           user_oid TEXT NOT NULL,
           secret_digest TEXT NOT NULL UNIQUE,
           salt TEXT NOT NULL,
           display_prefix TEXT NOT NULL,
           rate_limit_rpm INTEGER NOT NULL,
           budget_monthly_jpy_micros INTEGER,
           usage_current_month_jpy_micros INTEGER NOT NULL DEFAULT 0,
           last_reset_month TEXT NOT NULL,
           allowed_models TEXT,
           allowed_ips TEXT,
           is_active INTEGER NOT NULL DEFAULT 1,
           expires_at INTEGER
         );
         CREATE TABLE IF NOT EXISTS models (
           id TEXT PRIMARY KEY,
           value_json TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS endpoints (
           id TEXT PRIMARY KEY,
           model_id TEXT NOT NULL,
           value_json TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_endpoints_model ON endpoints (model_id);",
    )?;
    Ok(())
}

/// Maps `YYYY-MM` to its partition table, rejecting anything that is not a
/// month literal before it is spliced into SQL.
fn usage_table_name(month: &str) -> Result<String, StoreError> {
    let bytes = month.as_bytes();
    let shape_ok = bytes.len() == 7
        && bytes[4] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(idx, b)| idx == 4 || b.is_ascii_digit());
    if !shape_ok {
        return Err(StoreError::InvalidMonth(month.to_string()));
    }
    Ok(format!("usage_records_{}", month.replace('-', "_")))
}

fn ensure_usage_table(conn: &rusqlite::Connection, table: &str) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           request_id TEXT NOT NULL,
           user_oid TEXT NOT NULL,
           api_key_id TEXT,
           app_id TEXT,
           ip_address TEXT,
           user_agent TEXT,
           requested_model TEXT NOT NULL,
           actual_model TEXT,
           endpoint_id TEXT,
           input_tokens INTEGER NOT NULL DEFAULT 0,
           output_tokens INTEGER NOT NULL DEFAULT 0,
           cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
           cache_read_tokens INTEGER NOT NULL DEFAULT 0,
           cost_jpy_micros INTEGER NOT NULL DEFAULT 0,
           status TEXT NOT NULL,
           error_code TEXT,
           error_message TEXT,
           latency_ms INTEGER,
           ttft_ms INTEGER,
           created_at_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_{table}_user ON {table} (user_oid);
         CREATE INDEX IF NOT EXISTS idx_{table}_key ON {table} (api_key_id);"
    ))?;
    Ok(())
}

fn clamp_u64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}
