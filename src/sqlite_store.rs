use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::policy::{ActionKind, RegenKind};
use crate::store_types::{
    AttemptOutcome, Balance, BalanceRecord, ConsumptionRecord, GrantApplication, GrantKind,
    GrantRecord, GrantSource, NewConsumption, RegenCounter,
};

/// Durable balance store. Every mutation is a single-row sqlite transaction;
/// concurrency control lives in the conditional `UPDATE` clauses, not in any
/// in-process lock.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Creates the balance row if absent. Returns `true` when this call
    /// created it; an existing row is left untouched.
    pub async fn create_account(
        &self,
        account_id: &str,
        free: i64,
        paid: i64,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO balances (account_id, free_remaining, paid_remaining, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![account_id, free.max(0), paid, ts_ms],
            )?;
            Ok(inserted > 0)
        })
        .await?
    }

    /// Point read of one account row plus its regeneration counters.
    pub async fn get_balance(
        &self,
        account_id: &str,
    ) -> Result<Option<BalanceRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<BalanceRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let row: Option<(i64, i64, i64)> = conn
                .query_row(
                    "SELECT free_remaining, paid_remaining, updated_at_ms
                     FROM balances WHERE account_id=?1",
                    rusqlite::params![account_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((free_remaining, paid_remaining, updated_at_ms)) = row else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT resource_id, regen_kind, used
                 FROM regen_counters WHERE account_id=?1
                 ORDER BY resource_id, regen_kind",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut regen_counters = Vec::new();
            for row in rows {
                let (resource_id, raw_kind, used) = row?;
                let kind = RegenKind::parse(&raw_kind).ok_or_else(|| {
                    SqliteStoreError::CorruptRow(format!("unknown regen kind: {raw_kind}"))
                })?;
                regen_counters.push(RegenCounter {
                    resource_id,
                    kind,
                    used: i64_to_u32(used),
                });
            }

            Ok(Some(BalanceRecord {
                account_id,
                free_remaining,
                paid_remaining,
                regen_counters,
                updated_at_ms: i64_to_u64(updated_at_ms),
            }))
        })
        .await?
    }

    /// Compare-and-swap deduction. The write lands only if both tiers still
    /// hold the values the caller read; zero rows affected means another
    /// writer got there first.
    pub async fn deduct_if_unchanged(
        &self,
        account_id: &str,
        expected_free: i64,
        expected_paid: i64,
        free_deduction: i64,
        paid_deduction: i64,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let updated = conn.execute(
                "UPDATE balances
                 SET free_remaining = free_remaining - ?4,
                     paid_remaining = paid_remaining - ?5,
                     updated_at_ms = ?6
                 WHERE account_id = ?1
                   AND free_remaining = ?2
                   AND paid_remaining = ?3",
                rusqlite::params![
                    account_id,
                    expected_free,
                    expected_paid,
                    free_deduction,
                    paid_deduction,
                    ts_ms
                ],
            )?;
            Ok(updated > 0)
        })
        .await?
    }

    /// Conditional increment of one regeneration counter. Returns `false`
    /// when the counter already reached `limit` at write time.
    pub async fn increment_regen_if_below(
        &self,
        account_id: &str,
        resource_id: &str,
        kind: RegenKind,
        limit: u32,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let resource_id = resource_id.to_string();
        let kind = kind.as_str();

        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO regen_counters (account_id, resource_id, regen_kind, used)
                 VALUES (?1, ?2, ?3, 0)",
                rusqlite::params![account_id, resource_id, kind],
            )?;
            let updated = tx.execute(
                "UPDATE regen_counters
                 SET used = used + 1
                 WHERE account_id = ?1 AND resource_id = ?2 AND regen_kind = ?3
                   AND used < ?4",
                rusqlite::params![account_id, resource_id, kind, limit],
            )?;

            tx.commit()?;
            Ok(updated > 0)
        })
        .await?
    }

    /// Additive, idempotent grant. The grant-event insert and the balance
    /// update commit in one transaction, so a crash between them cannot
    /// leave the idempotency record behind the money.
    pub async fn apply_grant(
        &self,
        account_id: &str,
        external_reference: &str,
        amount: u32,
        kind: GrantKind,
        source: GrantSource,
    ) -> Result<GrantApplication, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let external_reference = external_reference.to_string();
        let ts_ms = now_millis();
        let amount_i64 = i64::from(amount);

        tokio::task::spawn_blocking(move || -> Result<GrantApplication, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM balances WHERE account_id=?1",
                    rusqlite::params![account_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(SqliteStoreError::AccountNotFound { account_id });
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO grant_events
                     (account_id, external_reference, amount, kind, source, ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    account_id,
                    external_reference,
                    amount_i64,
                    kind.as_str(),
                    source.as_str(),
                    ts_ms
                ],
            )?;

            let applied = inserted > 0;
            if applied {
                let column = match kind {
                    GrantKind::Free => "free_remaining",
                    GrantKind::Paid => "paid_remaining",
                };
                tx.execute(
                    &format!(
                        "UPDATE balances
                         SET {column} = {column} + ?2, updated_at_ms = ?3
                         WHERE account_id = ?1"
                    ),
                    rusqlite::params![account_id, amount_i64, ts_ms],
                )?;
            }

            let (free, paid): (i64, i64) = tx.query_row(
                "SELECT free_remaining, paid_remaining FROM balances WHERE account_id=?1",
                rusqlite::params![account_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            tx.commit()?;
            Ok(GrantApplication {
                applied,
                balance: Balance { free, paid },
            })
        })
        .await?
    }

    pub async fn count_grants_for_reference(
        &self,
        external_reference: &str,
    ) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let external_reference = external_reference.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM grant_events WHERE external_reference=?1",
                rusqlite::params![external_reference],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(count))
        })
        .await?
    }

    pub async fn count_grants_for_account_reference(
        &self,
        account_id: &str,
        external_reference: &str,
    ) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let external_reference = external_reference.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM grant_events
                 WHERE account_id=?1 AND external_reference=?2",
                rusqlite::params![account_id, external_reference],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(count))
        })
        .await?
    }

    pub async fn list_grants(
        &self,
        account_id: &str,
    ) -> Result<Vec<GrantRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<GrantRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT account_id, external_reference, amount, kind, source, ts_ms
                 FROM grant_events WHERE account_id=?1
                 ORDER BY ts_ms, external_reference",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (account_id, external_reference, amount, raw_kind, raw_source, ts_ms) = row?;
                let kind = GrantKind::parse(&raw_kind).ok_or_else(|| {
                    SqliteStoreError::CorruptRow(format!("unknown grant kind: {raw_kind}"))
                })?;
                let source = GrantSource::parse(&raw_source).ok_or_else(|| {
                    SqliteStoreError::CorruptRow(format!("unknown grant source: {raw_source}"))
                })?;
                out.push(GrantRecord {
                    account_id,
                    external_reference,
                    amount: i64_to_u32(amount),
                    kind,
                    source,
                    ts_ms: i64_to_u64(ts_ms),
                });
            }
            Ok(out)
        })
        .await?
    }

    /// Append-only audit insert. A duplicate `request_id` is ignored rather
    /// than rejected: the replay path has already answered the caller.
    pub async fn append_consumption(
        &self,
        record: NewConsumption,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let ts_ms = now_millis();
        let detail_json = serde_json::to_string(&record.detail)?;

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO consumption_log
                     (ts_ms, account_id, action, resource_id, requested_cost, actual_cost,
                      was_free_regeneration, outcome, request_id, detail_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    ts_ms,
                    record.account_id,
                    record.action.as_str(),
                    record.resource_id,
                    i64::from(record.requested_cost),
                    i64::from(record.actual_cost),
                    record.was_free_regeneration,
                    record.outcome.as_str(),
                    record.request_id,
                    detail_json
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_consumptions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<ConsumptionRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<ConsumptionRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, ts_ms, account_id, action, resource_id, requested_cost,
                        actual_cost, was_free_regeneration, outcome, request_id, detail_json
                 FROM consumption_log
                 WHERE account_id=?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], read_consumption_row)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(parse_consumption_row(row?)?);
            }
            Ok(out)
        })
        .await?
    }

    /// Replay lookup: the committed consumption previously recorded under
    /// a caller-supplied idempotency token, if any.
    pub async fn find_successful_consumption(
        &self,
        request_id: &str,
    ) -> Result<Option<ConsumptionRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let request_id = request_id.to_string();

        tokio::task::spawn_blocking(
            move || -> Result<Option<ConsumptionRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;

                let row = conn
                    .query_row(
                        "SELECT id, ts_ms, account_id, action, resource_id, requested_cost,
                                actual_cost, was_free_regeneration, outcome, request_id, detail_json
                         FROM consumption_log
                         WHERE request_id=?1 AND outcome='success'",
                        rusqlite::params![request_id],
                        read_consumption_row,
                    )
                    .optional()?;

                match row {
                    Some(raw) => Ok(Some(parse_consumption_row(raw)?)),
                    None => Ok(None),
                }
            },
        )
        .await?
    }
}

type RawConsumptionRow = (
    i64,
    i64,
    String,
    String,
    Option<String>,
    i64,
    i64,
    bool,
    String,
    Option<String>,
    String,
);

fn read_consumption_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConsumptionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn parse_consumption_row(raw: RawConsumptionRow) -> Result<ConsumptionRecord, SqliteStoreError> {
    let (
        id,
        ts_ms,
        account_id,
        raw_action,
        resource_id,
        requested_cost,
        actual_cost,
        was_free_regeneration,
        raw_outcome,
        request_id,
        detail_json,
    ) = raw;

    let action = ActionKind::parse(&raw_action)
        .ok_or_else(|| SqliteStoreError::CorruptRow(format!("unknown action: {raw_action}")))?;
    let outcome = AttemptOutcome::parse(&raw_outcome)
        .ok_or_else(|| SqliteStoreError::CorruptRow(format!("unknown outcome: {raw_outcome}")))?;
    let detail = serde_json::from_str(&detail_json)?;

    Ok(ConsumptionRecord {
        id,
        ts_ms: i64_to_u64(ts_ms),
        account_id,
        action,
        resource_id,
        requested_cost: i64_to_u32(requested_cost),
        actual_cost: i64_to_u32(actual_cost),
        was_free_regeneration,
        outcome,
        request_id,
        detail,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS balances (
            account_id TEXT PRIMARY KEY NOT NULL,
            free_remaining INTEGER NOT NULL DEFAULT 0,
            paid_remaining INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS regen_counters (
            account_id TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            regen_kind TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, resource_id, regen_kind)
        );

        CREATE TABLE IF NOT EXISTS grant_events (
            account_id TEXT NOT NULL,
            external_reference TEXT NOT NULL,
            amount INTEGER NOT NULL,
            kind TEXT NOT NULL,
            source TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            PRIMARY KEY (account_id, external_reference)
        );
        CREATE INDEX IF NOT EXISTS idx_grant_events_reference
            ON grant_events(external_reference);

        CREATE TABLE IF NOT EXISTS consumption_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            account_id TEXT NOT NULL,
            action TEXT NOT NULL,
            resource_id TEXT,
            requested_cost INTEGER NOT NULL,
            actual_cost INTEGER NOT NULL,
            was_free_regeneration INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            request_id TEXT UNIQUE,
            detail_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_consumption_log_account_ts
            ON consumption_log(account_id, ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn i64_to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests;
