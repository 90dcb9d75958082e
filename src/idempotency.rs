//! Idempotency Ledger (C5): at-most-once guard for background task
//! execution. A task acquires a key before doing side-effecting work,
//! records success/failure once, and any retry that races behind it either
//! observes the in-flight attempt or replays the recorded result — it never
//! re-runs the side effect.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::model::{IdempotencyRecord, IdempotencyStatus};

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Claim `idempotency_key` for `session_id`/`node_id` at `session_revision`.
    /// Returns `Ok(None)` when the caller now owns the attempt, or
    /// `Ok(Some(record))` with the existing record when one already exists
    /// (in progress, succeeded, or failed) — the caller must not re-run the
    /// side effect in that case.
    async fn acquire(
        &self,
        idempotency_key: &str,
        session_id: &str,
        node_id: &str,
        session_revision: i64,
    ) -> AppResult<Option<IdempotencyRecord>>;

    async fn complete(
        &self,
        idempotency_key: &str,
        status: IdempotencyStatus,
        result_data: Option<Value>,
        error_message: Option<String>,
    ) -> AppResult<IdempotencyRecord>;

    /// A task resumed after a crash must recheck that the session hasn't
    /// moved on (e.g. the user abandoned or a competing update already
    /// landed) before applying its result.
    async fn validate_revision(&self, idempotency_key: &str, current_session_revision: i64) -> AppResult<bool>;

    async fn get(&self, idempotency_key: &str) -> AppResult<Option<IdempotencyRecord>>;
}

pub struct SqliteIdempotencyLedger {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_ledger (
    idempotency_key TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    session_revision INTEGER NOT NULL,
    status TEXT NOT NULL,
    result_data TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

impl SqliteIdempotencyLedger {
    pub fn new(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA).map_err(|e| AppError::Fatal(e.into()))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open(path: &std::path::Path) -> AppResult<Self> {
        Self::new(Connection::open(path).map_err(|e| AppError::Fatal(e.into()))?)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<IdempotencyRecord> {
    let status_text: String = row.get("status")?;
    let result_text: Option<String> = row.get("result_data")?;
    Ok(IdempotencyRecord {
        idempotency_key: row.get("idempotency_key")?,
        session_id: row.get("session_id")?,
        node_id: row.get("node_id")?,
        session_revision: row.get("session_revision")?,
        status: match status_text.as_str() {
            "succeeded" => IdempotencyStatus::Succeeded,
            "failed" => IdempotencyStatus::Failed,
            _ => IdempotencyStatus::InProgress,
        },
        result_data: result_text.and_then(|t| serde_json::from_str(&t).ok()),
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn status_str(status: IdempotencyStatus) -> &'static str {
    match status {
        IdempotencyStatus::InProgress => "in_progress",
        IdempotencyStatus::Succeeded => "succeeded",
        IdempotencyStatus::Failed => "failed",
    }
}

#[async_trait]
impl IdempotencyLedger for SqliteIdempotencyLedger {
    async fn acquire(
        &self,
        idempotency_key: &str,
        session_id: &str,
        node_id: &str,
        session_revision: i64,
    ) -> AppResult<Option<IdempotencyRecord>> {
        let conn = self.conn.clone();
        let key = idempotency_key.to_string();
        let session_id = session_id.to_string();
        let node_id = node_id.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<Option<IdempotencyRecord>> {
            let guard = conn.lock().expect("idempotency db mutex poisoned");
            let now = Utc::now();
            let inserted = guard
                .execute(
                    "INSERT OR IGNORE INTO idempotency_ledger
                        (idempotency_key, session_id, node_id, session_revision, status, result_data, error_message, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'in_progress', NULL, NULL, ?5, ?5)",
                    params![key, session_id, node_id, session_revision, now],
                )
                .map_err(|e| AppError::Fatal(e.into()))?;

            if inserted == 1 {
                return Ok(None);
            }

            let existing = guard
                .query_row(
                    "SELECT * FROM idempotency_ledger WHERE idempotency_key = ?1",
                    params![key],
                    row_to_record,
                )
                .optional()
                .map_err(|e| AppError::Fatal(e.into()))?;
            Ok(existing)
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))?
    }

    async fn complete(
        &self,
        idempotency_key: &str,
        status: IdempotencyStatus,
        result_data: Option<Value>,
        error_message: Option<String>,
    ) -> AppResult<IdempotencyRecord> {
        let conn = self.conn.clone();
        let key = idempotency_key.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<IdempotencyRecord> {
            let guard = conn.lock().expect("idempotency db mutex poisoned");
            let now = Utc::now();
            let result_text = result_data.as_ref().map(|v| serde_json::to_string(v)).transpose().map_err(|e| AppError::Fatal(e.into()))?;
            let rows = guard
                .execute(
                    "UPDATE idempotency_ledger SET status = ?1, result_data = ?2, error_message = ?3, updated_at = ?4 WHERE idempotency_key = ?5",
                    params![status_str(status), result_text, error_message, now, key],
                )
                .map_err(|e| AppError::Fatal(e.into()))?;
            if rows == 0 {
                return Err(AppError::InvalidInput(format!("no idempotency record for key {key}")));
            }
            guard
                .query_row("SELECT * FROM idempotency_ledger WHERE idempotency_key = ?1", params![key], row_to_record)
                .map_err(|e| AppError::Fatal(e.into()))
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))?
    }

    async fn validate_revision(&self, idempotency_key: &str, current_session_revision: i64) -> AppResult<bool> {
        let record = self.get(idempotency_key).await?;
        Ok(record.is_some_and(|r| r.session_revision == current_session_revision))
    }

    async fn get(&self, idempotency_key: &str) -> AppResult<Option<IdempotencyRecord>> {
        let conn = self.conn.clone();
        let key = idempotency_key.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<Option<IdempotencyRecord>> {
            let guard = conn.lock().expect("idempotency db mutex poisoned");
            guard
                .query_row("SELECT * FROM idempotency_ledger WHERE idempotency_key = ?1", params![key], row_to_record)
                .optional()
                .map_err(|e| AppError::Fatal(e.into()))
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger() -> SqliteIdempotencyLedger {
        SqliteIdempotencyLedger::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn first_acquire_wins_second_observes_in_progress() {
        let ledger = ledger();
        let first = ledger.acquire("key1", "s1", "n1", 0).await.unwrap();
        assert!(first.is_none());

        let second = ledger.acquire("key1", "s1", "n1", 0).await.unwrap();
        let record = second.expect("second attempt must see the existing record");
        assert_eq!(record.status, IdempotencyStatus::InProgress);
    }

    #[tokio::test]
    async fn complete_then_acquire_replays_recorded_result() {
        let ledger = ledger();
        ledger.acquire("key1", "s1", "n1", 0).await.unwrap();
        ledger
            .complete("key1", IdempotencyStatus::Succeeded, Some(json!({ "ok": true })), None)
            .await
            .unwrap();

        let replay = ledger.acquire("key1", "s1", "n1", 0).await.unwrap().unwrap();
        assert_eq!(replay.status, IdempotencyStatus::Succeeded);
        assert_eq!(replay.result_data, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn validate_revision_rejects_stale_session() {
        let ledger = ledger();
        ledger.acquire("key1", "s1", "n1", 3).await.unwrap();
        assert!(ledger.validate_revision("key1", 3).await.unwrap());
        assert!(!ledger.validate_revision("key1", 4).await.unwrap());
    }
}
