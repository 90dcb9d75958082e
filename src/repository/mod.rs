//! Session Repository (C4): optimistic-concurrency state updates, history
//! append, and `flow_events` change notification. The sqlite implementation
//! serializes all access behind a single connection mutex and hands blocking
//! calls to `spawn_blocking`, the same split the teacher uses for its own
//! synchronous I/O paths wrapped by an async surface.

pub mod merge;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{
    ConversationSession, FlowEvent, FlowEventType, HistoryEntry, InteractionType, SessionState,
    SessionStatus,
};

pub struct NewHistoryEntry {
    pub session_id: String,
    pub node_id: String,
    pub interaction_type: InteractionType,
    pub content: Value,
}

/// A state patch applied as part of a single CAS-guarded update: the scope
/// tree is deep-merged, and the current node / status move atomically with
/// it so a reader never observes a state write without its node transition.
pub struct StateUpdate {
    pub patch: Value,
    pub new_node_id: Option<String>,
    pub new_status: Option<SessionStatus>,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(
        &self,
        flow_id: &str,
        user_id: Option<String>,
        initial_state: SessionState,
        entry_node_id: &str,
    ) -> AppResult<ConversationSession>;

    async fn get(&self, session_id: &str) -> AppResult<ConversationSession>;

    async fn get_by_token(&self, session_token: &str) -> AppResult<ConversationSession>;

    /// Apply `update` iff the session's current revision equals
    /// `expected_revision`; otherwise returns `RevisionConflict`.
    async fn update_state(
        &self,
        session_id: &str,
        expected_revision: i64,
        update: StateUpdate,
    ) -> AppResult<ConversationSession>;

    async fn append_history(&self, entry: NewHistoryEntry) -> AppResult<HistoryEntry>;

    async fn history(&self, session_id: &str) -> AppResult<Vec<HistoryEntry>>;

    async fn end(&self, session_id: &str, expected_revision: i64) -> AppResult<ConversationSession>;

    fn subscribe(&self) -> broadcast::Receiver<FlowEvent>;
}

pub struct SqliteSessionRepository {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<FlowEvent>,
}

impl SqliteSessionRepository {
    pub fn new(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA).map_err(|e| AppError::Fatal(e.into()))?;
        let (tx, _rx) = broadcast::channel(1024);
        Ok(Self { conn: Arc::new(Mutex::new(conn)), events: tx })
    }

    pub fn open(path: &std::path::Path) -> AppResult<Self> {
        let conn = Connection::open(path).map_err(|e| AppError::Fatal(e.into()))?;
        Self::new(conn)
    }

    fn publish(&self, event: FlowEvent) {
        // No active subscribers is a normal condition (e.g. between SSE
        // clients); the send only fails in that case.
        let _ = self.events.send(event);
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    session_token TEXT NOT NULL UNIQUE,
    flow_id TEXT NOT NULL,
    user_id TEXT,
    state TEXT NOT NULL,
    current_node_id TEXT,
    revision INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    interaction_type TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_session ON history(session_id);
"#;

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<ConversationSession> {
    let state_text: String = row.get("state")?;
    let status_text: String = row.get("status")?;
    Ok(ConversationSession {
        id: row.get("id")?,
        session_token: row.get("session_token")?,
        flow_id: row.get("flow_id")?,
        user_id: row.get("user_id")?,
        state: serde_json::from_str(&state_text).unwrap_or_default(),
        current_node_id: row.get("current_node_id")?,
        revision: row.get("revision")?,
        status: match status_text.as_str() {
            "active" => SessionStatus::Active,
            "completed" => SessionStatus::Completed,
            _ => SessionStatus::Abandoned,
        },
        started_at: row.get("started_at")?,
        last_activity_at: row.get("last_activity_at")?,
        ended_at: row.get("ended_at")?,
    })
}

fn status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Active => "active",
        SessionStatus::Completed => "completed",
        SessionStatus::Abandoned => "abandoned",
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create(
        &self,
        flow_id: &str,
        user_id: Option<String>,
        initial_state: SessionState,
        entry_node_id: &str,
    ) -> AppResult<ConversationSession> {
        let conn = self.conn.clone();
        let flow_id = flow_id.to_string();
        let entry_node_id = entry_node_id.to_string();
        let session = tokio::task::spawn_blocking(move || -> AppResult<ConversationSession> {
            let id = Uuid::new_v4().to_string();
            let session_token = Uuid::new_v4().to_string();
            let now = Utc::now();
            let state_text = serde_json::to_string(&Value::Object(initial_state))
                .map_err(|e| AppError::Fatal(e.into()))?;
            let guard = conn.lock().expect("session db mutex poisoned");
            guard
                .execute(
                    "INSERT INTO sessions (id, session_token, flow_id, user_id, state, current_node_id, revision, status, started_at, last_activity_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'active', ?7, ?7, NULL)",
                    params![id, session_token, flow_id, user_id, state_text, entry_node_id, now],
                )
                .map_err(|e| AppError::Fatal(e.into()))?;
            Ok(ConversationSession {
                id,
                session_token,
                flow_id,
                user_id,
                state: match serde_json::from_str(&state_text).unwrap_or(Value::Null) {
                    Value::Object(m) => m,
                    _ => Default::default(),
                },
                current_node_id: Some(entry_node_id),
                revision: 0,
                status: SessionStatus::Active,
                started_at: now,
                last_activity_at: now,
                ended_at: None,
            })
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))??;

        self.publish(FlowEvent {
            event_type: FlowEventType::SessionStarted,
            session_id: session.id.clone(),
            flow_id: session.flow_id.clone(),
            user_id: session.user_id.clone(),
            current_node_id: session.current_node_id.clone(),
            previous_node_id: None,
            current_status: session.status,
            previous_status: None,
            revision: session.revision,
            previous_revision: None,
            timestamp: session.started_at,
        });

        Ok(session)
    }

    async fn get(&self, session_id: &str) -> AppResult<ConversationSession> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<ConversationSession> {
            let guard = conn.lock().expect("session db mutex poisoned");
            guard
                .query_row("SELECT * FROM sessions WHERE id = ?1", params![session_id], row_to_session)
                .optional()
                .map_err(|e| AppError::Fatal(e.into()))?
                .ok_or_else(|| AppError::InvalidInput(format!("session not found: {session_id}")))
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))?
    }

    async fn get_by_token(&self, session_token: &str) -> AppResult<ConversationSession> {
        let conn = self.conn.clone();
        let token = session_token.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<ConversationSession> {
            let guard = conn.lock().expect("session db mutex poisoned");
            guard
                .query_row("SELECT * FROM sessions WHERE session_token = ?1", params![token], row_to_session)
                .optional()
                .map_err(|e| AppError::Fatal(e.into()))?
                .ok_or_else(|| AppError::InvalidInput("unknown session token".into()))
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))?
    }

    async fn update_state(
        &self,
        session_id: &str,
        expected_revision: i64,
        update: StateUpdate,
    ) -> AppResult<ConversationSession> {
        let conn = self.conn.clone();
        let session_id_owned = session_id.to_string();
        let result = tokio::task::spawn_blocking(move || -> AppResult<(ConversationSession, ConversationSession)> {
            let mut guard = conn.lock().expect("session db mutex poisoned");
            let tx = guard.transaction().map_err(|e| AppError::Fatal(e.into()))?;

            let before: ConversationSession = tx
                .query_row("SELECT * FROM sessions WHERE id = ?1", params![session_id_owned], row_to_session)
                .optional()
                .map_err(|e| AppError::Fatal(e.into()))?
                .ok_or_else(|| AppError::InvalidInput(format!("session not found: {session_id_owned}")))?;

            if before.revision != expected_revision {
                return Err(AppError::RevisionConflict { expected: expected_revision, actual: before.revision });
            }

            let mut merged_state = Value::Object(before.state.clone());
            merge::deep_merge(&mut merged_state, &update.patch);
            let new_node_id = update.new_node_id.clone().or_else(|| before.current_node_id.clone());
            let new_status = update.new_status.unwrap_or(before.status);
            let new_revision = before.revision + 1;
            let now = Utc::now();
            let state_text = serde_json::to_string(&merged_state).map_err(|e| AppError::Fatal(e.into()))?;

            let ended_at = if matches!(new_status, SessionStatus::Completed | SessionStatus::Abandoned) {
                Some(now)
            } else {
                before.ended_at
            };

            let rows = tx
                .execute(
                    "UPDATE sessions SET state = ?1, current_node_id = ?2, status = ?3, revision = ?4, last_activity_at = ?5, ended_at = ?6
                     WHERE id = ?7 AND revision = ?8",
                    params![state_text, new_node_id, status_str(new_status), new_revision, now, ended_at, session_id_owned, expected_revision],
                )
                .map_err(|e| AppError::Fatal(e.into()))?;

            if rows == 0 {
                return Err(AppError::RevisionConflict { expected: expected_revision, actual: before.revision });
            }

            tx.commit().map_err(|e| AppError::Fatal(e.into()))?;

            let after = ConversationSession {
                id: before.id.clone(),
                session_token: before.session_token.clone(),
                flow_id: before.flow_id.clone(),
                user_id: before.user_id.clone(),
                state: match merged_state {
                    Value::Object(m) => m,
                    _ => Default::default(),
                },
                current_node_id: new_node_id,
                revision: new_revision,
                status: new_status,
                started_at: before.started_at,
                last_activity_at: now,
                ended_at,
            };
            Ok((before, after))
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))??;

        let (before, after) = result;
        self.publish(FlowEvent {
            event_type: if after.current_node_id != before.current_node_id {
                FlowEventType::NodeChanged
            } else if after.status != before.status {
                FlowEventType::SessionStatusChanged
            } else {
                FlowEventType::SessionUpdated
            },
            session_id: after.id.clone(),
            flow_id: after.flow_id.clone(),
            user_id: after.user_id.clone(),
            current_node_id: after.current_node_id.clone(),
            previous_node_id: before.current_node_id.clone(),
            current_status: after.status,
            previous_status: Some(before.status),
            revision: after.revision,
            previous_revision: Some(before.revision),
            timestamp: after.last_activity_at,
        });

        Ok(after)
    }

    async fn append_history(&self, entry: NewHistoryEntry) -> AppResult<HistoryEntry> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> AppResult<HistoryEntry> {
            let now = Utc::now();
            let content_text = serde_json::to_string(&entry.content).map_err(|e| AppError::Fatal(e.into()))?;
            let interaction_str = match entry.interaction_type {
                InteractionType::Message => "message",
                InteractionType::Input => "input",
                InteractionType::Action => "action",
            };
            let guard = conn.lock().expect("session db mutex poisoned");
            guard
                .execute(
                    "INSERT INTO history (session_id, node_id, interaction_type, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![entry.session_id, entry.node_id, interaction_str, content_text, now],
                )
                .map_err(|e| AppError::Fatal(e.into()))?;
            let id = guard.last_insert_rowid();
            Ok(HistoryEntry {
                id,
                session_id: entry.session_id,
                node_id: entry.node_id,
                interaction_type: entry.interaction_type,
                content: entry.content,
                created_at: now,
            })
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))?
    }

    async fn history(&self, session_id: &str) -> AppResult<Vec<HistoryEntry>> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<Vec<HistoryEntry>> {
            let guard = conn.lock().expect("session db mutex poisoned");
            let mut stmt = guard
                .prepare("SELECT * FROM history WHERE session_id = ?1 ORDER BY id ASC")
                .map_err(|e| AppError::Fatal(e.into()))?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    let interaction_str: String = row.get("interaction_type")?;
                    let content_text: String = row.get("content")?;
                    Ok(HistoryEntry {
                        id: row.get("id")?,
                        session_id: row.get("session_id")?,
                        node_id: row.get("node_id")?,
                        interaction_type: match interaction_str.as_str() {
                            "input" => InteractionType::Input,
                            "action" => InteractionType::Action,
                            _ => InteractionType::Message,
                        },
                        content: serde_json::from_str(&content_text).unwrap_or(Value::Null),
                        created_at: row.get("created_at")?,
                    })
                })
                .map_err(|e| AppError::Fatal(e.into()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| AppError::Fatal(e.into()))
        })
        .await
        .map_err(|e| AppError::Fatal(e.into()))?
    }

    async fn end(&self, session_id: &str, expected_revision: i64) -> AppResult<ConversationSession> {
        self.update_state(
            session_id,
            expected_revision,
            StateUpdate { patch: Value::Object(Default::default()), new_node_id: None, new_status: Some(SessionStatus::Completed) },
        )
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo() -> SqliteSessionRepository {
        SqliteSessionRepository::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let repo = repo();
        let created = repo.create("flow1", None, Default::default(), "start").await.unwrap();
        let fetched = repo.get(&created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.revision, 0);
        assert_eq!(fetched.current_node_id.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn update_state_rejects_stale_revision() {
        let repo = repo();
        let session = repo.create("flow1", None, Default::default(), "start").await.unwrap();

        let update = StateUpdate { patch: json!({ "temp": { "a": 1 } }), new_node_id: None, new_status: None };
        repo.update_state(&session.id, 0, update).await.unwrap();

        let stale_update = StateUpdate { patch: json!({ "temp": { "b": 2 } }), new_node_id: None, new_status: None };
        let err = repo.update_state(&session.id, 0, stale_update).await.unwrap_err();
        assert!(matches!(err, AppError::RevisionConflict { expected: 0, actual: 1 }));
    }

    #[tokio::test]
    async fn update_state_deep_merges_and_advances_revision() {
        let repo = repo();
        let session = repo.create("flow1", None, Default::default(), "start").await.unwrap();
        let update = StateUpdate {
            patch: json!({ "temp": { "name": "Ada" } }),
            new_node_id: Some("next".into()),
            new_status: None,
        };
        let updated = repo.update_state(&session.id, 0, update).await.unwrap();
        assert_eq!(updated.revision, 1);
        assert_eq!(updated.current_node_id.as_deref(), Some("next"));
        assert_eq!(updated.state["temp"]["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn history_append_and_list_in_order() {
        let repo = repo();
        let session = repo.create("flow1", None, Default::default(), "start").await.unwrap();
        repo.append_history(NewHistoryEntry {
            session_id: session.id.clone(),
            node_id: "start".into(),
            interaction_type: InteractionType::Message,
            content: json!({ "text": "hi" }),
        })
        .await
        .unwrap();
        let history = repo.history(&session.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content["text"], json!("hi"));
    }

    #[tokio::test]
    async fn subscribers_receive_events_on_update() {
        let repo = repo();
        let mut rx = repo.subscribe();
        let session = repo.create("flow1", None, Default::default(), "start").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, session.id);
        assert_eq!(event.event_type, FlowEventType::SessionStarted);
    }
}
