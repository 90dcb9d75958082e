//! Task Handler (C6): the nine-phase idempotent background-execution
//! protocol for ACTION nodes marked `run_async` and all WEBHOOK nodes.
//! Wraps C3 (Node Processor Core) with the idempotency/revision guards so a
//! task delivered more than once (retry, redelivery, duplicate enqueue)
//! executes its side effect at most once.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::AppResult;
use crate::idempotency::IdempotencyLedger;
use crate::model::WebhookContent;
use crate::processors::{self, ActionOp};
use crate::repository::{SessionRepository, StateUpdate};
use crate::resolver::{SecretResolver, VariableResolver, split_variable_scope};

/// One unit of background work, matching the wire shape in the external
/// task-processing protocol: `task_type, session_id, node_id,
/// session_revision, idempotency_key, action_type | webhook_config, params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub session_id: String,
    pub node_id: String,
    pub session_revision: i64,
    pub idempotency_key: String,
    pub kind: TaskKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskKind {
    Action { actions: Vec<ActionOp> },
    Webhook { webhook: WebhookContent },
}

/// Outcome of running one task through the nine-phase protocol. Distinct
/// from `AppError`: every branch here is a *handled* result that the ledger
/// already has a terminal (or deliberately absent) record for.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Value),
    /// Another in-flight attempt owns this key; caller does nothing.
    InProgress,
    DiscardedSessionNotFound,
    DiscardedStale,
}

pub struct TaskHandler {
    sessions: Arc<dyn SessionRepository>,
    idempotency: Arc<dyn IdempotencyLedger>,
    secrets: Arc<dyn SecretResolver>,
    http: reqwest::Client,
}

impl TaskHandler {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        idempotency: Arc<dyn IdempotencyLedger>,
        secrets: Arc<dyn SecretResolver>,
        http: reqwest::Client,
    ) -> Self {
        Self { sessions, idempotency, secrets, http }
    }

    /// Run the nine-phase protocol for one payload. On any failure in
    /// phases 1-6 the ledger is completed as FAILED and the error is
    /// re-raised so the caller (HTTP handler or worker loop) surfaces a
    /// retriable transport error; every other outcome is a handled `Ok`.
    #[tracing::instrument(skip(self, payload), fields(session_id = %payload.session_id, node_id = %payload.node_id))]
    pub async fn handle(&self, payload: TaskPayload) -> AppResult<TaskOutcome> {
        let existing = self
            .idempotency
            .acquire(&payload.idempotency_key, &payload.session_id, &payload.node_id, payload.session_revision)
            .await?;
        if let Some(record) = existing {
            use crate::model::IdempotencyStatus::*;
            return Ok(match record.status {
                Succeeded => TaskOutcome::Completed(record.result_data.unwrap_or(Value::Null)),
                Failed => TaskOutcome::Completed(json!({ "error": record.error_message })),
                InProgress => TaskOutcome::InProgress,
            });
        }

        match self.run(&payload).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.idempotency
                    .complete(&payload.idempotency_key, crate::model::IdempotencyStatus::Failed, None, Some(e.to_string()))
                    .await?;
                tracing::warn!(error = %e, "task failed");
                Err(e)
            }
        }
    }

    async fn run(&self, payload: &TaskPayload) -> AppResult<TaskOutcome> {
        let session = match self.sessions.get(&payload.session_id).await {
            Ok(s) => s,
            Err(_) => {
                self.idempotency
                    .complete(
                        &payload.idempotency_key,
                        crate::model::IdempotencyStatus::Succeeded,
                        Some(json!({ "status": "discarded_session_not_found" })),
                        None,
                    )
                    .await?;
                return Ok(TaskOutcome::DiscardedSessionNotFound);
            }
        };

        if session.revision != payload.session_revision {
            self.idempotency
                .complete(
                    &payload.idempotency_key,
                    crate::model::IdempotencyStatus::Succeeded,
                    Some(json!({ "status": "discarded_stale" })),
                    None,
                )
                .await?;
            return Ok(TaskOutcome::DiscardedStale);
        }

        let result = match &payload.kind {
            TaskKind::Action { actions } => self.run_actions(&payload.session_id, actions).await?,
            TaskKind::Webhook { webhook } => self.run_webhook(&payload.session_id, webhook).await?,
        };

        self.idempotency
            .complete(&payload.idempotency_key, crate::model::IdempotencyStatus::Succeeded, Some(result.clone()), None)
            .await?;
        tracing::info!("task completed");
        Ok(TaskOutcome::Completed(result))
    }

    /// Each op is interpolated and applied against the latest state with
    /// its own CAS write — ops within one task never run concurrently, so
    /// serial reload-apply-write is safe (spec §4.7). The whole resulting
    /// state is sent as the patch; deep-merge makes re-sending untouched
    /// scopes a no-op.
    async fn run_actions(&self, session_id: &str, actions: &[ActionOp]) -> AppResult<Value> {
        for op in actions {
            let session = self.sessions.get(session_id).await?;
            let resolver = VariableResolver::new(&session.state, self.secrets.as_ref());
            let resolved = resolve_templated(op, &resolver);

            if let ActionOp::ApiCall { response_key, store_response, .. } = &resolved {
                let response = processors::call_api(&self.http, &resolved).await?;
                if *store_response {
                    self.write_variable(session_id, response_key, response).await?;
                }
                continue;
            }

            let mut state = session.state.clone();
            processors::apply(&resolved, &mut state)?;
            self.sessions
                .update_state(
                    session_id,
                    session.revision,
                    StateUpdate { patch: Value::Object(state), new_node_id: None, new_status: None },
                )
                .await?;
        }
        Ok(json!({ "actions_applied": actions.len() }))
    }

    async fn run_webhook(&self, session_id: &str, webhook: &WebhookContent) -> AppResult<Value> {
        let session = self.sessions.get(session_id).await?;
        let resolver = VariableResolver::new(&session.state, self.secrets.as_ref());
        let op = ActionOp::ApiCall {
            url: resolver.substitute_variables(&webhook.url, false),
            method: webhook.method.clone(),
            headers: webhook.headers.clone(),
            payload: resolver.substitute_object(&webhook.payload, false),
            timeout_secs: webhook.timeout_secs,
            store_response: webhook.store_response,
            response_key: webhook.response_key.clone(),
        };
        let response = processors::call_api(&self.http, &op).await?;
        if webhook.store_response {
            self.write_variable(session_id, &webhook.response_key, response.clone()).await?;
        }
        Ok(response)
    }

    /// Write a result value under a (possibly scope-prefixed) variable path
    /// — the same convention the turn loop uses for WEBHOOK response
    /// storage (see `flows::engine`'s `split_variable_scope` + `write_into`).
    async fn write_variable(&self, session_id: &str, variable: &str, value: Value) -> AppResult<()> {
        let session = self.sessions.get(session_id).await?;
        let (scope, path) = split_variable_scope(variable);
        let mut state = session.state.clone();
        let entry = state.entry(scope.clone()).or_insert_with(|| json!({}));
        if !entry.is_object() {
            *entry = json!({});
        }
        if let Value::Object(scope_map) = entry {
            crate::resolver::set_path(scope_map, &path, value);
        }
        self.sessions
            .update_state(
                session_id,
                session.revision,
                StateUpdate { patch: Value::Object(state), new_node_id: None, new_status: None },
            )
            .await?;
        Ok(())
    }
}

/// Substitute templated fields before an op runs — the same set of
/// variable-carrying fields the turn loop resolves inline.
fn resolve_templated(op: &ActionOp, resolver: &VariableResolver) -> ActionOp {
    match op {
        ActionOp::SetVariable { variable, value } => {
            ActionOp::SetVariable { variable: variable.clone(), value: resolver.substitute_object(value, false) }
        }
        ActionOp::Append { variable, value } => {
            ActionOp::Append { variable: variable.clone(), value: resolver.substitute_object(value, false) }
        }
        ActionOp::Calculate { variable, expression } => {
            ActionOp::Calculate { variable: variable.clone(), expression: resolver.substitute_variables(expression, false) }
        }
        ActionOp::ApiCall { url, method, headers, payload, timeout_secs, store_response, response_key } => {
            ActionOp::ApiCall {
                url: resolver.substitute_variables(url, false),
                method: method.clone(),
                headers: headers.clone(),
                payload: resolver.substitute_object(payload, false),
                timeout_secs: *timeout_secs,
                store_response: *store_response,
                response_key: response_key.clone(),
            }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::SqliteIdempotencyLedger;
    use crate::repository::SqliteSessionRepository;
    use crate::secrets::EnvSecretResolver;
    use rusqlite::Connection;

    fn handler() -> (TaskHandler, Arc<dyn SessionRepository>) {
        let sessions: Arc<dyn SessionRepository> =
            Arc::new(SqliteSessionRepository::new(Connection::open_in_memory().unwrap()).unwrap());
        let idempotency: Arc<dyn IdempotencyLedger> =
            Arc::new(SqliteIdempotencyLedger::new(Connection::open_in_memory().unwrap()).unwrap());
        let secrets: Arc<dyn SecretResolver> = Arc::new(EnvSecretResolver::new("FLOWTIDE_TEST_TASKS"));
        (TaskHandler::new(sessions.clone(), idempotency, secrets, reqwest::Client::new()), sessions)
    }

    #[tokio::test]
    async fn discards_task_for_missing_session() {
        let (handler, _sessions) = handler();
        let payload = TaskPayload {
            session_id: "ghost".into(),
            node_id: "n1".into(),
            session_revision: 0,
            idempotency_key: "k1".into(),
            kind: TaskKind::Action { actions: vec![] },
        };
        let outcome = handler.handle(payload).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::DiscardedSessionNotFound));
    }

    #[tokio::test]
    async fn discards_stale_task_without_mutating_state() {
        let (handler, sessions) = handler();
        let session = sessions.create("f1", None, Default::default(), "n1").await.unwrap();
        sessions
            .update_state(&session.id, session.revision, StateUpdate { patch: json!({}), new_node_id: None, new_status: None })
            .await
            .unwrap();

        let payload = TaskPayload {
            session_id: session.id.clone(),
            node_id: "n1".into(),
            session_revision: session.revision,
            idempotency_key: "k2".into(),
            kind: TaskKind::Action {
                actions: vec![ActionOp::SetVariable { variable: "temp.x".into(), value: json!(1) }],
            },
        };
        let outcome = handler.handle(payload).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::DiscardedStale));

        let reloaded = sessions.get(&session.id).await.unwrap();
        assert!(reloaded.state.get("temp").is_none());
    }

    #[tokio::test]
    async fn replaying_idempotency_key_does_not_rerun_action() {
        let (handler, sessions) = handler();
        let session = sessions.create("f1", None, Default::default(), "n1").await.unwrap();

        let payload = TaskPayload {
            session_id: session.id.clone(),
            node_id: "n1".into(),
            session_revision: session.revision,
            idempotency_key: "k3".into(),
            kind: TaskKind::Action {
                actions: vec![ActionOp::Increment { variable: "temp.counter".into(), by: 1.0 }],
            },
        };
        handler.handle(payload.clone()).await.unwrap();
        let after_first = sessions.get(&session.id).await.unwrap();

        let outcome = handler.handle(payload).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed(_)));

        let after_second = sessions.get(&session.id).await.unwrap();
        assert_eq!(after_first.revision, after_second.revision);
        assert_eq!(after_first.state, after_second.state);
    }
}
