//! The per-turn node dispatch loop (§4.3 of the runtime's node processing
//! model): given a session sitting at some node, run nodes forward until
//! either a QUESTION pauses for user input or the flow (or a composite
//! sub-flow) dead-ends. All state mutation during a turn happens on a local
//! working copy; it's persisted exactly once via a single CAS-guarded
//! repository write so a conflicting concurrent turn is rejected as a whole,
//! never partially applied.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::condition;
use crate::error::{AppError, AppResult};
use crate::idempotency::IdempotencyLedger;
use crate::model::{
    ConversationSession, FlowDefinition, IdempotencyStatus, InteractionType, Node, NodeContent,
    SessionState, SessionStatus, edge_label,
};
use crate::processors::{self, ActionOp};
use crate::repository::{NewHistoryEntry, SessionRepository, StateUpdate};
use crate::resolver::{SecretResolver, VariableResolver, split_variable_scope};
use crate::tasks::{TaskKind, TaskPayload};

use super::store::FlowStore;

const COMPOSITE_STACK_KEY: &str = "__composite_stack";
const ACTIVE_FLOW_KEY: &str = "__active_flow_id";
const MAX_STEPS_PER_TURN: usize = 200;

#[derive(Debug, Clone)]
pub struct QuestionPrompt {
    pub node_id: String,
    pub prompt: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The flow is waiting on a QUESTION node for the next user input.
    AwaitingInput(QuestionPrompt),
    /// A WEBHOOK or `run_async` ACTION node was handed to the background
    /// task handler (C6); the turn stops here and resumes on a later turn
    /// once the task writes its result into the idempotency ledger.
    Pending { node_id: String },
    /// The flow ran off the end of the root flow (no outgoing edge from the
    /// final node) or an ACTION/CONDITION chain bottomed out without a
    /// QUESTION to pause on.
    Completed,
}

#[derive(Debug)]
pub struct TurnResult {
    pub session: ConversationSession,
    pub messages: Vec<String>,
    pub outcome: TurnOutcome,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CompositeFrame {
    return_flow_id: String,
    composite_node_id: String,
}

pub struct FlowEngine {
    flows: Arc<dyn FlowStore>,
    sessions: Arc<dyn SessionRepository>,
    idempotency: Arc<dyn IdempotencyLedger>,
    secrets: Arc<dyn SecretResolver>,
    http: reqwest::Client,
    /// Dispatch surface for yes-pending ACTION/WEBHOOK nodes (§4.3.1); the
    /// same channel `spawn_task_worker` drains on the server side.
    task_tx: mpsc::Sender<TaskPayload>,
}

impl FlowEngine {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        sessions: Arc<dyn SessionRepository>,
        idempotency: Arc<dyn IdempotencyLedger>,
        secrets: Arc<dyn SecretResolver>,
        http: reqwest::Client,
        task_tx: mpsc::Sender<TaskPayload>,
    ) -> Self {
        Self { flows, sessions, idempotency, secrets, http, task_tx }
    }

    pub async fn start_session(&self, flow_id: &str, user_id: Option<String>) -> AppResult<TurnResult> {
        let flow = self.flows.get_published(flow_id).await?;
        let session = self
            .sessions
            .create(flow_id, user_id, Default::default(), &flow.entry_node_id)
            .await?;

        let span = tracing::info_span!("flow_turn", session_id = %session.id, flow_id = %flow_id);
        self.run_turn(session, None, &flow).instrument(span).await
    }

    /// Advance a session with the next user input. `expected_revision` is
    /// the caller's last-known revision, enforced as an optimistic-lock CAS
    /// at the single point this turn persists.
    pub async fn interact(
        &self,
        session_id: &str,
        expected_revision: i64,
        input: Value,
    ) -> AppResult<TurnResult> {
        let session = self.sessions.get(session_id).await?;
        if session.revision != expected_revision {
            return Err(AppError::RevisionConflict { expected: expected_revision, actual: session.revision });
        }
        if session.status != SessionStatus::Active {
            return Err(AppError::InvalidInput(format!("session {session_id} is not active")));
        }

        let flow = self.flows.get_published(&session.flow_id).await?;
        let span = tracing::info_span!("flow_turn", session_id = %session.id, flow_id = %session.flow_id);
        self.run_turn(session, Some(input), &flow).instrument(span).await
    }

    async fn run_turn(
        &self,
        session: ConversationSession,
        input: Option<Value>,
        root_flow: &FlowDefinition,
    ) -> AppResult<TurnResult> {
        let expected_revision = session.revision;
        let mut working_state = Value::Object(session.state.clone());

        if let Some(input_value) = &input {
            merge_scope(&mut working_state, "input", json!({ "value": input_value, "text": stringify_input(input_value) }));
        }

        let mut active_flow_id = read_active_flow(&working_state).unwrap_or_else(|| root_flow.id.clone());
        let mut current_node_id = session
            .current_node_id
            .clone()
            .ok_or_else(|| AppError::InvalidInput("session has no current node".into()))?;

        // If we're resuming at a QUESTION node, the input answers it before
        // the dispatch loop continues past it.
        let flow = self.flows.get_published(&active_flow_id).await?;
        if let Some(node) = flow.node(&current_node_id) {
            if let NodeContent::Question(q) = &node.content {
                let answer = input.clone().ok_or_else(|| {
                    AppError::InvalidInput(format!("node '{current_node_id}' expects user input"))
                })?;
                let (scope, path) = split_variable_scope(&q.variable);
                write_into(&mut working_state, &scope, &path, answer.clone());

                self.sessions
                    .append_history(NewHistoryEntry {
                        session_id: session.id.clone(),
                        node_id: current_node_id.clone(),
                        interaction_type: InteractionType::Input,
                        content: answer.clone(),
                    })
                    .await?;

                let label = question_edge_label(q, &answer);
                current_node_id = next_node(&flow, &current_node_id, &label)?;
            }
        }

        let mut turn_messages = Vec::new();
        let mut steps = 0usize;

        let outcome = loop {
            steps += 1;
            if steps > MAX_STEPS_PER_TURN {
                return Err(AppError::Fatal(anyhow::anyhow!(
                    "flow '{active_flow_id}' exceeded {MAX_STEPS_PER_TURN} node steps in one turn (probable cycle)"
                )));
            }

            let flow = self.flows.get_published(&active_flow_id).await?;
            let Some(node) = flow.node(&current_node_id) else {
                return Err(AppError::NodeNotFound(current_node_id));
            };

            match &node.content {
                NodeContent::Message(m) => {
                    let resolver = VariableResolver::new(as_state(&working_state), self.secrets.as_ref());
                    let node_id = node.node_id.clone();
                    let messages = m.messages.clone();
                    for text in &messages {
                        let rendered = resolver.substitute_variables(text, false);
                        turn_messages.push(rendered.clone());
                        self.sessions
                            .append_history(NewHistoryEntry {
                                session_id: session.id.clone(),
                                node_id: node_id.clone(),
                                interaction_type: InteractionType::Message,
                                content: json!({ "text": rendered }),
                            })
                            .await?;
                    }
                    match next_node(&flow, &node_id, edge_label::DEFAULT) {
                        Ok(next) => current_node_id = next,
                        Err(_) => match self.dead_end(&mut working_state).await? {
                            DeadEnd::Resumed { next_node_id, flow_id } => {
                                active_flow_id = flow_id;
                                current_node_id = next_node_id;
                            }
                            DeadEnd::Completed => break TurnOutcome::Completed,
                        },
                    }
                }

                NodeContent::Question(q) => {
                    let resolver = VariableResolver::new(as_state(&working_state), self.secrets.as_ref());
                    let prompt = resolver.substitute_variables(&q.prompt, false);
                    turn_messages.push(prompt.clone());
                    break TurnOutcome::AwaitingInput(QuestionPrompt {
                        node_id: node.node_id.clone(),
                        prompt,
                        options: q.options.clone(),
                    });
                }

                NodeContent::Condition(c) => {
                    let node_id = node.node_id.clone();
                    let state_map = as_state(&working_state);
                    let label = condition::evaluate(&c.clauses, &c.default_path, state_map, self.secrets.as_ref());
                    match next_node(&flow, &node_id, &label) {
                        Ok(next) => current_node_id = next,
                        Err(_) => match self.dead_end(&mut working_state).await? {
                            DeadEnd::Resumed { next_node_id, flow_id } => {
                                active_flow_id = flow_id;
                                current_node_id = next_node_id;
                            }
                            DeadEnd::Completed => break TurnOutcome::Completed,
                        },
                    }
                }

                NodeContent::Action(a) if !a.run_async => {
                    let node_id = node.node_id.clone();
                    let mut label = edge_label::SUCCESS;
                    for op in &a.actions {
                        let resolved_op = resolve_op(op, as_state(&working_state), self.secrets.as_ref());
                        let result = match &resolved_op {
                            ActionOp::ApiCall { .. } => {
                                match processors::call_api(&self.http, &resolved_op).await {
                                    Ok(body) => {
                                        if let ActionOp::ApiCall { store_response, response_key, .. } = &resolved_op {
                                            if *store_response {
                                                let (scope, path) = split_variable_scope(response_key);
                                                write_into(&mut working_state, &scope, &path, body);
                                            }
                                        }
                                        Ok(())
                                    }
                                    Err(e) => Err(e),
                                }
                            }
                            other => {
                                let mut state_map = as_state_owned(&working_state);
                                let r = processors::apply(other, &mut state_map);
                                working_state = Value::Object(state_map);
                                r
                            }
                        };
                        if let Err(e) = result {
                            tracing::warn!(node_id = %node_id, error = %e, "action op failed");
                            label = edge_label::FAILURE;
                            break;
                        }
                    }
                    match next_node(&flow, &node_id, label).or_else(|_| next_node(&flow, &node_id, edge_label::DEFAULT)) {
                        Ok(next) => current_node_id = next,
                        Err(_) => match self.dead_end(&mut working_state).await? {
                            DeadEnd::Resumed { next_node_id, flow_id } => {
                                active_flow_id = flow_id;
                                current_node_id = next_node_id;
                            }
                            DeadEnd::Completed => break TurnOutcome::Completed,
                        },
                    }
                }

                // `run_async` ACTION: yes-pending per §4.3.1, handed to C6
                // exactly like WEBHOOK below.
                NodeContent::Action(a) => {
                    let node_id = node.node_id.clone();
                    let idempotency_key = pending_task_key(&working_state, &session.id, &node_id, expected_revision);
                    let label = match self
                        .idempotency
                        .acquire(&idempotency_key, &session.id, &node_id, expected_revision)
                        .await?
                    {
                        Some(existing) => {
                            tracing::info!(node_id = %node_id, "async action already attempted this revision, replaying result");
                            match existing.status {
                                IdempotencyStatus::Succeeded => Some(edge_label::SUCCESS),
                                IdempotencyStatus::Failed => Some(edge_label::FAILURE),
                                IdempotencyStatus::InProgress => None,
                            }
                        }
                        None => {
                            write_pending_task_key(&mut working_state, &node_id, &idempotency_key);
                            let payload = TaskPayload {
                                session_id: session.id.clone(),
                                node_id: node_id.clone(),
                                session_revision: expected_revision,
                                idempotency_key: idempotency_key.clone(),
                                kind: TaskKind::Action { actions: a.actions.clone() },
                            };
                            if let Err(e) = self.task_tx.send(payload).await {
                                tracing::error!(error = %e, "task queue closed, dropping async action dispatch");
                            }
                            None
                        }
                    };
                    match label {
                        Some(label) => {
                            clear_pending_task_key(&mut working_state, &node_id);
                            match next_node(&flow, &node_id, label).or_else(|_| next_node(&flow, &node_id, edge_label::DEFAULT)) {
                                Ok(next) => current_node_id = next,
                                Err(_) => match self.dead_end(&mut working_state).await? {
                                    DeadEnd::Resumed { next_node_id, flow_id } => {
                                        active_flow_id = flow_id;
                                        current_node_id = next_node_id;
                                    }
                                    DeadEnd::Completed => break TurnOutcome::Completed,
                                },
                            }
                        }
                        None => break TurnOutcome::Pending { node_id },
                    }
                }

                NodeContent::Webhook(w) => {
                    // WEBHOOK is unconditionally yes-pending (§4.3.1): the
                    // call itself, and any `{{...}}` interpolation of its
                    // url/payload, happens in C6 against freshly reloaded
                    // state, not here.
                    let idempotency_key = pending_task_key(&working_state, &session.id, &node.node_id, expected_revision);

                    let label = match self.idempotency.acquire(&idempotency_key, &session.id, &node.node_id, expected_revision).await? {
                        Some(existing) => {
                            tracing::info!(node_id = %node.node_id, "webhook already attempted this revision, replaying result");
                            match existing.status {
                                IdempotencyStatus::Succeeded => {
                                    if w.store_response {
                                        if let Some(body) = existing.result_data {
                                            let (scope, path) = split_variable_scope(&w.response_key);
                                            write_into(&mut working_state, &scope, &path, body);
                                        }
                                    }
                                    Some(edge_label::SUCCESS)
                                }
                                IdempotencyStatus::Failed => Some(edge_label::FAILURE),
                                IdempotencyStatus::InProgress => None,
                            }
                        }
                        None => {
                            write_pending_task_key(&mut working_state, &node.node_id, &idempotency_key);
                            let payload = TaskPayload {
                                session_id: session.id.clone(),
                                node_id: node.node_id.clone(),
                                session_revision: expected_revision,
                                idempotency_key: idempotency_key.clone(),
                                kind: TaskKind::Webhook { webhook: w.clone() },
                            };
                            if let Err(e) = self.task_tx.send(payload).await {
                                tracing::error!(error = %e, "task queue closed, dropping webhook dispatch");
                            }
                            None
                        }
                    };

                    match label {
                        Some(label) => {
                            clear_pending_task_key(&mut working_state, &node.node_id);
                            match next_node(&flow, &node.node_id, label) {
                                Ok(next) => current_node_id = next,
                                Err(_) => match self.dead_end(&mut working_state).await? {
                                    DeadEnd::Resumed { next_node_id, flow_id } => {
                                        active_flow_id = flow_id;
                                        current_node_id = next_node_id;
                                    }
                                    DeadEnd::Completed => break TurnOutcome::Completed,
                                },
                            }
                        }
                        None => break TurnOutcome::Pending { node_id: node.node_id.clone() },
                    }
                }

                NodeContent::Composite(c) => {
                    let mut stack = read_composite_stack(&working_state);
                    stack.push(CompositeFrame { return_flow_id: active_flow_id.clone(), composite_node_id: node.node_id.clone() });
                    write_composite_stack(&mut working_state, &stack);

                    let child_flow = self.flows.get_published(&c.child_flow_id).await?;
                    for (parent_path, child_path) in &c.input_mapping {
                        if let Some(v) = crate::resolver::get_path(&working_state, parent_path).cloned() {
                            let (scope, path) = split_child_scope(child_path);
                            write_into(&mut working_state, &scope, &path, v);
                        }
                    }
                    active_flow_id = child_flow.id.clone();
                    write_active_flow(&mut working_state, &active_flow_id);
                    current_node_id = child_flow.entry_node_id.clone();
                }

                NodeContent::Script(_) => {
                    // Arbitrary script execution is deliberately unimplemented:
                    // no sandboxed interpreter is part of this stack.
                    return Err(AppError::InvalidInput(format!(
                        "node '{}' uses a SCRIPT node, which this runtime does not execute",
                        node.node_id
                    )));
                }
            }
        };

        let new_status = match &outcome {
            TurnOutcome::Completed if read_composite_stack(&working_state).is_empty() => Some(SessionStatus::Completed),
            _ => None,
        };

        let patch = match working_state {
            Value::Object(m) => Value::Object(m),
            other => other,
        };

        let updated = self
            .sessions
            .update_state(
                &session.id,
                expected_revision,
                StateUpdate { patch, new_node_id: Some(current_node_id), new_status },
            )
            .await?;

        Ok(TurnResult { session: updated, messages: turn_messages, outcome })
    }

    /// Handle running off the end of a node with no matching outgoing edge:
    /// pop a composite frame, apply its output mapping, and resume the
    /// parent flow from the edge leaving the composite node — or, if no
    /// composite is active, end the turn.
    async fn dead_end(&self, working_state: &mut Value) -> AppResult<DeadEnd> {
        let mut stack = read_composite_stack(working_state);
        let Some(frame) = stack.pop() else {
            return Ok(DeadEnd::Completed);
        };
        write_composite_stack(working_state, &stack);

        let parent_flow = self.flows.get_published(&frame.return_flow_id).await?;
        let composite_node = parent_flow
            .node(&frame.composite_node_id)
            .ok_or_else(|| AppError::NodeNotFound(frame.composite_node_id.clone()))?;
        if let NodeContent::Composite(c) = &composite_node.content {
            for (child_path, parent_path) in &c.output_mapping {
                let (scope, path) = split_child_scope(child_path);
                let child_scope = working_state.get(&scope).cloned().unwrap_or(json!({}));
                if let Some(v) = crate::resolver::get_path(&child_scope, &path).cloned() {
                    let (target_scope, target_path) = split_variable_scope(parent_path);
                    write_into(working_state, &target_scope, &target_path, v);
                }
            }
        }

        write_active_flow(working_state, &frame.return_flow_id);

        let next = next_node(&parent_flow, &frame.composite_node_id, edge_label::SUCCESS)
            .or_else(|_| next_node(&parent_flow, &frame.composite_node_id, edge_label::DEFAULT));
        match next {
            Ok(next_node_id) => Ok(DeadEnd::Resumed { next_node_id, flow_id: frame.return_flow_id }),
            Err(_) => Ok(DeadEnd::Completed),
        }
    }
}

enum DeadEnd {
    Resumed { next_node_id: String, flow_id: String },
    Completed,
}

fn stringify_input(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_state(value: &Value) -> &SessionState {
    match value {
        Value::Object(m) => m,
        _ => panic!("working state must be a JSON object"),
    }
}

fn as_state_owned(value: &Value) -> SessionState {
    match value {
        Value::Object(m) => m.clone(),
        _ => Default::default(),
    }
}

fn merge_scope(state: &mut Value, scope: &str, value: Value) {
    if let Value::Object(map) = state {
        map.insert(scope.to_string(), value);
    }
}

fn write_into(state: &mut Value, scope: &str, path: &str, value: Value) {
    if let Value::Object(map) = state {
        let entry = map.entry(scope.to_string()).or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        if let Value::Object(scope_map) = entry {
            crate::resolver::set_path(scope_map, path, value);
        }
    }
}

fn read_active_flow(state: &Value) -> Option<String> {
    state.get("local")?.get(ACTIVE_FLOW_KEY)?.as_str().map(str::to_string)
}

fn write_active_flow(state: &mut Value, flow_id: &str) {
    write_into(state, "local", ACTIVE_FLOW_KEY, json!(flow_id));
}

const PENDING_TASK_KEYS: &str = "__pending_task_keys";

/// The idempotency key for a yes-pending node's dispatch. A turn that
/// re-enters the same node after the task has already been handed off
/// reuses the key stored on the first dispatch — `expected_revision` has
/// moved on by then, since the dispatching turn's own state write bumped
/// it, so recomputing from the current revision would mint a fresh key and
/// dispatch the task twice.
fn pending_task_key(state: &Value, session_id: &str, node_id: &str, expected_revision: i64) -> String {
    state
        .get("local")
        .and_then(|v| v.get(PENDING_TASK_KEYS))
        .and_then(|v| v.get(node_id))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{session_id}:{node_id}:{expected_revision}"))
}

fn write_pending_task_key(state: &mut Value, node_id: &str, key: &str) {
    write_into(state, "local", &format!("{PENDING_TASK_KEYS}.{node_id}"), json!(key));
}

fn clear_pending_task_key(state: &mut Value, node_id: &str) {
    if let Some(Value::Object(keys)) = state.get_mut("local").and_then(|v| v.get_mut(PENDING_TASK_KEYS)) {
        keys.remove(node_id);
    }
}

fn read_composite_stack(state: &Value) -> Vec<CompositeFrame> {
    state
        .get("local")
        .and_then(|v| v.get(COMPOSITE_STACK_KEY))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn write_composite_stack(state: &mut Value, stack: &[CompositeFrame]) {
    write_into(state, "local", COMPOSITE_STACK_KEY, serde_json::to_value(stack).unwrap_or(json!([])));
}

/// Composite `output_mapping` keys are child-side dotted paths prefixed
/// with their scope (e.g. `output.result`); split the same way a top-level
/// variable reference would be.
fn split_child_scope(path: &str) -> (String, String) {
    match path.split_once('.') {
        Some((scope, rest)) => (scope.to_string(), rest.to_string()),
        None => ("output".to_string(), path.to_string()),
    }
}

fn next_node(flow: &FlowDefinition, node_id: &str, label: &str) -> AppResult<String> {
    flow.outgoing(node_id)
        .find(|c| c.connection_type == label)
        .map(|c| c.target_node_id.clone())
        .ok_or_else(|| AppError::NodeNotFound(format!("no '{label}' edge from node '{node_id}'")))
}

fn question_edge_label(q: &crate::model::QuestionContent, answer: &Value) -> String {
    if q.options.is_empty() {
        return edge_label::DEFAULT.to_string();
    }
    let answer_text = stringify_input(answer);
    q.options
        .iter()
        .position(|opt| opt == &answer_text)
        .map(edge_label::option)
        .unwrap_or_else(|| edge_label::DEFAULT.to_string())
}

/// Substitute `{{scope.path}}` references inside an action op's templated
/// fields before it runs. Only `SetVariable`/`Append`/`ApiCall` carry
/// user-authored templates; the rest operate purely on already-resolved
/// state.
fn resolve_op(op: &ActionOp, state: &SessionState, secrets: &dyn SecretResolver) -> ActionOp {
    let resolver = VariableResolver::new(state, secrets);
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
    use crate::model::{ActionContent, Connection, MessageContent, Node, NodeContent, QuestionContent};
    use crate::repository::SqliteSessionRepository;
    use crate::resolver::NoSecrets;
    use chrono::Utc;
    use rusqlite::Connection as SqlConnection;

    fn msg_node(id: &str, text: &str) -> Node {
        Node { db_id: 1, node_id: id.into(), label: String::new(), content: NodeContent::Message(MessageContent { messages: vec![text.into()] }) }
    }

    fn question_node(id: &str, prompt: &str, variable: &str) -> Node {
        Node {
            db_id: 2,
            node_id: id.into(),
            label: String::new(),
            content: NodeContent::Question(QuestionContent { prompt: prompt.into(), variable: variable.into(), options: vec![] }),
        }
    }

    fn edge(from: &str, to: &str) -> Connection {
        Connection { id: 1, source_node_id: from.into(), target_node_id: to.into(), connection_type: edge_label::DEFAULT.into(), conditions: None }
    }

    fn make_flow(id: &str, nodes: Vec<Node>, connections: Vec<Connection>, entry: &str) -> FlowDefinition {
        FlowDefinition { id: id.into(), name: "t".into(), version: "1".into(), entry_node_id: entry.into(), published: true, nodes, connections, created_at: Utc::now(), updated_at: Utc::now() }
    }

    /// Returns the receiver alongside the engine so tests that exercise
    /// yes-pending dispatch can observe what was enqueued; tests that don't
    /// care just bind it to `_`.
    async fn engine_with(flow: FlowDefinition) -> (FlowEngine, mpsc::Receiver<TaskPayload>) {
        let flows = std::sync::Arc::new(crate::flows::InMemoryFlowStore::new());
        flows.save(flow).await.unwrap();
        let sessions = std::sync::Arc::new(SqliteSessionRepository::new(SqlConnection::open_in_memory().unwrap()).unwrap());
        let idempotency = std::sync::Arc::new(SqliteIdempotencyLedger::new(SqlConnection::open_in_memory().unwrap()).unwrap());
        let (task_tx, task_rx) = mpsc::channel(16);
        let engine = FlowEngine::new(flows, sessions, idempotency, std::sync::Arc::new(NoSecrets), reqwest::Client::new(), task_tx);
        (engine, task_rx)
    }

    #[tokio::test]
    async fn start_session_runs_messages_until_question() {
        let flow = make_flow(
            "f1",
            vec![msg_node("a", "Hello!"), question_node("b", "What's your name?", "name")],
            vec![edge("a", "b")],
            "a",
        );
        let (engine, _rx) = engine_with(flow).await;
        let result = engine.start_session("f1", None).await.unwrap();
        assert_eq!(result.messages, vec!["Hello!".to_string(), "What's your name?".to_string()]);
        assert!(matches!(result.outcome, TurnOutcome::AwaitingInput(_)));
        assert_eq!(result.session.current_node_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn interact_answers_question_and_completes_flow() {
        let flow = make_flow(
            "f1",
            vec![question_node("a", "Name?", "temp.name"), msg_node("b", "Hi {{temp.name}}!")],
            vec![edge("a", "b")],
            "a",
        );
        let (engine, _rx) = engine_with(flow).await;
        let started = engine.start_session("f1", None).await.unwrap();
        let result = engine.interact(&started.session.id, started.session.revision, json!("Ada")).await.unwrap();
        assert_eq!(result.messages, vec!["Hi Ada!".to_string()]);
        assert!(matches!(result.outcome, TurnOutcome::Completed));
        assert_eq!(result.session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn stale_revision_is_rejected() {
        let flow = make_flow("f1", vec![msg_node("a", "hi")], vec![], "a");
        let (engine, _rx) = engine_with(flow).await;
        let started = engine.start_session("f1", None).await.unwrap();
        let err = engine.interact(&started.session.id, started.session.revision + 1, json!("x")).await.unwrap_err();
        assert!(matches!(err, AppError::RevisionConflict { .. }));
    }

    #[tokio::test]
    async fn action_node_mutates_state_and_completes() {
        let flow = make_flow(
            "f1",
            vec![Node {
                db_id: 1,
                node_id: "a".into(),
                label: String::new(),
                content: NodeContent::Action(ActionContent {
                    actions: vec![ActionOp::SetVariable { variable: "temp.greeted".into(), value: json!(true) }],
                    run_async: false,
                }),
            }],
            vec![],
            "a",
        );
        let (engine, _rx) = engine_with(flow).await;
        let result = engine.start_session("f1", None).await.unwrap();
        assert!(matches!(result.outcome, TurnOutcome::Completed));
        assert_eq!(result.session.state["temp"]["greeted"], json!(true));
    }

    #[tokio::test]
    async fn webhook_node_dispatches_to_task_queue_instead_of_calling_inline() {
        let flow = make_flow(
            "f1",
            vec![
                Node {
                    db_id: 1,
                    node_id: "a".into(),
                    label: String::new(),
                    content: NodeContent::Webhook(crate::model::WebhookContent {
                        url: "https://example.invalid/hook".into(),
                        method: "POST".into(),
                        headers: Default::default(),
                        payload: Value::Null,
                        timeout_secs: 30,
                        store_response: false,
                        response_key: "result".into(),
                    }),
                },
                msg_node("b", "done"),
            ],
            vec![edge("a", "b")],
            "a",
        );
        let (engine, mut rx) = engine_with(flow).await;
        let result = engine.start_session("f1", None).await.unwrap();
        assert!(matches!(result.outcome, TurnOutcome::Pending { ref node_id } if node_id == "a"));
        // No outgoing edge was taken; the session is parked on the webhook node.
        assert_eq!(result.session.current_node_id.as_deref(), Some("a"));

        let dispatched = rx.try_recv().expect("webhook should be enqueued, not called inline");
        assert!(matches!(dispatched.kind, TaskKind::Webhook { .. }));
        assert_eq!(dispatched.node_id, "a");
    }

    #[tokio::test]
    async fn async_action_dispatches_and_resumes_after_ledger_completes() {
        let flow = make_flow(
            "f1",
            vec![
                Node {
                    db_id: 1,
                    node_id: "a".into(),
                    label: String::new(),
                    content: NodeContent::Action(ActionContent {
                        actions: vec![ActionOp::SetVariable { variable: "temp.done".into(), value: json!(true) }],
                        run_async: true,
                    }),
                },
                msg_node("b", "done"),
            ],
            vec![edge("a", "b")],
            "a",
        );
        let (engine, mut rx) = engine_with(flow).await;
        let first = engine.start_session("f1", None).await.unwrap();
        assert!(matches!(first.outcome, TurnOutcome::Pending { ref node_id } if node_id == "a"));

        let dispatched = rx.try_recv().unwrap();
        assert!(matches!(dispatched.kind, TaskKind::Action { .. }));

        // Re-entering the turn before the task handler has written a
        // terminal status finds the same in-progress ledger record — via
        // the idempotency key stashed in `local` on first dispatch, since
        // `expected_revision` moved on when this turn's own state write
        // persisted — and parks again without redispatching.
        let again = engine.interact(&first.session.id, first.session.revision, json!(null)).await.unwrap();
        assert!(matches!(again.outcome, TurnOutcome::Pending { ref node_id } if node_id == "a"));
        assert!(rx.try_recv().is_err(), "resuming an in-progress task must not redispatch it");
    }
}
