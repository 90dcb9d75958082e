//! Core domain types shared across the engine: flow graphs, sessions,
//! history, and the idempotency ledger. Mirrors the relational layout in
//! the persistence layer (see `repository`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A session's nested scope tree. Top-level keys are scope names
/// (`user`, `context`, `temp`, `variables`, `webhook_responses`, ...);
/// values are arbitrary JSON.
pub type SessionState = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Flow graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub entry_node_id: String,
    #[serde(default = "default_true")]
    pub published: bool,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl FlowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Outgoing connections from `node_id`, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &Connection> {
        self.connections
            .iter()
            .filter(move |c| c.source_node_id == node_id)
    }

    /// Validate structural invariants: unique node ids, connections reference
    /// existing nodes, entry node exists.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for n in &self.nodes {
            if !seen.insert(n.node_id.as_str()) {
                issues.push(format!("duplicate node_id '{}'", n.node_id));
            }
        }
        if self.node(&self.entry_node_id).is_none() {
            issues.push(format!(
                "entry_node_id '{}' does not resolve to a node",
                self.entry_node_id
            ));
        }
        for c in &self.connections {
            if self.node(&c.source_node_id).is_none() {
                issues.push(format!(
                    "connection {} references unknown source node '{}'",
                    c.id, c.source_node_id
                ));
            }
            if self.node(&c.target_node_id).is_none() {
                issues.push(format!(
                    "connection {} references unknown target node '{}'",
                    c.id, c.target_node_id
                ));
            }
        }
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Message,
    Question,
    Condition,
    Action,
    Webhook,
    Composite,
    Script,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Database identity, distinct from the author-facing `node_id`.
    pub db_id: i64,
    pub node_id: String,
    #[serde(default)]
    pub label: String,
    pub content: NodeContent,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match &self.content {
            NodeContent::Message(_) => NodeType::Message,
            NodeContent::Question(_) => NodeType::Question,
            NodeContent::Condition(_) => NodeType::Condition,
            NodeContent::Action(_) => NodeType::Action,
            NodeContent::Webhook(_) => NodeType::Webhook,
            NodeContent::Composite(_) => NodeType::Composite,
            NodeContent::Script(_) => NodeType::Script,
        }
    }
}

/// Tagged union over the seven node types. Each variant carries its own
/// content schema; the Processor and Engine match on the variant instead of
/// relying on a dynamic-dispatch hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node_type", content = "content", rename_all = "snake_case")]
pub enum NodeContent {
    Message(MessageContent),
    Question(QuestionContent),
    Condition(ConditionContent),
    Action(ActionContent),
    Webhook(WebhookContent),
    Composite(CompositeContent),
    Script(ScriptContent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionContent {
    pub prompt: String,
    /// Dotted variable path the answer is recorded into. Defaults to the
    /// `variables` scope when no scope prefix is given.
    pub variable: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionContent {
    pub clauses: Vec<crate::condition::ConditionClause>,
    pub default_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContent {
    pub actions: Vec<crate::processors::ActionOp>,
    /// Small/cheap action lists run synchronously in the turn; anything
    /// marked async is handed to the background task handler (C6).
    #[serde(default)]
    pub run_async: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookContent {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub store_response: bool,
    #[serde(default = "default_response_key")]
    pub response_key: String,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_response_key() -> String {
    "result".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeContent {
    pub child_flow_id: String,
    /// parent dotted path -> child `input.*` dotted path
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    /// child `output.*` dotted path -> parent dotted path
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptContent {
    pub script: String,
    #[serde(default = "default_script_language")]
    pub language: String,
}

fn default_script_language() -> String {
    "javascript".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: i64,
    pub source_node_id: String,
    pub target_node_id: String,
    /// One of `DEFAULT`, `option_N`, `SUCCESS`, `FAILURE`, or an
    /// author-defined label matched against a condition clause's `then`.
    pub connection_type: String,
    #[serde(default)]
    pub conditions: Option<serde_json::Value>,
}

pub mod edge_label {
    pub const DEFAULT: &str = "DEFAULT";
    pub const SUCCESS: &str = "SUCCESS";
    pub const FAILURE: &str = "FAILURE";

    pub fn option(index: usize) -> String {
        format!("option_{index}")
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub session_token: String,
    pub flow_id: String,
    pub user_id: Option<String>,
    pub state: SessionState,
    pub current_node_id: Option<String>,
    pub revision: i64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn scope(&self, name: &str) -> Option<&serde_json::Value> {
        self.state.get(name)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Message,
    Input,
    Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub session_id: String,
    pub node_id: String,
    pub interaction_type: InteractionType,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Idempotency ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub session_id: String,
    pub node_id: String,
    pub session_revision: i64,
    pub status: IdempotencyStatus,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// flow_events pub/sub payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    SessionStarted,
    NodeChanged,
    SessionStatusChanged,
    SessionUpdated,
    SessionDeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_type: FlowEventType,
    pub session_id: String,
    pub flow_id: String,
    pub user_id: Option<String>,
    pub current_node_id: Option<String>,
    pub previous_node_id: Option<String>,
    pub current_status: SessionStatus,
    pub previous_status: Option<SessionStatus>,
    pub revision: i64,
    pub previous_revision: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn flow_with(nodes: Vec<Node>, connections: Vec<Connection>, entry: &str) -> FlowDefinition {
        FlowDefinition {
            id: "f1".into(),
            name: "Test".into(),
            version: "1".into(),
            entry_node_id: entry.into(),
            published: true,
            nodes,
            connections,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn msg_node(id: &str) -> Node {
        Node {
            db_id: 1,
            node_id: id.into(),
            label: String::new(),
            content: NodeContent::Message(MessageContent { messages: vec!["hi".into()] }),
        }
    }

    #[test]
    fn validate_accepts_well_formed_flow() {
        let flow = flow_with(vec![msg_node("a")], vec![], "a");
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_entry_node() {
        let flow = flow_with(vec![msg_node("a")], vec![], "missing");
        let issues = flow.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("entry_node_id")));
    }

    #[test]
    fn validate_rejects_dangling_connection() {
        let flow = flow_with(
            vec![msg_node("a")],
            vec![Connection {
                id: 1,
                source_node_id: "a".into(),
                target_node_id: "ghost".into(),
                connection_type: edge_label::DEFAULT.into(),
                conditions: None,
            }],
            "a",
        );
        let issues = flow.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("ghost")));
    }

    #[test]
    fn validate_rejects_duplicate_node_ids() {
        let flow = flow_with(vec![msg_node("a"), msg_node("a")], vec![], "a");
        let issues = flow.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("duplicate")));
    }
}
