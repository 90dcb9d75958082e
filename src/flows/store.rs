//! Flow definition storage. Mirrors the teacher's file-backed store: an
//! in-memory index backed by one JSON file per flow, loaded eagerly at
//! startup and kept in sync on every write.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};
use crate::model::FlowDefinition;

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get(&self, flow_id: &str) -> AppResult<FlowDefinition>;

    /// Like `get`, but rejects flows that exist in draft form only — the
    /// engine must never execute an unpublished flow against a live session.
    async fn get_published(&self, flow_id: &str) -> AppResult<FlowDefinition> {
        let flow = self.get(flow_id).await?;
        if !flow.published {
            return Err(AppError::FlowNotPublished(flow_id.to_string()));
        }
        Ok(flow)
    }

    async fn list(&self) -> Vec<FlowDefinition>;
    async fn save(&self, flow: FlowDefinition) -> AppResult<()>;
    async fn delete(&self, flow_id: &str) -> AppResult<bool>;
}

pub struct InMemoryFlowStore {
    flows_dir: Option<PathBuf>,
    flows: RwLock<HashMap<String, FlowDefinition>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self { flows_dir: None, flows: RwLock::new(HashMap::new()) }
    }

    pub fn with_dir(flows_dir: PathBuf) -> Self {
        Self { flows_dir: Some(flows_dir), flows: RwLock::new(HashMap::new()) }
    }

    pub async fn load_all(&self) -> AppResult<()> {
        let Some(dir) = &self.flows_dir else { return Ok(()) };
        std::fs::create_dir_all(dir).map_err(|e| AppError::Fatal(e.into()))?;

        let mut loaded = HashMap::new();
        for entry in std::fs::read_dir(dir).map_err(|e| AppError::Fatal(e.into()))? {
            let entry = entry.map_err(|e| AppError::Fatal(e.into()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| AppError::Fatal(e.into()))?;
            let flow: FlowDefinition = serde_json::from_str(&content).map_err(|e| AppError::Fatal(e.into()))?;
            tracing::info!(flow_id = %flow.id, name = %flow.name, "loaded flow definition");
            loaded.insert(flow.id.clone(), flow);
        }
        let count = loaded.len();
        *self.flows.write().await = loaded;
        tracing::info!(count, "loaded all flow definitions");
        Ok(())
    }

    fn path_for(&self, flow_id: &str) -> Option<PathBuf> {
        self.flows_dir.as_ref().map(|dir| dir.join(format!("{flow_id}.json")))
    }
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn get(&self, flow_id: &str) -> AppResult<FlowDefinition> {
        self.flows
            .read()
            .await
            .get(flow_id)
            .cloned()
            .ok_or_else(|| AppError::FlowNotFound(flow_id.to_string()))
    }

    async fn list(&self) -> Vec<FlowDefinition> {
        self.flows.read().await.values().cloned().collect()
    }

    async fn save(&self, flow: FlowDefinition) -> AppResult<()> {
        flow.validate().map_err(AppError::FlowValidation)?;
        if let Some(path) = self.path_for(&flow.id) {
            let content = serde_json::to_string_pretty(&flow).map_err(|e| AppError::Fatal(e.into()))?;
            std::fs::write(&path, content).map_err(|e| AppError::Fatal(e.into()))?;
        }
        self.flows.write().await.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn delete(&self, flow_id: &str) -> AppResult<bool> {
        let existed = self.flows.write().await.remove(flow_id).is_some();
        if let Some(path) = self.path_for(flow_id) {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| AppError::Fatal(e.into()))?;
            }
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, MessageContent, Node, NodeContent, edge_label};
    use chrono::Utc;
    use tempfile::tempdir;

    fn test_flow(id: &str, published: bool) -> FlowDefinition {
        FlowDefinition {
            id: id.to_string(),
            name: "Test".into(),
            version: "1".into(),
            entry_node_id: "a".into(),
            published,
            nodes: vec![Node {
                db_id: 1,
                node_id: "a".into(),
                label: String::new(),
                content: NodeContent::Message(MessageContent { messages: vec!["hi".into()] }),
            }],
            connections: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trips() {
        let store = InMemoryFlowStore::new();
        store.save(test_flow("f1", true)).await.unwrap();
        let fetched = store.get("f1").await.unwrap();
        assert_eq!(fetched.id, "f1");
    }

    #[tokio::test]
    async fn get_published_rejects_draft() {
        let store = InMemoryFlowStore::new();
        store.save(test_flow("f1", false)).await.unwrap();
        let err = store.get_published("f1").await.unwrap_err();
        assert!(matches!(err, AppError::FlowNotPublished(_)));
    }

    #[tokio::test]
    async fn save_rejects_invalid_flow() {
        let store = InMemoryFlowStore::new();
        let mut flow = test_flow("f1", true);
        flow.connections.push(Connection {
            id: 1,
            source_node_id: "a".into(),
            target_node_id: "ghost".into(),
            connection_type: edge_label::DEFAULT.into(),
            conditions: None,
        });
        assert!(store.save(flow).await.is_err());
    }

    #[tokio::test]
    async fn persists_to_disk_and_reloads() {
        let dir = tempdir().unwrap();
        let store = InMemoryFlowStore::with_dir(dir.path().to_path_buf());
        store.load_all().await.unwrap();
        store.save(test_flow("f1", true)).await.unwrap();

        let reloaded = InMemoryFlowStore::with_dir(dir.path().to_path_buf());
        reloaded.load_all().await.unwrap();
        assert_eq!(reloaded.get("f1").await.unwrap().name, "Test");
    }
}
