pub mod csrf;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::flows::FlowEngine;
use crate::flows::store::FlowStore;
use crate::repository::SessionRepository;
use crate::tasks::{TaskHandler, TaskPayload};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<FlowEngine>,
    pub flows: Arc<dyn FlowStore>,
    pub sessions: Arc<dyn SessionRepository>,
    pub task_handler: Arc<TaskHandler>,
    /// Enqueue surface for yes-pending ACTION/WEBHOOK nodes the turn loop
    /// hands off to the background worker loop (see `spawn_task_worker`).
    pub task_tx: mpsc::Sender<TaskPayload>,
}

/// Drains the task queue, running each payload through the Task Handler's
/// nine-phase protocol — the teacher's `FlowScheduler` background-loop
/// shape, re-pointed at task execution instead of GitHub polling.
pub fn spawn_task_worker(handler: Arc<TaskHandler>, mut rx: mpsc::Receiver<TaskPayload>) {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(payload).await {
                    tracing::error!(error = %e, "background task failed");
                }
            });
        }
    });
}

pub fn create_app(state: AppState) -> axum::Router {
    routes::build_router(state)
}
