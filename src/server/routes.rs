//! The Turn Orchestrator's HTTP surface: five turn-protocol routes, the
//! internal task-delivery endpoint, and an SSE event stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use super::{AppState, csrf, middleware};
use crate::error::{AppError, AppResult};
use crate::flows::engine::TurnResult;
use crate::model::FlowEvent;
use crate::repository::StateUpdate;
use crate::tasks::TaskPayload;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route("/", get(|| async { Json(json!({ "status": "ok" })) }));

    let protected = Router::new()
        .route("/sessions/{token}/interact", post(interact))
        .route("/sessions/{token}/state", patch(update_state))
        .route("/sessions/{token}/end", post(end_session))
        .layer(axum::middleware::from_fn(csrf::protect));

    Router::new()
        .nest("/health", health_routes)
        .route("/sessions", post(start_session))
        .route("/sessions/{token}", get(get_session))
        .merge(protected)
        .route("/internal/tasks", post(submit_task))
        .route("/events", get(stream_events))
        .fallback(not_found)
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(middleware::enrich_current_span_middleware))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!(path = %req.uri(), "unhandled path");
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

fn turn_response(result: TurnResult) -> Json<Value> {
    let outcome = match &result.outcome {
        crate::flows::engine::TurnOutcome::AwaitingInput(prompt) => json!({
            "status": "awaiting_input",
            "node_id": prompt.node_id,
            "prompt": prompt.prompt,
            "options": prompt.options,
        }),
        crate::flows::engine::TurnOutcome::Pending { node_id } => json!({ "status": "pending", "node_id": node_id }),
        crate::flows::engine::TurnOutcome::Completed => json!({ "status": "completed" }),
    };

    Json(json!({
        "session_id": result.session.id,
        "session_token": result.session.session_token,
        "revision": result.session.revision,
        "current_node_id": result.session.current_node_id,
        "messages": result.messages,
        "outcome": outcome,
    }))
}

// --- POST /sessions ---

#[derive(Deserialize)]
struct StartSessionRequest {
    flow_id: String,
    #[serde(default)]
    user_id: Option<String>,
}

async fn start_session(State(state): State<AppState>, Json(body): Json<StartSessionRequest>) -> AppResult<impl IntoResponse> {
    let result = state.engine.start_session(&body.flow_id, body.user_id).await?;
    Ok((axum::http::StatusCode::CREATED, turn_response(result)))
}

// --- GET /sessions/:token ---

async fn get_session(State(state): State<AppState>, Path(token): Path<String>) -> AppResult<Json<Value>> {
    let session = state.sessions.get_by_token(&token).await?;
    Ok(Json(json!({
        "session_id": session.id,
        "session_token": session.session_token,
        "flow_id": session.flow_id,
        "state": session.state,
        "current_node_id": session.current_node_id,
        "revision": session.revision,
        "status": session.status,
    })))
}

// --- POST /sessions/:token/interact ---

#[derive(Deserialize)]
struct InteractRequest {
    expected_revision: i64,
    input: Value,
}

async fn interact(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<InteractRequest>,
) -> AppResult<Json<Value>> {
    let session = state.sessions.get_by_token(&token).await?;
    let result = state.engine.interact(&session.id, body.expected_revision, body.input).await?;
    Ok(turn_response(result))
}

// --- PATCH /sessions/:token/state ---

#[derive(Deserialize)]
struct UpdateStateRequest {
    expected_revision: i64,
    patch: Value,
}

async fn update_state(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<UpdateStateRequest>,
) -> AppResult<Json<Value>> {
    let session = state.sessions.get_by_token(&token).await?;
    let updated = state
        .sessions
        .update_state(
            &session.id,
            body.expected_revision,
            StateUpdate { patch: body.patch, new_node_id: None, new_status: None },
        )
        .await?;
    Ok(Json(json!({ "session_id": updated.id, "revision": updated.revision, "state": updated.state })))
}

// --- POST /sessions/:token/end ---

#[derive(Deserialize)]
struct EndSessionRequest {
    expected_revision: i64,
}

async fn end_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<EndSessionRequest>,
) -> AppResult<Json<Value>> {
    let session = state.sessions.get_by_token(&token).await?;
    let ended = state.sessions.end(&session.id, body.expected_revision).await?;
    Ok(Json(json!({ "session_id": ended.id, "status": ended.status, "ended_at": ended.ended_at })))
}

// --- POST /internal/tasks ---

async fn submit_task(State(state): State<AppState>, Json(payload): Json<TaskPayload>) -> Response {
    match state.task_tx.send(payload).await {
        Ok(()) => (axum::http::StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "task queue closed");
            AppError::Fatal(anyhow::anyhow!("task queue unavailable")).into_response()
        }
    }
}

// --- GET /events ---

#[derive(Deserialize)]
struct EventsQuery {
    session_id: Option<String>,
    flow_id: Option<String>,
}

#[tracing::instrument(skip_all)]
async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sessions.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |event| match event {
        Ok(event) => filter_event(&query, event).map(|e| Ok(to_sse_event(e))),
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn filter_event(query: &EventsQuery, event: FlowEvent) -> Option<FlowEvent> {
    if let Some(session_id) = &query.session_id {
        if &event.session_id != session_id {
            return None;
        }
    }
    if let Some(flow_id) = &query.flow_id {
        if &event.flow_id != flow_id {
            return None;
        }
    }
    Some(event)
}

fn to_sse_event(event: FlowEvent) -> Event {
    Event::default().event("flow_event").json_data(&event).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize flow event");
        Event::default().event("flow_event").data("{}")
    })
}
