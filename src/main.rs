mod condition;
mod config;
mod error;
mod flows;
mod idempotency;
mod model;
mod processors;
mod repository;
mod resolver;
mod secrets;
mod server;
mod tasks;

use std::error::Error;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use rusqlite::Connection;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::flows::store::{FlowStore, InMemoryFlowStore};
use crate::flows::FlowEngine;
use crate::idempotency::{IdempotencyLedger, SqliteIdempotencyLedger};
use crate::repository::{SessionRepository, SqliteSessionRepository};
use crate::resolver::SecretResolver;
use crate::secrets::EnvSecretResolver;
use crate::server::{AppState, spawn_task_worker};
use crate::tasks::TaskHandler;

#[derive(Parser)]
#[command(name = "flowtide", about = "Conversational flow runtime")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Load flow definition JSON files into the store
    Flows {
        #[command(subcommand)]
        action: FlowsAction,
    },
}

#[derive(clap::Subcommand)]
enum FlowsAction {
    /// Import every `*.json` flow definition under a directory
    Import {
        path: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    match cli {
        Cli::Serve => run_server().await,
        Cli::Flows { action: FlowsAction::Import { path } } => run_import(path).await,
    }
}

fn init_observability(config: &config::Config) -> sentry::ClientInitGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowtide=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(|metadata| match *metadata.level() {
            tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => sentry::integrations::tracing::EventFilter::Breadcrumb,
            _ => sentry::integrations::tracing::EventFilter::Ignore,
        }))
        .init();

    sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ))
}

async fn run_import(path: std::path::PathBuf) -> Result<(), Box<dyn Error>> {
    let store = InMemoryFlowStore::with_dir(path);
    store.load_all().await.context("failed to import flow definitions")?;
    println!("imported {} flow definitions", store.list().await.len());
    Ok(())
}

async fn run_server() -> Result<(), Box<dyn Error>> {
    let config = Arc::new(config::Config::from_env());
    let _guard = init_observability(&config);

    let http_client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(config.default_webhook_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let sessions: Arc<dyn SessionRepository> =
        Arc::new(SqliteSessionRepository::open(&config.database_path).context("failed to open session store")?);
    let idempotency: Arc<dyn IdempotencyLedger> =
        Arc::new(SqliteIdempotencyLedger::open(&config.database_path).context("failed to open idempotency ledger")?);
    let secrets: Arc<dyn SecretResolver> = Arc::new(EnvSecretResolver::new(config.secret_env_prefix.clone()));

    let flow_store = InMemoryFlowStore::with_dir(config.flows_dir.clone());
    flow_store.load_all().await.context("failed to load flow definitions")?;
    let flows: Arc<dyn FlowStore> = Arc::new(flow_store);

    let (task_tx, task_rx) = tokio::sync::mpsc::channel(256);

    let engine = Arc::new(FlowEngine::new(
        flows.clone(),
        sessions.clone(),
        idempotency.clone(),
        secrets.clone(),
        http_client.clone(),
        task_tx.clone(),
    ));

    let task_handler = Arc::new(TaskHandler::new(sessions.clone(), idempotency.clone(), secrets.clone(), http_client.clone()));
    spawn_task_worker(task_handler.clone(), task_rx);

    let app_state = AppState { config: config.clone(), engine, flows, sessions, task_handler, task_tx };

    let app = server::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
