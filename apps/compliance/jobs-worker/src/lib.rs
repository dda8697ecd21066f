//! Compliance Jobs Worker Service
//!
//! A background worker that processes the application's asynchronous jobs:
//! email delivery, document text extraction, and AI completions.
//!
//! ## Architecture
//!
//! ```text
//! Producer API (enqueue_email / enqueue_document_extraction / enqueue_ai_completion)
//!   ↓
//! Backing store (Redis Streams when durable, log-and-discard otherwise)
//!   ↓ (one consumer group per job class)
//! Per-class worker pools with execution timeouts and retry backoff
//!   ↓
//! Handlers (EmailHandler, DocumentExtractionHandler, AiCompletionHandler)
//! ```
//!
//! ## Features
//!
//! - Per-class concurrency limits and execution timeouts
//! - Automatic retry with exponential backoff
//! - Dead letter streams for exhausted jobs
//! - Graceful shutdown with a configurable drain window
//! - Health, stats, and Prometheus endpoints for probes

pub mod handlers;

use axum::Router;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use handlers::{AiCompletionHandler, DocumentExtractionHandler, EmailHandler};
use job_queue::{admin_router, AdminState, JobClass, JobSystem, QueueConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Start the health and admin HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`
/// - Readiness probes: `/ready`
/// - Queue stats: `/stats`
/// - Prometheus metrics: `/metrics`
async fn start_admin_server(state: AdminState, port: u16) -> Result<()> {
    let app: Router = admin_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", addr))?;

    info!(port = %port, "Admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Admin server failed")?;

    Ok(())
}

/// Run the jobs worker
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads queue configuration and registers the three handlers
/// 3. Starts the worker pools and the admin HTTP server
/// 4. Drains and shuts down on SIGINT/SIGTERM
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    job_queue::init_metrics();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting compliance jobs worker"
    );
    info!("Environment: {:?}", environment);

    // Admin server port (default 8083)
    let admin_port: u16 = std::env::var("JOBS_WORKER_ADMIN_PORT")
        .or_else(|_| std::env::var("HEALTH_PORT"))
        .unwrap_or_else(|_| "8083".to_string())
        .parse()
        .unwrap_or(8083);

    let config = QueueConfig::from_env().wrap_err("Failed to load queue configuration")?;
    info!(
        durable = config.durable,
        grace_secs = config.grace_window.as_secs(),
        "Queue configuration loaded"
    );

    let system = Arc::new(
        JobSystem::builder(config)
            .handler(JobClass::Email, Arc::new(EmailHandler::default()))
            .handler(
                JobClass::DocumentExtraction,
                Arc::new(DocumentExtractionHandler::default()),
            )
            .handler(JobClass::AiCompletion, Arc::new(AiCompletionHandler::default()))
            .build(),
    );

    system
        .start()
        .await
        .map_err(|e| eyre::eyre!("Failed to start job system: {e}"))?;

    let admin_state = AdminState {
        system: system.clone(),
        app_name: env!("CARGO_PKG_NAME"),
        app_version: env!("CARGO_PKG_VERSION"),
    };
    tokio::spawn(async move {
        if let Err(e) = start_admin_server(admin_state, admin_port).await {
            error!(error = %e, "Admin server failed");
        }
    });

    job_queue::shutdown_signal().await;

    system
        .shutdown()
        .await
        .map_err(|e| eyre::eyre!("Shutdown failed: {e}"))?;

    info!("Compliance jobs worker stopped");
    Ok(())
}
