/*
 * 5D Labs Agent Platform - NamespaceClass Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! NamespaceClass Controller - Kubernetes controller for `NamespaceClass` CRDs
//!
//! This service keeps every namespace labeled with a class in line with it by:
//! - Watching `NamespaceClass` objects, labeled namespaces and generated children
//! - Creating and updating the class's `NetworkPolicy` and `ServiceAccount`
//! - Recording the applied generation on the class status
//! - Providing health and readiness endpoints

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use controller::tasks::{load_controller_config, resolve_config_path, run_namespaceclass_controller};
use controller::{ControllerConfig, DeletionPolicy};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// NamespaceClass controller
#[derive(Parser, Debug)]
#[command(name = "namespaceclass-controller", version)]
#[command(about = "Project NamespaceClass templates into member namespaces")]
struct Args {
    /// Path to the controller config file (or set `CONTROLLER_CONFIG_PATH`).
    #[arg(long, env = "CONTROLLER_CONFIG_PATH")]
    config: Option<String>,

    /// Number of reconciliations allowed to run at once.
    #[arg(long)]
    workers: Option<usize>,

    /// What happens to generated children when they lose their class (Orphan or Cascade).
    #[arg(long)]
    deletion_policy: Option<DeletionPolicy>,

    /// Address of the health and readiness server.
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,

    /// Log output format.
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    log_format: String,
}

#[derive(Clone)]
struct AppState {
    config: Arc<ControllerConfig>,
    shutdown: CancellationToken,
}

fn init_tracing(args: &Args) {
    let default_filter = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if args.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!(
        "Starting NamespaceClass Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config_path = resolve_config_path(args.config.as_deref(), DEFAULT_CONFIG_PATH)?;
    let mut config = load_controller_config(config_path)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(policy) = args.deletion_policy {
        config.deletion_policy = policy;
    }
    config
        .validate()
        .context("invalid controller configuration after flag overrides")?;
    info!(
        workers = config.workers,
        deletion_policy = %config.deletion_policy,
        membership_label = %config.membership_label,
        "Controller configuration ready"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let state = AppState {
        config: Arc::new(config.clone()),
        shutdown: shutdown.clone(),
    };

    // Start the controller in the background
    let controller_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_namespaceclass_controller(client, config, shutdown.clone()).await {
                error!("Controller error: {}", e);
                shutdown.cancel();
            }
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.health_addr)
        .await
        .with_context(|| format!("failed to bind health server on {}", args.health_addr))?;
    info!("Health server listening on {}", args.health_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    () = shutdown_signal() => {}
                    () = shutdown.cancelled() => {}
                }
                shutdown.cancel();
            }
        })
        .await?;

    if let Err(e) = controller_handle.await {
        warn!("Controller task ended abnormally: {}", e);
    }
    info!("NamespaceClass controller stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "namespaceclass-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.shutdown.is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "namespaceclass-controller",
        "workers": state.config.workers,
        "deletionPolicy": state.config.deletion_policy.to_string(),
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
