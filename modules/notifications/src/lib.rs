//! # Notification Service
//!
//! Runs a grade event worker bound to `<domain>.new.*` on the grades
//! exchange and serves health and readiness endpoints. Every worker instance has its own
//! exclusive queue, so every running instance receives every grade event.

pub mod config;
pub mod notifier;

use amqp_bus::{AmqpBroker, Broker, BusResult, Worker, WorkerConfig, WorkerHandle, WorkerState};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use grade_contracts::{binding_key, GradeEvent};
use serde_json::{json, Value};
use std::future::Future;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use notifier::GradeNotifier;

/// Span name recorded for every consumed grade event
pub const PROCESS_SPAN_NAME: &str = "ProcessGradeNotification";

/// Worker settings derived from the service configuration
pub fn worker_config(config: &Config) -> WorkerConfig {
    WorkerConfig::new(config.bus.exchange.clone(), binding_key(&config.bus.routing_domain))
        .with_consumer_tag(config.consumer_tag.clone())
        .with_poll_interval(config.poll_interval)
        .with_span_name(PROCESS_SPAN_NAME)
}

/// Start the grade notification worker on the configured RabbitMQ broker
pub fn start_worker(config: &Config) -> WorkerHandle {
    let url = config.bus.amqp_url.clone();
    start_worker_with(config, async move { AmqpBroker::connect(&url).await })
}

/// Start the grade notification worker with a custom connection future
pub fn start_worker_with<B, F>(config: &Config, connect: F) -> WorkerHandle
where
    B: Broker + 'static,
    F: Future<Output = BusResult<B>> + Send + 'static,
{
    let worker_config = worker_config(config);
    tracing::info!(
        exchange = %worker_config.exchange,
        binding_key = %worker_config.binding_key,
        consumer_tag = %worker_config.consumer_tag,
        "Starting grade notification worker"
    );

    Worker::<GradeEvent, _>::new(worker_config, GradeNotifier::new()).spawn(connect)
}

/// Health check endpoint handler
pub async fn health(State(worker): State<watch::Receiver<WorkerState>>) -> Json<Value> {
    let worker_state = *worker.borrow();
    Json(json!({
        "status": "healthy",
        "service": "notifications-rs",
        "version": env!("CARGO_PKG_VERSION"),
        "worker": worker_state.as_str()
    }))
}

/// Readiness: the worker must be consuming
pub async fn health_ready(
    State(worker): State<watch::Receiver<WorkerState>>,
) -> Result<Json<Value>, StatusCode> {
    let worker_state = *worker.borrow();
    if worker_state != WorkerState::Consuming {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "worker": worker_state.as_str()
    })))
}

/// Build the application router
pub fn app(worker: watch::Receiver<WorkerState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/health/ready", get(health_ready))
        .with_state(worker)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Initialize the global tracing subscriber
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
