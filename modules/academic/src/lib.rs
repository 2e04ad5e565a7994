//! # Academic Service
//!
//! Accepts grade submissions over HTTP and publishes them as grade events
//! to the grades topic exchange. Notification delivery happens downstream
//! (choreography): this service never calls the notification service.

pub mod config;
pub mod health;
pub mod routes;

use amqp_bus::{AmqpBroker, Broker, EventProducer, OfflineBroker};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared state for the HTTP handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub producer: EventProducer,
    pub exchange: String,
    pub routing_domain: String,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        routing_domain: impl Into<String>,
    ) -> Self {
        Self {
            producer: EventProducer::new(broker),
            exchange: exchange.into(),
            routing_domain: routing_domain.into(),
        }
    }
}

/// Build the application router
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/health/ready", get(health::health_ready))
        .route(
            "/api/grades/choreography",
            post(routes::grades::submit_grade_choreography),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Open the RabbitMQ connection
///
/// An unreachable broker is not fatal: the service starts with an
/// [`OfflineBroker`] and every submission answers `503` until restart.
pub async fn connect_broker(config: &Config) -> Arc<dyn Broker> {
    let url = &config.bus.amqp_url;
    tracing::info!(amqp_url = %redact(url), "Connecting to RabbitMQ");
    match AmqpBroker::connect(url).await {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            tracing::error!(
                error = %e,
                "Failed to connect to RabbitMQ; grade submissions will be rejected with 503"
            );
            Arc::new(OfflineBroker::new(e.to_string()))
        }
    }
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

/// Hide the password part of an AMQP URL
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..])
        }
        _ => url.to_string(),
    }
}
