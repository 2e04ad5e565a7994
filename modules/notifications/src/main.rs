use notifications_rs::{app, config::Config, init_tracing, start_worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    tracing::info!(
        host = %config.host,
        port = config.port,
        exchange = %config.bus.exchange,
        "Starting notification service"
    );

    // A worker that cannot reach the broker stays in `connecting`; the
    // health endpoint keeps serving either way.
    let worker = start_worker(&config);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Notification service listening");

    axum::serve(listener, app(worker.subscribe()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping grade notification worker");
    match worker.stop().await {
        Ok(()) => tracing::info!("Notification service stopped"),
        Err(e) => tracing::warn!(error = %e, "Worker stopped with error"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
