use anyhow::Result;
use botpaywall::app::{CountingLayer, LogCounters, PaywallApp};
use botpaywall::config::Config;
use botpaywall::handlers;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; the counting layer feeds the status API.
    let log_counters = Arc::new(LogCounters::default());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("botpaywall=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(CountingLayer::new(log_counters.clone()))
        .init();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!("Starting bot paywall v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {:?}", config.environment);

    let addr = format!("{}:{}", config.host, config.port);

    // Wire services and bring the pipeline up before accepting requests.
    let app = Arc::new(PaywallApp::new(config, log_counters).await?);
    app.start().await?;

    let router = handlers::router(app.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Payment info: http://{}/payment-info", addr);
    tracing::info!("Health check: http://{}/health", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // The HTTP server is down; drain timers and flush the store.
    if let Err(e) = app.graceful_shutdown().await {
        tracing::error!("Shutdown finished with errors: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("Shutting down gracefully...");
}
