use anyhow::Context;
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    Method,
};
use replica_store::{
    config::Config,
    infrastructure::database::{ConnectionSupervisor, MongoConnector},
    presentation::create_router,
    AppState,
};
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::init().context("Invalid configuration")?);

    // Connection attempts continue in the background; the server starts regardless
    let supervisor = ConnectionSupervisor::start(
        config.connection.clone(),
        Arc::new(MongoConnector),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([ACCEPT, CONTENT_TYPE]);

    let app_state = AppState::new(Arc::clone(&config), Arc::clone(&supervisor));
    let app = create_router(app_state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;

    info!("🚀 Server started successfully on port {}", config.port);
    info!("📊 Health check: http://localhost:{}/health", config.port);
    info!("🗄️  MongoDB database: {}", config.connection.database_name);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("⏹️ HTTP server stopped, closing store connection...");
    match supervisor.shutdown().await {
        Ok(report) if report.drained => info!("✅ Shutdown complete"),
        Ok(report) => warn!(
            force_cancelled = report.force_cancelled,
            "Shutdown finished with cancelled operations"
        ),
        Err(e) => {
            error!("❌ Store shutdown failed: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
