use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blobvault::config::Config;
use blobvault::services::Reclaimer;
use blobvault::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blobvault=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting blobvault...");

    // Load configuration
    let config = Config::load()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // Initialize catalog, content store and collaborators
    let state = AppState::new(config).await?;
    tracing::info!("Database initialized");

    // Remove content left behind by a crash between commit and physical delete
    Reclaimer::reconcile(&state).await?;

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
