//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{change_feed::ChangeFeed, PgBackend},
    config::Config,
    error::ApiError,
    web::{rest::ApiDoc, router, state::AppState},
};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to the Backend & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    let change_feed = ChangeFeed::default();
    let _listener_task = change_feed.listen(&config.database_url).await?;
    let backend = Arc::new(PgBackend::new(db_pool, change_feed));
    if config.run_migrations {
        info!("Running database migrations...");
        backend.run_migrations().await?;
        info!("Database migrations complete.");
    }

    // --- 3. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        backend,
        config: config.clone(),
    });

    // --- 4. Create the Web Router ---
    let app = Router::new()
        .merge(router(app_state)?)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
