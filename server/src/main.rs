//! Converge Server binary.

use converge_server::config::{CatalogFile, Config};
use converge_server::runner::Runner;
use converge_server::AppState;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "converge_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Converge Server on {}:{}", config.host, config.port);

    // Load entity catalog and origins
    let catalog_file = CatalogFile::load(&config.catalog_path)?;
    let catalog = Arc::new(catalog_file.catalog());
    let origins = Arc::new(catalog_file.origins()?);
    tracing::info!(
        kinds = ?catalog.kinds().collect::<Vec<_>>(),
        origins = ?origins.names().collect::<Vec<_>>(),
        "catalog loaded from {}",
        config.catalog_path.display()
    );

    let mut runner = Runner::new(catalog, origins, config.run);
    if let Some(dir) = &config.journal_dir {
        tracing::info!("Writing run journals to {}", dir.display());
        runner = runner.with_journal_dir(dir.clone());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let app = converge_server::app(AppState::new(config, runner));

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
