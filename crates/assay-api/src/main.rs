mod auth;
mod config;
mod delivery;
mod error;
mod rate_limit;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use assay_core::notify::PushOutbox;
use assay_core::SyncService;
use clap::{Parser, Subcommand};
use config::AppConfig;
use delivery::PushDelivery;
use routes::{app_router, AppState};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "assay-api", version, about = "Assay sync backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the sync and mark-ready endpoints (default)
    Serve,
    /// Apply pending schema migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("assay_api=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::from_env()?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            let (outbox, _events) = PushOutbox::channel();
            SyncService::open_path(&config.database_path, outbox).await?;
            tracing::info!(path = %config.database_path.display(), "Schema is current");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Arc<AppConfig>) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting assay-api with config: {:?}", config);

    let (outbox, events) = PushOutbox::channel();
    let delivery = PushDelivery::from_config(&config).spawn(events);

    let sync = SyncService::open_path(&config.database_path, outbox)
        .await?
        .with_max_pull_rows(config.sync_max_pull_rows);
    let state = AppState::new(Arc::clone(&config), sync);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("assay-api listening on {}", config.bind_addr);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    delivery.abort();
    Ok(())
}
