use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use market_engine::config::Config;
use market_engine::http;
use market_engine::market_api::MarketEngine;
use market_engine::pg_store::PgDocumentStore;
use market_engine::store::{DocumentStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,market_engine=debug")),
        )
        .init();

    info!("Starting Market Engine...");

    let config = Config::from_env();
    config.log_config();

    // Pick the document store: PostgreSQL when configured, memory otherwise
    let store: Arc<dyn DocumentStore> = match &config.server.database_url {
        Some(url) => Arc::new(PgDocumentStore::connect(url, config.server.max_connections).await?),
        None => {
            info!("DATABASE_URL not set, using in-memory document store");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(MarketEngine::new(store, config.market.clone()));
    let app = http::router(engine);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr).await?;
    info!("Server running on http://{}", config.server.bind_addr);
    info!("Available endpoints:");
    info!("  GET  /health - Health check");
    info!("  POST /users, GET /users/:id, GET /users/:id/portfolio");
    info!("  GET|POST /markets, GET /markets/:id, /quote, /history");
    info!("  POST /markets/:id/trades, POST /markets/:id/resolve");
    info!("  GET  /leaderboard, GET /ws (event feed)");

    axum::serve(listener, app).await?;

    Ok(())
}
