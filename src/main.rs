mod collection;
mod config;
mod error;
mod feed;
mod item;
mod read_state;
mod routes;
mod scrape;

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::collection::{ChangeStamp, FeedCollection};
use crate::config::FeedsFile;
use crate::feed::http_client;
use crate::read_state::ReadStateStore;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedstand=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("FEEDSTAND_CONFIG").unwrap_or_else(|_| "feedstand.json".to_string());
    let readcache_path = std::env::var("FEEDSTAND_READCACHE")
        .unwrap_or_else(|_| "feedstand_readcache.json".to_string());

    // Load the read cache and start its eviction sweep
    let read_state = Arc::new(ReadStateStore::load(&readcache_path).await);
    read_state::spawn_eviction(read_state.clone());

    // Load the feeds file and start per-feed polling
    let file = FeedsFile::load(&config_path)?;
    info!("Loaded {} feeds from {}", file.feeds.len(), config_path);

    let listen = file.config.listen.clone();
    let client = http_client(file.config.accept_invalid_certs);
    let changes = Arc::new(ChangeStamp::new());
    let feeds = Arc::new(FeedCollection::new(
        file,
        config_path.as_str(),
        read_state.clone(),
        changes.clone(),
        client,
    ));
    feeds.start_all().await;

    // Build router
    let state = Arc::new(AppState {
        feeds,
        read_state,
        changes,
    });
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("Listening on http://{}", listen);

    axum::serve(listener, app).await?;

    Ok(())
}
