//! realtime-page-cache: cursor-paginated query cache over a live collection.
//!
//! Serves filtered, sorted pages of a seeded in-memory member collection and
//! keeps every cached page consistent as items are inserted and deleted:
//!   live delivery → boundary change → cascade reload → SSE update
//!
//! Exposes a small JSON HTTP API plus an SSE update feed.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use realtime_page_cache::config::{Cli, Config};
use realtime_page_cache::server::api::{build_router, AppState};
use realtime_page_cache::store::memory::MemoryCollection;
use realtime_page_cache::store::Item;

const PREFECTURES: [&str; 8] = [
    "Hokkaido", "Miyagi", "Tokyo", "Kanagawa", "Aichi", "Osaka", "Hiroshima", "Fukuoka",
];

/// Generated demo members, `_id` zero-padded so id order matches numeric order.
fn seed_members(count: usize) -> impl Iterator<Item = Item> {
    (1..=count).map(|i| {
        Item::new(format!("{i:010}"))
            .with("id", i)
            .with("memberId", format!("M{i:05}"))
            .with("name", format!("user{i}"))
            .with("email", format!("user{i}@test.com"))
            .with("age", 15 + (i * 7) % 60)
            .with("address", PREFECTURES[i % PREFECTURES.len()])
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "realtime_page_cache=debug,tower_http=debug"
    } else {
        "realtime_page_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("realtime-page-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        page_size = config.cache.page_size,
        queue_capacity = config.cache.queue_capacity,
        sort_field = %config.query.sort_field,
        direction = %config.query.direction,
        "Configuration loaded"
    );

    // Seed the demo collection.
    let collection = MemoryCollection::with_items(seed_members(config.seed.items));
    info!(items = collection.len(), "Collection seeded");

    // Build application state and the HTTP router.
    let state = AppState::new(collection, config.clone()).await?;
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
