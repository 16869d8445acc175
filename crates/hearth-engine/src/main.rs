//! Hearth feed daemon.
//!
//! Connects to Nostr relays, pages a feed for the given filters through the
//! sync engine, and logs what it assembled. Useful for watching the engine
//! against live relays and for scraping its metrics.
//!
//! # Usage
//!
//! ```bash
//! # Three pages of notes from the default relays
//! hearthd
//!
//! # Long-form articles by one author, then keep listening
//! hearthd --kinds 30023 --authors <hex pubkey> --listen
//!
//! # Custom relays, bigger pages, metrics on another port
//! hearthd --relays wss://nos.lol,wss://relay.damus.io --page-size 100 --metrics-port 9191
//! ```
//!
//! # Shutdown
//!
//! Ctrl+C stops the feed, logs a summary and disconnects from every relay.

use anyhow::{Context, Result};
use clap::Parser;
use hearth_core::metrics::{init_metrics, start_metrics_server};
use hearth_core::{Filter, NostrVerifier};
use hearth_engine::{Engine, EngineConfig, Error, FeedItem, FeedOptions, NostrPool, TopicIndex};
use nostr_sdk::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Hearth feed daemon.
#[derive(Parser, Debug)]
#[command(name = "hearthd")]
#[command(about = "Page a Nostr feed through the hearth sync engine")]
#[command(version)]
struct Args {
    /// Relay URLs (comma-separated, overrides defaults)
    #[arg(long, value_delimiter = ',')]
    relays: Option<Vec<String>>,

    /// Event kinds to request (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "1")]
    kinds: Vec<u16>,

    /// Restrict to these authors (comma-separated hex pubkeys)
    #[arg(long, value_delimiter = ',')]
    authors: Vec<String>,

    /// Number of pages to load
    #[arg(long, default_value = "3")]
    pages: usize,

    /// Notes per page (defaults to HEARTH_FEED_PAGE_SIZE)
    #[arg(long)]
    page_size: Option<usize>,

    /// Keep listening for new notes after paging
    #[arg(long)]
    listen: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9091")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("hearth_engine=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Hearth feed daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
    if let Some(page_size) = args.page_size {
        config.feed_page_size = page_size;
    }
    let page_size = config.feed_page_size.max(1);

    let relays = args.relays.unwrap_or_else(|| {
        vec![
            "wss://relay.damus.io".to_string(),
            "wss://nos.lol".to_string(),
            "wss://relay.primal.net".to_string(),
            "wss://relay.nostr.band".to_string(),
        ]
    });

    tracing::info!("Configuration:");
    tracing::info!("  Relays: {}", relays.len());
    tracing::info!("  Kinds: {:?}", args.kinds);
    tracing::info!("  Authors: {}", args.authors.len());
    tracing::info!("  Pages: {} x {}", args.pages, page_size);
    tracing::info!("  Listen: {}", args.listen);

    let pool = NostrPool::new(Client::default());
    let engine = Engine::new(Arc::new(pool.clone()), Arc::new(NostrVerifier), config);
    let topics = engine.with_projections(TopicIndex::attach);
    engine.loader().open(&relays);

    let mut filter = Filter::new().kinds(args.kinds.iter().copied());
    if !args.authors.is_empty() {
        filter = filter.authors(args.authors.iter());
    }
    let mut opts = FeedOptions::new(relays, vec![filter]);
    opts.listen = args.listen;
    let feed = engine.feed(opts);

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    let stop_feed = feed.clone();

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
        stop_feed.stop();
    })
    .context("Failed to set Ctrl+C handler")?;

    for page in 1..=args.pages {
        match feed.load(page_size).await {
            Ok(()) => {}
            Err(Error::Stopped) => break,
            Err(e) => return Err(e).context("Feed load failed"),
        }
        tracing::info!(page, items = feed.items().len(), "Loaded page");
        if feed.is_exhausted() {
            tracing::info!("Every relay ran out of notes");
            break;
        }
    }

    if args.listen {
        tracing::info!("Listening for new notes...");
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let buffered = feed.buffered();
            if buffered > 0 {
                feed.load_buffer();
                tracing::info!(new = buffered, items = feed.items().len(), "Added new notes");
            }
        }
    }

    feed.stop();
    log_summary(&engine, &feed.items(), &topics.lock().topics());
    pool.shutdown().await;

    tracing::info!("Hearth feed daemon stopped");
    Ok(())
}

fn log_summary(engine: &Engine, items: &[FeedItem], topics: &[hearth_engine::TopicStats]) {
    let stats = engine.tracker().lock().stats();
    let replies: usize = items.iter().map(|item| item.replies.len()).sum();

    tracing::info!("Summary:");
    tracing::info!("  Feed items: {} ({} grouped replies)", items.len(), replies);
    tracing::info!("  Stored events: {}", engine.store().len());
    tracing::info!(
        "  Tracker: {} ids, {} deliveries, {} unwrapped",
        stats.ids,
        stats.deliveries,
        stats.unwrapped
    );

    for item in items.iter().take(10) {
        let when = chrono::DateTime::from_timestamp(item.event.created_at as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| item.event.created_at.to_string());
        let preview: String = item.event.content.chars().take(80).collect();
        tracing::info!(
            "  [{}] {}… {} (+{} replies)",
            when,
            &item.event.pubkey[..8.min(item.event.pubkey.len())],
            preview.replace('\n', " "),
            item.replies.len()
        );
    }

    for topic in topics.iter().take(5) {
        tracing::info!("  #{}: {} notes", topic.name, topic.count);
    }
}
