//! Fetches hub listings from the live site and prints what the scheduler would see.
//! Nothing is sent and the ledger is not touched.

use chrono::Utc;
use clap::Parser;
use std::collections::BTreeSet;
use std::sync::Arc;

use hubcast::engine::IngestionEngine;
use hubcast::hubs::{HubCatalog, HubId};
use hubcast::ingestion::HabrFetcher;
use hubcast::storage::{MemoryLedger, MemorySubscriptionStore};

#[derive(Parser, Debug)]
#[command(name = "probe_hubs", about = "Print recent articles of Habr hubs")]
struct Args {
    /// Hub ids to probe (default: linux, devops)
    hubs: Vec<String>,

    /// Lookback in hours (clamped to 1..=24)
    #[arg(long, default_value_t = 3)]
    hours: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let selection: BTreeSet<HubId> = if args.hubs.is_empty() {
        ["linux", "devops"].into_iter().map(HubId::from).collect()
    } else {
        args.hubs.iter().map(|h| HubId::new(h.as_str())).collect()
    };

    let catalog = Arc::new(HubCatalog::habr());
    let fetcher = HabrFetcher::from_config(&common::FetcherConfig::default())?;
    let engine = IngestionEngine::new(
        catalog.clone(),
        Arc::new(fetcher),
        Arc::new(PrintOnly),
        Arc::new(MemoryLedger::new()),
        Arc::new(MemorySubscriptionStore::new(catalog.clone())),
    );

    let digest = engine.run_manual_query(&selection, Some(args.hours), Utc::now()).await?;

    println!("\n{}", "=".repeat(60));
    println!(
        "Window {} .. {} ({} articles)",
        digest.window.start, digest.window.end, digest.articles.len()
    );
    println!("{}", "=".repeat(60));
    for article in &digest.articles {
        println!(
            "{}  [{}] {}\n    {}",
            article.published_at.with_timezone(&hubcast::scraping::SITE_TIMEZONE).format("%d.%m %H:%M"),
            catalog.display_name(&article.hub),
            article.title,
            article.url
        );
    }
    for failure in &digest.failed_hubs {
        println!("✗ {}: {}", failure.hub, failure.reason);
    }
    Ok(())
}

/// Manual queries never dispatch; the engine still needs a transport.
struct PrintOnly;

#[async_trait::async_trait]
impl hubcast::delivery::Dispatcher for PrintOnly {
    async fn send(
        &self,
        chat: hubcast::model::ChatId,
        article: &hubcast::model::Article,
    ) -> hubcast::delivery::DispatchOutcome {
        println!("would send {} to {}", article.id, chat);
        hubcast::delivery::DispatchOutcome::Accepted
    }
}
