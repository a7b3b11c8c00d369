use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use encore_adapters::{FixtureSource, ListingSource, RunContext};
use encore_sync::{build_scheduler, Pipeline, WatchConfig};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "encore")]
#[command(about = "Last-minute show ticket deal watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One-time console report: fetch and normalize, no diff, no persist.
    Check,
    /// One full pipeline run (diff + notify + persist), for external cron.
    Run,
    /// Keep running on the built-in cron schedule until interrupted.
    Watch,
}

fn listing_source(config: &WatchConfig) -> FixtureSource {
    FixtureSource::new(config.capture_bundle.clone())
        .with_expected_location(config.location_slug())
}

async fn check(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    let source = listing_source(config);
    let ctx = RunContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    };
    let (raws, listings) = pipeline.collect_listings(&source, &ctx).await?;

    println!(
        "{} listings scraped for {}, {} kept after filtering (next {} days):\n",
        raws.len(),
        config.location,
        listings.len(),
        config.days_ahead
    );
    for (i, listing) in listings.iter().enumerate() {
        println!("{}. {} ({})", i + 1, listing.title, listing.price);
        println!("   {} — {} {}", listing.venue, listing.date, listing.time);
        if listing.prices.len() > 1 {
            println!("   prices: {}", listing.prices.join(", "));
        }
        println!("   {}\n", listing.url);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();
    let pipeline = Pipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            check(&pipeline).await?;
        }
        Commands::Run => {
            let source = listing_source(pipeline.config());
            let summary = pipeline.run_once(&source).await?;
            println!(
                "run complete: run_id={} kept={} new={} drops={} batches_sent={} batches_failed={}",
                summary.run_id,
                summary.kept,
                summary.new_deals,
                summary.price_drops,
                summary.batches_sent,
                summary.batches_failed
            );
        }
        Commands::Watch => {
            let cron = pipeline.config().watch_cron.clone();
            let source: Arc<dyn ListingSource> = Arc::new(listing_source(pipeline.config()));
            let mut scheduler = build_scheduler(Arc::new(pipeline), source).await?;
            scheduler.start().await?;
            info!(%cron, "watching on built-in schedule, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}
