use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kulturkal_pipeline::{build_scheduler, CrawlConfig, CrawlPipeline};
use kulturkal_store::EventStore;
use kulturkal_web::SiteConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kulturkal")]
#[command(about = "Kulturkal event aggregation crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one crawl cycle: scrape, dedup, persist, archive.
    Crawl {
        /// Process everything but skip the store commit.
        #[arg(long)]
        dry_run: bool,
        /// Comma-separated source ids; all enabled sources otherwise.
        #[arg(long)]
        only: Option<String>,
    },
    /// Serve the calendar, archive and feeds over HTTP.
    Serve {
        #[arg(long, env = "KULTURKAL_WEB_PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Write the calendar and feeds as static files.
    Render,
    /// Show recent crawl cycles.
    Status,
}

fn site_config(config: &CrawlConfig) -> SiteConfig {
    SiteConfig {
        title: std::env::var("KULTURKAL_SITE_TITLE")
            .unwrap_or_else(|_| "Kulturkalenderen".to_string()),
        base_url: std::env::var("KULTURKAL_BASE_URL")
            .unwrap_or_else(|_| "https://kulturkal.no".to_string()),
        timezone: config.timezone,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = CrawlConfig::from_env();

    match cli.command.unwrap_or(Commands::Crawl {
        dry_run: false,
        only: None,
    }) {
        Commands::Crawl { dry_run, only } => {
            let pipeline = CrawlPipeline::new(config).await?;
            let only: Option<Vec<String>> = only.map(|list| {
                list.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            });
            let summary = pipeline.run_once(dry_run, only.as_deref()).await?;
            println!(
                "crawl complete: run_id={} sources={}/{} fetched={} new={} merged={} dropped={} archived={}{}",
                summary.run_id,
                summary.counters.sources_succeeded,
                summary.counters.sources_attempted,
                summary.counters.fetched,
                summary.counters.new,
                summary.counters.merged,
                summary.counters.dropped,
                summary.counters.archived,
                if summary.dry_run { " (dry run)" } else { "" },
            );
        }
        Commands::Serve { port } => {
            let site = site_config(&config);
            let pipeline = Arc::new(CrawlPipeline::new(config).await?);
            if let Some(mut scheduler) = build_scheduler(pipeline.clone()).await? {
                scheduler.start().await?;
                info!("crawl scheduler running");
            }
            kulturkal_web::serve(pipeline.store().clone(), site, port).await?;
        }
        Commands::Render => {
            let site = site_config(&config);
            let store = EventStore::connect(&config.database_url).await?;
            let files = kulturkal_web::export_static(&store, &site, &config.output_dir).await?;
            println!(
                "rendered {} files to {}",
                files.len(),
                config.output_dir.display()
            );
        }
        Commands::Status => {
            let store = EventStore::connect(&config.database_url).await?;
            let cycles = store.recent_cycles(10).await?;
            if cycles.is_empty() {
                println!("no crawl cycles recorded yet");
            }
            for cycle in cycles {
                println!(
                    "{}  {}  fetched={} new={} merged={} dropped={} archived={}",
                    cycle.started_at.format("%Y-%m-%d %H:%M"),
                    cycle.run_id,
                    cycle.counters.fetched,
                    cycle.counters.new,
                    cycle.counters.merged,
                    cycle.counters.dropped,
                    cycle.counters.archived,
                );
            }
        }
    }

    Ok(())
}
