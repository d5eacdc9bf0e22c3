use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use siteindex_core::{Service, ServiceSelector};
use siteindex_sync::{
    current_stats, google_client, open_ledger, open_ledger_read_only, render_recent, render_stats,
    render_summary, run_once_with_config, IndexerConfig, RunOptions,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ServiceArg {
    Google,
    Bing,
    Both,
}

impl From<ServiceArg> for ServiceSelector {
    fn from(value: ServiceArg) -> Self {
        match value {
            ServiceArg::Google => ServiceSelector::Google,
            ServiceArg::Bing => ServiceSelector::Bing,
            ServiceArg::Both => ServiceSelector::Both,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "siteindex")]
#[command(about = "Submit site URLs to Google and IndexNow, tracking every submission")]
struct Cli {
    /// Which indexing service to submit to.
    #[arg(long, value_enum, default_value = "both")]
    service: ServiceArg,
    /// Submit every URL, ignoring the ledger.
    #[arg(long)]
    force: bool,
    /// Resubmit successful URLs last submitted at least this many days ago.
    #[arg(long, value_name = "DAYS")]
    reindex_after: Option<u32>,
    /// Report what would be submitted without calling any API or touching the ledger.
    #[arg(long)]
    dry_run: bool,
    /// Print ledger statistics before the run.
    #[arg(long)]
    stats: bool,
    /// List the N most recently submitted URLs and exit.
    #[arg(long, value_name = "N")]
    recent: Option<usize>,
    /// Wipe the ledger and exit.
    #[arg(long)]
    clear: bool,
    /// Print Google's notification metadata for a URL and exit.
    #[arg(long, value_name = "URL")]
    inspect: Option<String>,
    /// Ledger file to use instead of SITEINDEX_LEDGER_PATH.
    #[arg(long, value_name = "PATH")]
    ledger: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = IndexerConfig::from_env();
    init_tracing();
    if let Some(path) = cli.ledger.clone() {
        config.ledger_path = path;
    }
    let selector = ServiceSelector::from(cli.service);

    if cli.clear {
        let ledger = open_ledger(&config).await?;
        ledger.clear().await?;
        println!("ledger cleared: {}", ledger.path().display());
        return Ok(());
    }

    if let Some(limit) = cli.recent {
        let ledger = open_ledger_read_only(&config).await;
        let service = match selector {
            ServiceSelector::Google => Some(Service::Google),
            ServiceSelector::Bing => Some(Service::Bing),
            ServiceSelector::Both => None,
        };
        print!("{}", render_recent(&ledger.recent(service, limit).await));
        return Ok(());
    }

    if let Some(url) = cli.inspect.as_deref() {
        let client = google_client(&config)?;
        let metadata = client
            .url_metadata(url)
            .await
            .with_context(|| format!("fetching google metadata for {url}"))?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    if cli.stats {
        print!("{}", render_stats("Ledger before run", &current_stats(&config).await));
    }

    let options = RunOptions {
        selector,
        force: cli.force,
        reindex_after_days: cli.reindex_after,
        dry_run: cli.dry_run,
        show_stats: false,
    };
    let summary = run_once_with_config(&config, &options).await?;

    print!("{}", render_summary(&summary));
    if let Some(stats) = &summary.after_stats {
        print!("{}", render_stats("Ledger after run", stats));
    }

    Ok(())
}
