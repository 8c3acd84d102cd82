use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use followgraph_common::{normalize_handle, parse_api_timestamp, Config, ScrapeRequest};
use followgraph_scout::pipeline::{Pipeline, PipelineDeps, PipelineSettings};
use followgraph_store::PgStore;
use x_api_client::XClient;

#[derive(Parser)]
#[command(name = "followgraph-scout", about = "Harvest profiles, follow graphs and posts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest the given accounts, then exit once the pipeline drains.
    Run {
        /// Handles to harvest (with or without a leading @).
        #[arg(value_parser = parse_handle)]
        handles: Vec<String>,

        /// JSON-lines file of scrape requests, harvested after `handles`.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Harvest followers and followees of each handle.
        #[arg(long)]
        connections: bool,

        /// Harvest each handle's timeline.
        #[arg(long)]
        content: bool,

        /// Oldest post date to harvest (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Seconds between status lines. 0 disables them.
        #[arg(long, default_value_t = 60)]
        status_every: u64,
    },
    /// Apply database migrations and exit.
    Migrate,
}

fn parse_handle(raw: &str) -> Result<String, String> {
    normalize_handle(raw).map_err(|e| e.to_string())
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_api_timestamp(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("followgraph=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_redacted();

    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    store.migrate().await.context("running migrations")?;

    match cli.command {
        Command::Migrate => {
            info!("Migrations applied");
            Ok(())
        }
        Command::Run {
            handles,
            file,
            connections,
            content,
            since,
            status_every,
        } => {
            let mut requests: Vec<ScrapeRequest> = handles
                .iter()
                .map(|h| {
                    let mut req = ScrapeRequest::new(h);
                    if connections {
                        req = req.with_connections();
                    }
                    if content {
                        req = req.with_content(since);
                    }
                    req
                })
                .collect();
            if let Some(path) = file {
                requests.extend(read_requests(&path).await?);
            }
            run(&config, store, requests, status_every).await
        }
    }
}

/// Parse a JSON-lines request file. Malformed lines are logged and skipped.
async fn read_requests(path: &Path) -> Result<Vec<ScrapeRequest>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut requests = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<ScrapeRequest>(line) {
            Ok(mut req) => match normalize_handle(&req.handle) {
                Ok(handle) => {
                    req.handle = handle;
                    requests.push(req);
                }
                Err(e) => warn!(file = %path.display(), line = n + 1, error = %e, "Skipping request"),
            },
            Err(e) => warn!(file = %path.display(), line = n + 1, error = %e, "Skipping malformed request"),
        }
    }
    info!(file = %path.display(), count = requests.len(), "Loaded requests");
    Ok(requests)
}

async fn run(
    config: &Config,
    store: PgStore,
    requests: Vec<ScrapeRequest>,
    status_every: u64,
) -> Result<()> {
    let lookups = XClient::new(config.followers_bearer_token.clone());
    let deps = PipelineDeps {
        source: Arc::new(lookups.clone()),
        followers_source: Arc::new(lookups),
        following_source: Arc::new(XClient::new(config.following_bearer_token.clone())),
        repo: Arc::new(store),
    };
    let pipeline = Pipeline::start(deps, PipelineSettings::from_config(config));

    let ticker = (status_every > 0).then(|| {
        let board = pipeline.status_board();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(status_every));
            loop {
                interval.tick().await;
                let status = board.snapshot();
                info!(busy = status.busy(), %status, "Pipeline status");
            }
        })
    });

    let replayed = pipeline.replay_backlog().await?;
    let submitted = requests.len();
    for request in requests {
        pipeline.submit(request).await?;
    }
    info!(replayed, submitted, "All requests queued, waiting for the pipeline to drain");

    let result = pipeline.shutdown().await;
    if let Some(ticker) = ticker {
        ticker.abort();
    }
    let status = result?;
    info!(%status, "Scout finished");
    Ok(())
}
