use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pubmed_research_mcp::client::RequestIntervals;
use pubmed_research_mcp::{ApiKeyPool, Config, PubMedClient};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "pubmed-research-mcp",
    version,
    about = "Credential-pooled, rate-governed and cached PubMed access"
)]
struct Cli {
    /// Configuration file (defaults to ./pubmed-mcp.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log filter
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for articles
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        max_results: u32,
        /// Only articles published in the last N days (0 = no filter)
        #[arg(short, long, default_value_t = 0)]
        days_back: u32,
        /// relevance or date
        #[arg(short, long, default_value = "relevance")]
        sort: String,
    },
    /// Fetch article details by PubMed id
    Details {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show credential pool status
    Status,
    /// Inspect or maintain the caches
    Cache {
        #[arg(value_enum, default_value_t = CacheAction::Stats)]
        action: CacheAction,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CacheAction {
    Stats,
    /// Drop all in-memory search results
    Clear,
    /// Drop expired in-memory search results
    Clean,
    /// Delete expired cache files
    CleanFiles,
    /// Delete every cache file
    ClearFiles,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    pubmed_research_mcp::logging::init(&config.logging)?;

    info!("Starting pubmed-research-mcp v{}", env!("CARGO_PKG_VERSION"));

    let pool = ApiKeyPool::load(&config.credentials_dir)
        .with_intervals(RequestIntervals::from(&config.rate_limiting));
    let client = PubMedClient::new(&config, Arc::new(pool))
        .await
        .context("Failed to create PubMed client")?;

    match cli.command {
        Command::Search {
            query,
            max_results,
            days_back,
            sort,
        } => {
            let result = client.search(&query, max_results, days_back, &sort).await?;
            print_json(&result)
        }
        Command::Details { ids } => {
            let articles = client.fetch_article_details(&ids).await?;
            print_json(&articles)
        }
        Command::Status => print_json(&client.pool_status()),
        Command::Cache { action } => match action {
            CacheAction::Stats => print_json(&client.cache_stats().await),
            CacheAction::Clear => print_json(&json!({ "cleared": client.clear_memory() })),
            CacheAction::Clean => print_json(&json!({ "cleaned": client.clean_memory() })),
            CacheAction::CleanFiles => print_json(&json!({ "cleaned": client.clean_files().await })),
            CacheAction::ClearFiles => print_json(&json!({ "cleared": client.clear_files().await })),
        },
    }
}
