mod discover;
mod fetch;
mod harvest;
mod markup;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fetch::{RetryPolicy, WikiClient, DEFAULT_BASE_URL};

#[derive(Parser)]
#[command(name = "gmod_scraper", about = "GMod wiki API documentation scraper")]
struct Cli {
    /// Wiki root URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Max attempts per fetch before a failure becomes fatal
    #[arg(long, default_value_t = 100)]
    retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover all entities and harvest every page into one JSON array
    Run {
        /// Output file path
        #[arg(short, long, default_value = "dist/functions.json")]
        out: PathBuf,
        /// Max in-flight page fetches
        #[arg(short, long, default_value_t = harvest::DEFAULT_CONCURRENCY)]
        concurrency: usize,
        /// Harvest only the first N discovered entities
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Skip entities that still fail after retries instead of aborting
        #[arg(long)]
        keep_going: bool,
    },
    /// Walk the index page and print the catalog without harvesting
    Discover,
    /// Fetch and parse a single page, pretty-printing the parsed record
    Page {
        /// Relative page link, e.g. /gmod/Global.print
        link: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let retry = RetryPolicy {
        max_attempts: cli.retries,
        ..Default::default()
    };
    let client = WikiClient::new(&cli.base_url, retry)?;

    println!("Started {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

    let result = match cli.command {
        Commands::Run {
            out,
            concurrency,
            limit,
            keep_going,
        } => run_pipeline(client, &out, concurrency, limit, keep_going).await,
        Commands::Discover => print_catalog(&client).await,
        Commands::Page { link } => inspect_page(&client, &link).await,
    };

    println!(
        "Finished {} ({:.1}s)",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        t0.elapsed().as_secs_f64()
    );

    result
}

/// Full pipeline: open the artifact, discover, harvest, close the array.
/// Any fatal error propagates without the close token being written, leaving
/// a valid JSON-array prefix on disk for inspection.
async fn run_pipeline(
    client: WikiClient,
    out_path: &Path,
    concurrency: usize,
    limit: Option<usize>,
    keep_going: bool,
) -> Result<()> {
    if let Some(dir) = out_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }
    let mut out = File::create(out_path)
        .with_context(|| format!("Failed to open {}", out_path.display()))?;
    out.write_all(b"[\n")?;

    // If discovery fails here the artifact is still an empty-array prefix.
    let client = Arc::new(client);
    let mut entities = discover::discover(&client).await?;
    if let Some(limit) = limit {
        entities.truncate(limit);
    }
    println!("Harvesting {} entities...", entities.len());

    let opts = harvest::HarvestOptions {
        concurrency,
        keep_going,
    };
    let stats = harvest::harvest_streaming(client, entities, &mut out, &opts).await?;

    out.write_all(b"\n]")?;
    println!(
        "Wrote {} records to {} ({} skipped).",
        stats.written,
        out_path.display(),
        stats.skipped
    );
    Ok(())
}

async fn print_catalog(client: &WikiClient) -> Result<()> {
    let entities = discover::discover(client).await?;

    println!(
        "{:>4} | {:<36} | {:<8} | {:<20} | Link",
        "#", "Name", "Kind", "Realms"
    );
    println!("{}", "-".repeat(100));

    for (i, e) in entities.iter().enumerate() {
        let realms = e
            .realms
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:>4} | {:<36} | {:<8} | {:<20} | {}",
            i + 1,
            truncate(&e.name, 36),
            e.kind.to_string(),
            realms,
            e.link
        );
    }

    println!("\n{} entities", entities.len());
    Ok(())
}

async fn inspect_page(client: &WikiClient, link: &str) -> Result<()> {
    let raw = client.fetch_page_source(link).await?;
    let parsed = markup::parse_page(&raw)?;
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}
