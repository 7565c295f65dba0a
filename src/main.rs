mod config;
mod error;
mod fetch;
mod lock;
mod parser;
mod pipeline;
mod record;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Settings;
use crate::fetch::HttpFetcher;
use crate::parser::derive;
use crate::pipeline::Harvester;
use crate::record::JobKey;

#[derive(Parser)]
#[command(name = "job_harvest", about = "Contract job posting harvester")]
struct Cli {
    /// Settings file (default: ./harvest.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new postings once and append them to the store
    Run {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run repeatedly until interrupted
    Watch {
        /// Seconds between runs (default: interval_secs from settings)
        #[arg(long)]
        every: Option<u64>,
    },
    /// List keys on the listing page and whether they are stored
    Keys,
    /// Fetch one detail page and print its record without storing it
    Extract { key: String },
    /// Stored jobs table
    Show {
        /// Max rows to display (most recent)
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    let result = match cli.command {
        Commands::Run { json } => {
            let harvester = harvester(&settings)?;
            let summary = tokio::select! {
                summary = harvester.run() => summary,
                _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted, run abandoned"),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary);
                for s in &summary.skipped {
                    println!("  skipped {}: {}", s.key, s.reason);
                }
            }
            if summary.is_failure() {
                anyhow::bail!("{}", summary);
            }
            Ok(())
        }
        Commands::Watch { every } => {
            let harvester = harvester(&settings)?;
            let every = Duration::from_secs(every.unwrap_or(settings.interval_secs));
            info!("Running every {}", format_duration(every));

            let interrupted = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            let runs = harvester
                .watch(every, interrupted, |summary| println!("{}", summary))
                .await;
            info!("Interrupted after {} runs, stopping", runs);
            Ok(())
        }
        Commands::Keys => {
            let harvester = harvester(&settings)?;
            let existing = harvester
                .store()
                .existing_keys()
                .context("failed to read stored keys")?;
            let candidates = harvester.discover().await?;
            if candidates.is_empty() {
                println!("No matching postings on the listing page.");
                return Ok(());
            }
            let mut fresh = 0;
            for key in &candidates {
                let known = existing.contains(key);
                if !known {
                    fresh += 1;
                }
                println!("{:<16} {}", key, if known { "stored" } else { "new" });
            }
            println!("\n{} candidates, {} new", candidates.len(), fresh);
            Ok(())
        }
        Commands::Extract { key } => {
            let harvester = harvester(&settings)?;
            let key = JobKey::new(key);
            let record = harvester
                .extract_one(&key)
                .await
                .with_context(|| format!("failed to extract job {}", key))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::Show { limit } => {
            let store = store::SheetStore::from_settings(&settings);
            let rows = store.records().context("failed to read store")?;
            if rows.is_empty() {
                println!("No jobs stored. Run 'run' first.");
                return Ok(());
            }

            println!(
                "{:>4} | {:<10} | {:<6} | {:<8} | {:<10} | {:<10} | {:<28}",
                "#", "Key", "Title", "Bid Ref", "Start", "End", "B/D"
            );
            println!("{}", "-".repeat(92));

            let skip = rows.len().saturating_sub(limit);
            for (i, r) in rows.iter().enumerate().skip(skip) {
                let cell = |name: &str| r.get(name).unwrap_or("-");
                println!(
                    "{:>4} | {:<10} | {:<6} | {:<8} | {:<10} | {:<10} | {:<28}",
                    i + 1,
                    truncate(cell(&settings.key_field), 10),
                    truncate(cell(derive::TITLE), 6),
                    truncate(cell(derive::BID_REF), 8),
                    truncate(cell(derive::CONTRACT_START), 10),
                    truncate(cell(derive::CONTRACT_END), 10),
                    truncate(cell(derive::BD), 28),
                );
            }

            println!("\n{} of {} jobs | {:?}", rows.len() - skip, rows.len(), store.path());
            Ok(())
        }
        Commands::Stats => {
            let store = store::SheetStore::from_settings(&settings);
            match store.info().context("failed to read store")? {
                None => println!("Store {:?} has no '{}' sheet yet.", store.path(), settings.sheet_name),
                Some(info) => {
                    println!("Store:   {:?}", store.path());
                    println!("Sheet:   {}", settings.sheet_name);
                    println!("Jobs:    {}", info.rows);
                    println!("Columns: {}", info.columns.len());
                    for c in &info.columns {
                        println!("  {}", c);
                    }
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn harvester(settings: &Settings) -> anyhow::Result<Harvester> {
    let fetcher = HttpFetcher::new(settings).context("failed to build HTTP client")?;
    Ok(Harvester::new(settings.clone(), Arc::new(fetcher))?)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
