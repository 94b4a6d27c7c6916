//! # Datamart discoverer
//!
//! Runs the example discoverer against an in-process broker, with a local
//! profiler that materializes, indexes and announces what it records. Also
//! offers cache maintenance and dataset deletion.

mod example;
mod profiler;
mod stack;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use datamart_config::{ConfigLoad, ConfigLoader, logging, validation::validate};
use datamart_core::discovery::{QueryEvent, QuerySession};
use datamart_model::DatasetId;
use serde_json::{Value, json};
use tracing::info;

use crate::stack::Stack;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "datamart-discoverer")]
#[command(about = "Example Datamart discoverer with a local profiler")]
struct Cli {
    /// Discoverer identity (overrides config)
    #[arg(long, global = true)]
    identity: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the discoverer until interrupted (the default)
    Run {
        /// Exit once the batch routine is done and its datasets are profiled
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Broadcast a JSON query and print the events it produces
    Query {
        query: String,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Materialization cache maintenance
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Remove a dataset from the indexes, the cache and permanent storage
    Delete {
        /// Full dataset id, e.g. datamart.example.example_nyu
        dataset_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Print entry count and size
    Stats,
    /// Purge every entry, waiting for readers
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad {
        mut config,
        source,
        env_file_loaded,
    } = ConfigLoader::load_from_env().context("failed to load configuration")?;
    if let Some(identity) = cli.identity {
        config.identity = identity;
        validate(&config).context("invalid --identity")?;
    }

    logging::init();
    if env_file_loaded {
        info!("loaded .env file");
    }
    info!(?source, identity = %config.identity, "configuration loaded");

    let stack = Stack::open(config).await?;
    match cli.command.unwrap_or(Command::Run { once: false }) {
        Command::Run { once } => run(stack, once).await,
        Command::Query {
            query,
            timeout_secs,
        } => run_query(stack, &query, Duration::from_secs(timeout_secs)).await,
        Command::Cache(CacheCommand::Stats) => {
            let stats = stack.cache.stats().await?;
            println!(
                "{}",
                json!({"entries": stats.entries, "bytes": stats.bytes})
            );
            Ok(())
        }
        Command::Cache(CacheCommand::Clear) => {
            let purged = stack.cache.clear().await?;
            println!("{}", json!({"purged": purged}));
            Ok(())
        }
        Command::Delete { dataset_id } => {
            let id = DatasetId::from_full(dataset_id)?;
            let report = stack.bridge.delete_dataset(&id).await?;
            println!(
                "{}",
                json!({
                    "id": id.as_str(),
                    "search_document": report.search_document,
                    "similarity_sketch": report.similarity_sketch,
                    "cache_entries": report.cache_entries,
                    "stored_objects": report.stored_objects,
                })
            );
            Ok(())
        }
    }
}

async fn run(stack: Stack, once: bool) -> anyhow::Result<()> {
    let mut discoverer = stack.start_discoverer().await?;
    let profiler = stack.start_profiler();

    if once {
        discoverer.wait_batch().await;
        stack.profiling_settled().await;
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("interrupted");
    }

    discoverer.shutdown().await;
    profiler.abort();
    let stats = stack.cache.stats().await?;
    info!(
        entries = stats.entries,
        bytes = stats.bytes,
        indexed = stack.search.len().await,
        "stopped"
    );
    Ok(())
}

async fn run_query(stack: Stack, raw: &str, timeout: Duration) -> anyhow::Result<()> {
    let query: Value = serde_json::from_str(raw).context("query must be JSON")?;
    let discoverer = stack.start_discoverer().await?;
    let profiler = stack.start_profiler();

    let mut session = QuerySession::open(Arc::new(stack.broker.connect()), &query).await?;
    let idle = Duration::from_millis(500);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut done = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(idle, session.next_event()).await {
            Ok(Some(event)) => {
                let event = event?;
                done |= matches!(&event, QueryEvent::WorkDone(identity) if identity == stack.identity.as_str());
                println!("{}", render(&event));
            }
            Ok(None) => break,
            Err(_) if done => {
                stack.profiling_settled().await;
                if session_is_quiet(&mut session, idle).await? {
                    break;
                }
            }
            Err(_) => {}
        }
    }

    discoverer.shutdown().await;
    profiler.abort();
    Ok(())
}

/// Print anything still arriving; `true` once nothing came within `idle`.
async fn session_is_quiet(session: &mut QuerySession, idle: Duration) -> anyhow::Result<bool> {
    match tokio::time::timeout(idle, session.next_event()).await {
        Ok(Some(event)) => {
            println!("{}", render(&event?));
            Ok(false)
        }
        Ok(None) | Err(_) => Ok(true),
    }
}

fn render(event: &QueryEvent) -> Value {
    match event {
        QueryEvent::WorkStarted(identity) => json!({"work_started": identity}),
        QueryEvent::WorkDone(identity) => json!({"work_done": identity}),
        QueryEvent::Dataset(profiled) => json!({
            "id": profiled.id.as_str(),
            "metadata": profiled.metadata,
        }),
    }
}
