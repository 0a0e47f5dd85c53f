//! Feedsync Ingest - feed-to-store reconciliation

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use feedsync_common::logging::{init_logging, LogConfig, LogLevel};
use feedsync_ingest::config::{
    parse_delimiter, parse_field_list, Compression, PurgeComparison, RunMode, StoreBackend,
    SyncConfig,
};
use feedsync_ingest::store::{self, MemoryStore, RecordStore};
use feedsync_ingest::{feed, Reconciler, RunOutcome, RunSummary};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// Exit status when a run completed with errors and `--fail-on-partial` is set
const EXIT_PARTIAL: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "feedsync-ingest")]
#[command(author, version, about = "Reconcile a database table with a product feed")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one reconciliation
    Run(RunArgs),

    /// Validate configuration and print it as JSON
    CheckConfig(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Feed URL or local path
    #[arg(long)]
    feed_url: Option<String>,

    /// Feed compression (none, gzip)
    #[arg(long)]
    compression: Option<Compression>,

    /// Field delimiter (single character, or "tab")
    #[arg(long)]
    delimiter: Option<String>,

    /// Store backend (postgres, rest)
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Target table
    #[arg(short, long)]
    table: Option<String>,

    /// Feed column the unique key is copied from
    #[arg(long)]
    key_column: Option<String>,

    /// Comma-separated feed columns coerced to numbers
    #[arg(long)]
    numeric_fields: Option<String>,

    /// Records per upsert call
    #[arg(long)]
    batch_size: Option<usize>,

    /// Rows decoded per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Batches written concurrently
    #[arg(long)]
    concurrency: Option<usize>,

    /// replace_all, upsert_only or upsert_and_purge_stale
    #[arg(long)]
    mode: Option<RunMode>,

    /// Stale purge comparison (less_than, not_equal)
    #[arg(long)]
    purge_comparison: Option<PurgeComparison>,

    /// Fail the run on the first batch that cannot be written
    #[arg(long)]
    abort_on_write_error: bool,

    /// Exit with status 2 when the run completes with errors
    #[arg(long)]
    fail_on_partial: bool,

    /// Purge stale rows even when the feed produced no rows
    #[arg(long)]
    purge_on_empty: bool,

    /// Write to an in-memory store instead of the configured backend
    #[arg(long)]
    dry_run: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json_summary: bool,
}

impl RunArgs {
    /// Apply CLI overrides on top of the environment
    fn apply(&self, config: &mut SyncConfig) -> Result<()> {
        if let Some(url) = &self.feed_url {
            config.feed.url = url.clone();
        }
        if let Some(c) = self.compression {
            config.feed.compression = c;
        }
        if let Some(d) = &self.delimiter {
            config.feed.delimiter = parse_delimiter(d)?;
        }
        if let Some(n) = self.chunk_size {
            config.feed.chunk_size = n;
        }
        if let Some(b) = self.store {
            config.store.backend = b;
        }
        if let Some(t) = &self.table {
            config.store.table = t.clone();
        }
        if let Some(col) = &self.key_column {
            config.sync.key_source_column = col.clone();
        }
        if let Some(fields) = &self.numeric_fields {
            config.sync.numeric_fields = parse_field_list(fields);
        }
        if let Some(n) = self.batch_size {
            config.sync.batch_size = n;
        }
        if let Some(n) = self.concurrency {
            config.sync.write_concurrency = n;
        }
        if let Some(mode) = self.mode {
            config.sync.mode = mode;
        }
        if let Some(cmp) = self.purge_comparison {
            config.sync.purge_comparison = cmp;
        }
        config.sync.abort_on_write_error |= self.abort_on_write_error;
        config.sync.fail_on_partial |= self.fail_on_partial;
        config.sync.purge_on_empty |= self.purge_on_empty;
        Ok(())
    }

    fn load(&self) -> Result<SyncConfig> {
        let mut config = SyncConfig::from_env().context("Failed to load configuration")?;
        self.apply(&mut config)?;
        if self.dry_run {
            config.validate_pipeline()?;
        } else {
            config.validate()?;
        }
        Ok(config)
    }
}

fn exit_code(summary: &RunSummary, fail_on_partial: bool) -> i32 {
    match summary.outcome {
        RunOutcome::Success => 0,
        RunOutcome::CompletedWithErrors if fail_on_partial => EXIT_PARTIAL,
        RunOutcome::CompletedWithErrors => 0,
        RunOutcome::Failed => 1,
    }
}

async fn run(args: &RunArgs) -> Result<i32> {
    let config = args.load()?;
    let fail_on_partial = config.sync.fail_on_partial;

    let source = feed::source_for(&config.feed.url, config.feed.timeout())?;
    let store: Arc<dyn RecordStore> = if args.dry_run {
        info!("Dry run: writing to an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        store::connect(&config.store).await?
    };

    let summary = Reconciler::new(config, source, store).run().await;

    if args.json_summary {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(exit_code(&summary, fail_on_partial))
}

fn check_config(args: &RunArgs) -> Result<i32> {
    let config = args.load()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(0)
}

/// Apply `FEEDSYNC_LOG_*` overrides; an invalid value keeps `base` and is
/// reported on stderr since logging is not up yet
fn with_env_overrides(base: LogConfig) -> LogConfig {
    match base.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring logging environment overrides: {:#}", e);
            base
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("feedsync-ingest")
        .filter_directives("sqlx=warn,hyper=info,reqwest=info")
        .build();

    // Environment variables take precedence
    let log_config = with_env_overrides(log_config);

    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {}", e);
            process::exit(1);
        },
    };

    let result = match &cli.command {
        Command::Run(args) => run(args).await,
        Command::CheckConfig(args) => check_config(args),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        },
    };

    // flush the file appender before exiting
    drop(guard);
    process::exit(code);
}
