//! # chatshard CLI
//!
//! ## Usage
//!
//! ```bash
//! chatshard [--config chatshard.toml] [--log-level debug] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatshard export` | Export a JSON Lines chat log into a static bundle |
//! | `chatshard inspect <dir>` | Summarize a finalized bundle |
//! | `chatshard lookup <dir> <id>` | Find the shard holding a record id |
//!
//! ## Examples
//!
//! ```bash
//! # Export a group chat, copying media found under ./media
//! chatshard export --input chat.jsonl --out ./bundle --chat-id 42 \
//!     --chat-name "Team" --resource-root ./media
//!
//! # Stream records from another tool
//! fetch-chat 42 | chatshard export --input - --out ./bundle --chat-id 42
//!
//! # Re-hash every shard against the manifest
//! chatshard inspect ./bundle --verify
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use chatshard::config::{self, Config};
use chatshard::error::ExportError;
use chatshard::export::{AbortSignal, Exporter};
use chatshard::inspect;
use chatshard::models::{ChatInfo, ChatType};
use chatshard::progress::ProgressMode;
use chatshard::source::JsonlSource;

/// Exit status after an interrupted export.
const EXIT_ABORTED: i32 = 130;

/// chatshard: export very large chat logs into browsable static bundles.
///
/// All commands accept an optional `--config` TOML file. Without one,
/// built-in defaults are used; command-line flags override both.
#[derive(Parser)]
#[command(
    name = "chatshard",
    about = "Export very large chat logs into sharded, indexed static bundles",
    version
)]
struct Cli {
    /// Path to a configuration file (TOML). Optional.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides `[log] level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a chat log into a bundle directory.
    ///
    /// Reads one JSON record per line, writes bounded shards, per-shard
    /// Bloom filters, the record id index, copied resources and the
    /// manifest. Refuses to overwrite a finalized bundle unless `--force`.
    Export {
        /// JSON Lines input file, or `-` for stdin.
        #[arg(long, short)]
        input: PathBuf,

        /// Bundle output directory.
        #[arg(long, short)]
        out: PathBuf,

        #[arg(long)]
        chat_id: String,

        /// `group` or `friend`.
        #[arg(long, default_value = "group")]
        chat_type: ChatType,

        /// Display name for the chat.
        #[arg(long)]
        chat_name: Option<String>,

        /// Records per shard. Overrides `chunking.max_records_per_shard`.
        #[arg(long)]
        max_records: Option<usize>,

        /// Payload bytes per shard. Overrides `chunking.max_shard_bytes`.
        #[arg(long)]
        max_bytes: Option<u64>,

        /// Identifier index bucket count. Overrides `index.bucket_count`.
        #[arg(long)]
        buckets: Option<u32>,

        /// Directory searched for media by file name. Repeatable; added to
        /// `resources.roots`.
        #[arg(long = "resource-root")]
        resource_roots: Vec<PathBuf>,

        /// Count resource references but do not copy them.
        #[arg(long)]
        no_resources: bool,

        /// Only export records at or after this time: Unix seconds,
        /// RFC 3339, or `YYYY-MM-DD` (UTC midnight).
        #[arg(long, value_parser = parse_time)]
        since: Option<i64>,

        /// Only export records at or before this time. Same formats as
        /// `--since`; a bare date means the end of that day.
        #[arg(long, value_parser = parse_time_end)]
        until: Option<i64>,

        /// Stop after exporting this many records.
        #[arg(long)]
        max_count: Option<u64>,

        /// Replace an existing finalized bundle.
        #[arg(long)]
        force: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print a summary of a finalized bundle.
    Inspect {
        dir: PathBuf,

        /// Re-hash every shard file and compare with the manifest.
        #[arg(long)]
        verify: bool,
    },

    /// Resolve a record id to its shard through the identifier index.
    Lookup { dir: PathBuf, id: String },
}

fn parse_time(s: &str) -> Result<i64, String> {
    parse_time_with(s, chrono::NaiveTime::MIN)
}

fn parse_time_end(s: &str) -> Result<i64, String> {
    let end_of_day = chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(chrono::NaiveTime::MIN);
    parse_time_with(s, end_of_day)
}

fn parse_time_with(s: &str, date_time_of_day: chrono::NaiveTime) -> Result<i64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|date| date.and_time(date_time_of_day).and_utc().timestamp())
        .map_err(|_| format!("'{}' is not Unix seconds, RFC 3339 or YYYY-MM-DD", s))
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) {
    // Priority: --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => s.parse::<tracing::Level>().unwrap_or_else(|_| {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }),
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
    debug!(?level, "logging initialized");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    setup_logging(cli.log_level.as_deref(), cfg.log.level.as_deref());

    match cli.command {
        Commands::Export {
            input,
            out,
            chat_id,
            chat_type,
            chat_name,
            max_records,
            max_bytes,
            buckets,
            resource_roots,
            no_resources,
            since,
            until,
            max_count,
            force,
            progress,
        } => {
            let mut cfg = cfg;
            if let Some(n) = max_records {
                cfg.chunking.max_records_per_shard = n;
            }
            if let Some(n) = max_bytes {
                cfg.chunking.max_shard_bytes = n;
            }
            if let Some(n) = buckets {
                cfg.index.bucket_count = n;
            }
            cfg.resources.roots.extend(resource_roots);
            if no_resources {
                cfg.resources.enabled = false;
            }
            if since.is_some() {
                cfg.filter.since = since;
            }
            if until.is_some() {
                cfg.filter.until = until;
            }
            if max_count.is_some() {
                cfg.filter.max_count = max_count;
            }
            cfg.validate().context("Invalid export settings")?;

            let chat = ChatInfo {
                chat_type,
                chat_id,
                name: chat_name,
            };
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_export(cfg, &input, &out, chat, force, progress).await?;
        }
        Commands::Inspect { dir, verify } => {
            inspect::run_inspect(&dir, verify).await?;
        }
        Commands::Lookup { dir, id } => {
            inspect::run_lookup(&dir, &id).await?;
        }
    }

    Ok(())
}

async fn run_export(
    cfg: Config,
    input: &std::path::Path,
    out: &std::path::Path,
    chat: ChatInfo,
    force: bool,
    progress: ProgressMode,
) -> Result<()> {
    let mut source = JsonlSource::open(input)
        .await
        .with_context(|| format!("Failed to open input: {}", input.display()))?;

    let abort = AbortSignal::new();
    let exporter = Exporter::new(cfg)
        .with_progress(progress.reporter())
        .with_abort(abort.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next record boundary");
            abort.abort();
        }
    });

    match exporter.run(&mut source, out, chat, force).await {
        Ok(manifest) => {
            let stats = &manifest.stats;
            println!("export {}", out.display());
            println!("  records: {}", stats.records);
            if stats.filtered_out > 0 {
                println!("  filtered out: {}", stats.filtered_out);
            }
            println!("  shards: {}", stats.shard_count);
            println!("  indexed ids: {}", stats.indexed_ids);
            println!(
                "  resources: {} copied, {} already present, {} faults",
                stats.resources.copied, stats.resources.skipped_existing, stats.resources.faults
            );
            println!("ok");
            info!(export_id = %manifest.export_id, "bundle finalized");
            Ok(())
        }
        Err(ExportError::Aborted) => {
            eprintln!("export aborted; bundle at {} is incomplete", out.display());
            std::process::exit(EXIT_ABORTED);
        }
        Err(e) => Err(e.into()),
    }
}
