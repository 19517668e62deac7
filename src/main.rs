mod config;
mod db;
mod export;
mod lock;
mod monitor;
mod orchestrator;
mod page;
mod parser;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use config::Settings;
use db::{DeleteOutcome, Record, SaveOutcome, Store};
use monitor::ChangeMonitor;
use orchestrator::{ExtractionError, ExtractionStatus, Orchestrator, OrchestratorState};
use page::{FileSource, Page, PageSource};
use parser::classify::{ObjectKind, PageInfo};

#[derive(Parser)]
#[command(name = "crm_scraper", about = "Extract CRM records from Salesforce Lightning pages")]
struct Cli {
    /// SQLite store path (overrides CRM_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,
    /// Guard store writes with the advisory lock (overrides CRM_USE_LOCK)
    #[arg(long, global = true)]
    lock: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SourceArgs {
    /// Saved HTML snapshot of the page
    #[arg(long, required_unless_present = "fetch", conflicts_with = "fetch")]
    file: Option<PathBuf>,
    /// URL the snapshot was taken from
    #[arg(long, default_value = "")]
    url: String,
    /// Fetch the page over HTTP instead
    #[arg(long)]
    fetch: Option<String>,
}

impl SourceArgs {
    async fn resolve(self) -> anyhow::Result<Arc<dyn PageSource>> {
        let source: Arc<dyn PageSource> = match (self.file, self.fetch) {
            (_, Some(url)) => Arc::new(
                page::fetch(&url)
                    .await
                    .map_err(|e| ExtractionError::Unreachable(format!("{e:#}")))?,
            ),
            (Some(path), None) => Arc::new(FileSource::new(path, &self.url)),
            (None, None) => bail!("either --file or --fetch is required"),
        };
        Ok(source)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
}

impl From<ExportFormat> for export::Format {
    fn from(f: ExportFormat) -> Self {
        match f {
            ExportFormat::Csv => export::Format::Csv,
            ExportFormat::Json => export::Format::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Detect object and view kind, list referenced record ids
    Classify {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Extract records from one page and merge them into the store
    Extract {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Extract many saved snapshots (FILE or FILE=URL) in parallel
    Import {
        #[arg(required = true)]
        snapshots: Vec<String>,
    },
    /// Stored records of one kind
    List {
        kind: ObjectKind,
        /// Case-insensitive search across all fields
        #[arg(short, long)]
        search: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Dump one collection, or the whole store, as JSON
    Show { kind: Option<ObjectKind> },
    /// Delete one record by id
    Delete { kind: ObjectKind, id: String },
    /// Empty one collection, or everything with --all
    Clear {
        kind: Option<ObjectKind>,
        #[arg(long, conflicts_with = "kind")]
        all: bool,
    },
    /// Record counts per kind
    Stats,
    /// Write a collection to CSV or JSON
    Export {
        kind: ObjectKind,
        #[arg(short, long, value_enum, default_value = "csv")]
        format: ExportFormat,
        /// Output path (default: <kind>_export_<ms>.<ext>)
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[arg(short, long)]
        search: Option<String>,
    },
    /// Watch a page for record changes
    Watch {
        #[command(flatten)]
        source: SourceArgs,
        /// How often to re-read the page
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
        /// Run an extraction whenever the records region changes
        #[arg(long)]
        auto_extract: bool,
    },
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

    let mut settings = Settings::load()?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if cli.lock {
        settings.use_lock = true;
    }
    let store = Arc::new(Store::open(&settings.db_path)?);

    let result = match cli.command {
        Commands::Classify { source } => {
            let source = source.resolve().await?;
            let orch = Orchestrator::new(Arc::clone(&store), &settings);
            let info = orch.page_info(source.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            println!(
                "Extraction possible: {}",
                if info.is_extraction_possible() { "yes" } else { "no" }
            );
            Ok(())
        }
        Commands::Extract { source } => {
            let source = source.resolve().await?;
            let orch = Orchestrator::new(Arc::clone(&store), &settings);
            let status = orch.perform_extraction(source.as_ref()).await;
            match status {
                ExtractionStatus::Failed { message, .. } => Err(anyhow::anyhow!(message)),
                other => {
                    println!("{}", other.message());
                    Ok(())
                }
            }
        }
        Commands::Import { snapshots } => {
            let orch = Orchestrator::new(Arc::clone(&store), &settings);
            println!("Importing {} snapshots...", snapshots.len());
            let counts = import_snapshots(&orch, &snapshots).await?;
            counts.print();
            Ok(())
        }
        Commands::List {
            kind,
            search,
            limit,
        } => {
            let snap = store.collection(kind)?;
            let shown = export::filter(&snap.records, search.as_deref().unwrap_or(""));
            if shown.is_empty() {
                println!("No {} found.", kind);
                return Ok(());
            }

            println!(
                "{:>3} | {:<18} | {:<28} | {:<23} | {}",
                "#", "Id", "Name", "Updated", "Fields"
            );
            println!("{}", "-".repeat(136));
            for (i, r) in shown.iter().take(limit).enumerate() {
                println!(
                    "{:>3} | {:<18} | {:<28} | {:<23} | {}",
                    i + 1,
                    truncate(r.id().unwrap_or("-"), 18),
                    truncate(r.text(kind.primary_field()).unwrap_or("-"), 28),
                    r.last_updated().map(format_timestamp).unwrap_or_default(),
                    truncate(&summarize(r, kind), 56)
                );
            }

            println!(
                "\n{} of {} {} | last sync: {}",
                shown.len().min(limit),
                snap.records.len(),
                kind,
                snap.last_sync
                    .map(format_timestamp)
                    .unwrap_or_else(|| "never".into())
            );
            Ok(())
        }
        Commands::Show { kind } => {
            let out = match kind {
                Some(kind) => {
                    let snap = store.collection(kind)?;
                    json!({ "records": snap.records, "lastSyncTimestamp": snap.last_sync })
                }
                None => serde_json::to_value(store.document()?)?,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Commands::Delete { kind, id } => {
            match store.delete_record(kind, &id)? {
                DeleteOutcome::Deleted => println!("Deleted {} {}", kind, id),
                DeleteOutcome::NotFound => println!("Record {} not found in {}", id, kind),
            }
            Ok(())
        }
        Commands::Clear { kind, all } => match (kind, all) {
            (Some(kind), _) => {
                store.clear_kind(kind)?;
                println!("Cleared {}", kind);
                Ok(())
            }
            (None, true) => {
                store.clear_all()?;
                println!("Cleared all collections");
                Ok(())
            }
            (None, false) => Err(anyhow::anyhow!("Specify an object kind or --all")),
        },
        Commands::Stats => {
            let stats = store.stats()?;
            for (kind, count) in &stats.counts {
                let sync = store
                    .last_sync(*kind)?
                    .map(format_timestamp)
                    .unwrap_or_else(|| "never".into());
                println!("{:<14} {:>6}   last sync: {}", format!("{kind}:"), count, sync);
            }
            println!("{:<14} {:>6}", "Total:", stats.total);

            let opportunities = store.collection(ObjectKind::Opportunity)?.records;
            if !opportunities.is_empty() {
                println!("\n--- Pipeline ---");
                for s in export::stage_summary(&opportunities) {
                    println!("  {:<14} {:>4}   {:>14.2}", s.stage, s.count, s.amount);
                }
            }
            Ok(())
        }
        Commands::Export {
            kind,
            format,
            out,
            search,
        } => {
            let snap = store.collection(kind)?;
            let records: Vec<Record> =
                export::filter(&snap.records, search.as_deref().unwrap_or(""))
                    .into_iter()
                    .cloned()
                    .collect();
            let format = export::Format::from(format);
            let path = out.unwrap_or_else(|| {
                PathBuf::from(export::default_filename(
                    kind,
                    format,
                    chrono::Utc::now().timestamp_millis(),
                ))
            });
            export::write(&path, &records, format)?;
            println!("Exported {} {} to {}", records.len(), kind, path.display());
            Ok(())
        }
        Commands::Watch {
            source,
            interval_ms,
            auto_extract,
        } => {
            let source = source.resolve().await?;
            watch(
                Arc::clone(&store),
                &settings,
                source,
                Duration::from_millis(interval_ms),
                auto_extract,
            )
            .await
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

// ── Import ──

#[derive(Default)]
struct ImportCounts {
    saved: Vec<(ObjectKind, usize)>,
    empty: usize,
    failed: usize,
}

impl ImportCounts {
    fn add(&mut self, kind: ObjectKind, n: usize) {
        match self.saved.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, total)) => *total += n,
            None => self.saved.push((kind, n)),
        }
    }

    fn print(&self) {
        let saved: Vec<String> = self
            .saved
            .iter()
            .map(|(kind, n)| format!("{n} {kind}"))
            .collect();
        let saved = if saved.is_empty() {
            "nothing".to_string()
        } else {
            saved.join(", ")
        };
        println!(
            "Saved {}. {} pages without records, {} failed.",
            saved, self.empty, self.failed
        );
    }
}

/// `FILE` or `FILE=URL`.
fn split_snapshot_arg(arg: &str) -> (&str, &str) {
    arg.split_once('=').unwrap_or((arg, ""))
}

fn load_snapshot(arg: &str) -> anyhow::Result<(PageInfo, Vec<Record>)> {
    let (path, url) = split_snapshot_arg(arg);
    let html = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    parser::process_page(&Page::parse(url, &html))
}

async fn import_snapshots(orch: &Orchestrator, snapshots: &[String]) -> anyhow::Result<ImportCounts> {
    use indicatif::{ProgressBar, ProgressStyle};
    use rayon::prelude::*;

    let pb = ProgressBar::new(snapshots.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    let mut counts = ImportCounts::default();
    for chunk in snapshots.chunks(500) {
        let results: Vec<_> = chunk
            .par_iter()
            .map(|arg| (arg.as_str(), load_snapshot(arg)))
            .collect();

        for (arg, result) in results {
            match result {
                Ok((info, records)) => match orch.merge(info.object_kind, records).await? {
                    SaveOutcome::Saved { incoming, .. } => counts.add(info.object_kind, incoming),
                    SaveOutcome::NothingToSave => counts.empty += 1,
                },
                Err(e) => {
                    pb.suspend(|| warn!("Skipping {}: {e:#}", arg));
                    counts.failed += 1;
                }
            }
            pb.inc(1);
        }
    }

    pb.finish_and_clear();
    Ok(counts)
}

// ── Watch ──

async fn watch(
    store: Arc<Store>,
    settings: &Settings,
    source: Arc<dyn PageSource>,
    interval: Duration,
    auto_extract: bool,
) -> anyhow::Result<()> {
    let monitor = ChangeMonitor::start(settings.debounce());
    let mut changes = monitor.subscribe();
    let poller = tokio::spawn(monitor::poll_source(
        Arc::clone(&source),
        monitor.sender(),
        interval,
    ));

    let orch = Arc::new(Orchestrator::new(Arc::clone(&store), settings));
    let mut finished = orch.subscribe();
    let mut updates = store.subscribe();

    println!("Watching {} (Ctrl-C to stop)", source.describe());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.recv() => match changed {
                Ok(_) if auto_extract => match orch.state() {
                    OrchestratorState::Running => info!("Extraction in flight, skipping change"),
                    OrchestratorState::Idle => {
                        let ack = orch.trigger(Arc::clone(&source));
                        info!("{}", ack.message);
                    }
                },
                Ok(event) => println!("Records region changed at {}", format_timestamp(event.at)),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            done = finished.recv() => {
                match done {
                    Ok(status) if status.is_success() => println!("{}", status.message()),
                    Ok(status) => warn!("{}", status.message()),
                    Err(_) => {}
                }
            }
            update = updates.recv() => {
                if let Ok(update) = update {
                    println!("{} now holds {} records", update.kind, update.records.len());
                }
            }
        }
    }

    poller.abort();
    monitor.stop();
    Ok(())
}

// ── Formatting ──

/// Non-empty fields other than id, primary name and timestamps, as `key=value`.
fn summarize(record: &Record, kind: ObjectKind) -> String {
    record
        .fields()
        .filter(|(k, v)| {
            !v.is_null()
                && !matches!(k.as_str(), "id" | "extractedAt" | "lastUpdated")
                && k.as_str() != kind.primary_field()
        })
        .map(|(k, v)| match v.as_str() {
            Some(s) => format!("{k}={s}"),
            None => format!("{k}={v}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
