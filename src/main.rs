use anyhow::{bail, Context, Result};
use caseingest::config::{self, IngestConfig};
use caseingest::ingest::embed::OpenAiEmbedder;
use caseingest::ingest::kv::{KeyValueStore, SqliteKvStore};
use caseingest::ingest::ledger::ReprocessLedger;
use caseingest::ingest::raster::default_rasterizer;
use caseingest::ingest::schema::{element_key, page_key};
use caseingest::ingest::storage::{ArtifactPaths, WorkStorage};
use caseingest::ingest::tracker::ChangeTracker;
use caseingest::ingest::vision::OpenAiVisionClient;
use caseingest::pipeline::{Pipeline, RunStatus, Services};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Incremental ingestion of scanned tender cases.
#[derive(Debug, Parser)]
#[command(name = "caseingest", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(global = true, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the next case from the repository.
    Run {
        /// Print Prometheus metrics after the run.
        #[arg(long)]
        metrics: bool,
    },
    /// Show tracked files and unresolved reprocess entries.
    Status {
        #[arg(long)]
        case: Option<String>,
    },
    /// Put every ERROR file of a case back to NEW.
    Requeue {
        #[arg(long)]
        case: String,
    },
    /// Print the config file JSON schema.
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Schema => {
            println!("{}", config::schema_json()?);
            Ok(())
        }
        Commands::Run { metrics } => {
            let config = load_config(&cli.config)?;
            run(&config, metrics).await
        }
        Commands::Status { case } => {
            let config = load_config(&cli.config)?;
            status(&config, case.as_deref()).await
        }
        Commands::Requeue { case } => {
            let config = load_config(&cli.config)?;
            let tracker = open_tracker(&config)?;
            let count = tracker.requeue_failed(&case)?;
            println!("requeued {count} file(s) in case {case}");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("caseingest=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Option<PathBuf>) -> Result<IngestConfig> {
    IngestConfig::load(path.as_deref()).context("failed to load configuration")
}

fn open_tracker(config: &IngestConfig) -> Result<ChangeTracker> {
    let path = config.database_path();
    ChangeTracker::open(&path).with_context(|| format!("failed to open ledger {}", path.display()))
}

fn open_store(config: &IngestConfig) -> Result<SqliteKvStore> {
    let path = config.kv_database_path();
    SqliteKvStore::open(&path)
        .with_context(|| format!("failed to open key-value store {}", path.display()))
}

async fn run(config: &IngestConfig, print_metrics: bool) -> Result<()> {
    let api_key = config.api_key()?;
    let openai = &config.openai;

    let services = Services {
        rasterizer: default_rasterizer(
            config.pipeline.pdfium_library.clone(),
            config.pipeline.render_width,
        )
        .map_err(|e| anyhow::anyhow!("failed to set up page rasterizer: {e}"))?,
        vision: Arc::new(
            OpenAiVisionClient::new(api_key, &openai.base_url, &openai.vision_model, openai.vision_timeout())
                .context("failed to build vision client")?,
        ),
        embedder: Arc::new(
            OpenAiEmbedder::new(
                api_key,
                &openai.base_url,
                &openai.embedding_model,
                openai.embedding_dimensions,
                openai.embedding_timeout(),
            )
            .context("failed to build embedding client")?,
        ),
    };

    let pipeline = Pipeline::new(config, services)?;
    let state = pipeline.run().await;

    println!("{}", serde_json::to_string_pretty(&state)?);
    if print_metrics {
        print!("{}", pipeline.metrics().render()?);
    }

    match state.status {
        RunStatus::Failed => bail!(
            "run failed at stage {}: {}",
            state.error_stage.map_or("unknown", |s| s.as_str()),
            state.error.as_deref().unwrap_or("unknown error")
        ),
        RunStatus::Ok | RunStatus::Empty | RunStatus::Running => Ok(()),
    }
}

async fn status(config: &IngestConfig, case: Option<&str>) -> Result<()> {
    let tracker = open_tracker(config)?;
    let store = open_store(config)?;
    let storage = WorkStorage::new(&config.storage);

    let records = tracker.list(case)?;
    if records.is_empty() {
        println!("no tracked files");
        return Ok(());
    }

    for record in &records {
        println!(
            "{:<10} {:<36} {}/{}{}",
            record.status.as_str(),
            record.id,
            record.case_id,
            record.filename,
            record
                .error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );

        let dir = storage.document_dir(&record.case_id, &record.filename);
        let ledger = ReprocessLedger::new(ArtifactPaths::new(dir, &record.id).error_log());
        for entry in ledger.entries().await? {
            if entry.file_id != record.id {
                continue;
            }
            let key = match entry.element {
                Some(element) => element_key(&entry.file_id, entry.page, element),
                None => page_key(&entry.file_id, entry.page),
            };
            if store.get_hash(&key)?.is_none() {
                println!("           reprocess {entry}");
            }
        }
    }
    Ok(())
}
