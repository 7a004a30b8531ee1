//! Command-line interface for the attestor.
//!
//! Provides commands for registering fingerprints, verifying them,
//! listing a submitter's registrations and running the reconciliation loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::adapters::{ConfirmationSource, HttpLedgerClient, SimulatedLedger};
use crate::config::{self, ResolvedConfig};
use crate::core::{Attestor, MergeEngine, QueryService, Reconciler, SubmitRequest, UpdateLog};
use crate::domain::{EvidenceRecord, Fingerprint};
use crate::store::{EvidenceStore, SqliteStore};

/// attestor - Evidence fingerprint registry and ledger reconciliation
#[derive(Parser, Debug)]
#[command(name = "attestor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register an evidence fingerprint
    Submit {
        /// Hex SHA-256 fingerprint
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        fingerprint: Option<String>,

        /// Fingerprint this file's contents instead
        #[arg(long)]
        file: Option<PathBuf>,

        /// Submitter identifier
        #[arg(long)]
        submitter: String,

        /// Where the evidence was captured
        #[arg(long)]
        url: String,

        /// Title of the captured page
        #[arg(long)]
        title: String,

        /// Capture time in unix milliseconds (defaults to now)
        #[arg(long)]
        captured_at: Option<i64>,
    },

    /// Check whether a fingerprint is registered
    Verify {
        /// Hex SHA-256 fingerprint
        fingerprint: String,
    },

    /// List registrations of one submitter
    List {
        /// Submitter identifier
        #[arg(long)]
        submitter: String,
    },

    /// Drive submitted records to a terminal status
    Reconcile {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,

        /// Use the in-process ledger instead of the configured endpoint
        #[arg(long)]
        simulate: bool,
    },

    /// Print the fingerprint of a file
    Hash {
        /// File to fingerprint
        file: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit {
                fingerprint,
                file,
                submitter,
                url,
                title,
                captured_at,
            } => submit(fingerprint, file, submitter, url, title, captured_at).await,
            Commands::Verify { fingerprint } => verify(&fingerprint).await,
            Commands::List { submitter } => list(&submitter).await,
            Commands::Reconcile { once, simulate } => reconcile(once, simulate).await,
            Commands::Hash { file } => {
                println!("{}", fingerprint_file(&file).await?);
                Ok(())
            }
            Commands::Config => show_config(),
        }
    }
}

/// Store, update log and merge engine for the configured home
async fn open_engine(config: &ResolvedConfig) -> Result<(Arc<MergeEngine>, Arc<SqliteStore>)> {
    let store = Arc::new(
        SqliteStore::open(&config.database)
            .with_context(|| format!("Failed to open store: {}", config.database.display()))?,
    );
    let log = UpdateLog::open(config.update_log.clone()).await?;
    let engine = MergeEngine::open(log, store.clone()).await?;

    Ok((Arc::new(engine), store))
}

async fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Fingerprint::of_bytes(&content))
}

async fn submit(
    fingerprint: Option<String>,
    file: Option<PathBuf>,
    submitter_id: String,
    origin_url: String,
    title: String,
    captured_at: Option<i64>,
) -> Result<()> {
    let fingerprint = match (fingerprint, file) {
        (Some(hex), _) => hex,
        (None, Some(path)) => fingerprint_file(&path).await?.to_string(),
        (None, None) => anyhow::bail!("Either --fingerprint or --file is required"),
    };

    let config = config::config()?;
    let (engine, _) = open_engine(config).await?;
    let attestor = Attestor::new(engine);

    let request = SubmitRequest {
        fingerprint,
        submitter_id,
        captured_at_ms: captured_at.unwrap_or_else(|| Utc::now().timestamp_millis()),
        origin_url,
        title,
    };

    let receipt = attestor
        .submit(request)
        .await
        .map_err(|e| anyhow::anyhow!("{} [{}]", e, e.code()))?;

    if receipt.created {
        println!("✅ Registered {}", receipt.fingerprint);
    } else {
        println!("ℹ️  Already registered {}", receipt.fingerprint);
    }
    println!("   Registration: {}", receipt.registration_id);
    println!("   Status:       {}", receipt.status);

    Ok(())
}

async fn verify(fingerprint: &str) -> Result<()> {
    let fingerprint = Fingerprint::parse(fingerprint).context("Invalid fingerprint")?;

    let config = config::config()?;
    let (engine, _) = open_engine(config).await?;
    let result = QueryService::new(engine).verify(&fingerprint).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn list(submitter_id: &str) -> Result<()> {
    let config = config::config()?;
    let (engine, _) = open_engine(config).await?;
    let records = QueryService::new(engine).list_by_submitter(submitter_id).await?;

    if records.is_empty() {
        println!("No registrations for {}", submitter_id);
        return Ok(());
    }

    println!("{:<14} {:<22} {:<24} {:>6}  TITLE", "FINGERPRINT", "STATUS", "CAPTURED", "CONF");
    println!("{}", "-".repeat(80));
    for record in &records {
        print_row(record);
    }
    println!("\nTotal: {} registration(s)", records.len());

    Ok(())
}

fn print_row(record: &EvidenceRecord) {
    println!(
        "{:<14} {:<22} {:<24} {:>6}  {}",
        record.fingerprint.short(),
        record.status.as_str(),
        record.metadata.captured_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        record.confirmation_count,
        record.metadata.title
    );
}

async fn reconcile(once: bool, simulate: bool) -> Result<()> {
    let config = config::config()?;
    let (_, store) = open_engine(config).await?;

    let source: Arc<dyn ConfirmationSource> = if simulate {
        Arc::new(SimulatedLedger::default())
    } else {
        let endpoint = config
            .ledger_endpoint
            .as_deref()
            .context("No ledger endpoint configured (set ATTESTOR_LEDGER_URL or use --simulate)")?;
        Arc::new(HttpLedgerClient::new(endpoint, config.ledger_request_timeout())?)
    };

    info!(source = source.name(), replica = %config.replica_id, "Starting reconciliation");
    let store: Arc<dyn EvidenceStore> = store;
    let reconciler = Arc::new(Reconciler::new(store, source, config.reconcile.clone()));

    if once {
        let report = reconciler.tick().await?;
        println!(
            "Attempted {} · finalized {} · errored {} · rescheduled {}",
            report.attempted, report.finalized, report.errored, report.rescheduled
        );
        return Ok(());
    }

    let handle = reconciler.clone().spawn();
    println!("🔄 Reconciling every {}ms. Press Ctrl+C to stop.", config.reconcile.tick_interval_ms);

    tokio::signal::ctrl_c().await?;
    println!("\n⏹  Stopping...");
    handle.stop().await?;

    let remaining = reconciler.tasks().await;
    if !remaining.is_empty() {
        println!("{} record(s) still awaiting confirmation", remaining.len());
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("attestor configuration");
    println!("======================");
    match config.config_file {
        Some(ref path) => println!("Config file:  {}", path.display()),
        None => println!("Config file:  (none, using defaults)"),
    }
    println!("Home:         {}", config.home.display());
    println!("Database:     {}", config.database.display());
    println!("Update log:   {}", config.update_log.display());
    println!("Replica:      {}", config.replica_id);
    println!(
        "Ledger:       {}",
        config.ledger_endpoint.as_deref().unwrap_or("(not configured)")
    );
    println!("\nReconcile:");
    println!("  tick_interval_ms:   {}", config.reconcile.tick_interval_ms);
    println!("  attempt_timeout_ms: {}", config.reconcile.attempt_timeout_ms);
    println!("  max_attempts:       {}", config.reconcile.max_attempts);
    println!("  initial_delay_ms:   {}", config.reconcile.backoff.initial_delay_ms);
    println!("  max_delay_ms:       {}", config.reconcile.backoff.max_delay_ms);

    Ok(())
}
