//! # Custody CLI
//!
//! Command-line front end for the custody pipelines. Every subcommand maps
//! to one operation on the [`custody::Custody`] context, which is built from
//! a JSON configuration file plus environment overrides.
//!
//! ## Usage
//! ```bash
//! # Take custody of a file
//! custody ingest ./recording.flac
//!
//! # Archive everything that has no archive copy yet
//! custody archive-pending
//!
//! # Verify today's shard (run from cron)
//! custody daily-verify
//!
//! # Hash a local file without touching any backend
//! custody hash ./recording.flac --algorithm sha512
//!
//! # Capture any page in the web archive
//! custody save-page https://example.com/
//!
//! # Copy the tables into the database of another configuration
//! custody migrate airtable.json
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use custody::config::DEFAULT_CONFIG_FILE;
use custody::hash::hash_file;
use custody::types::fields;
use custody::utils::format_elapsed;
use custody::migration::migrate;
use custody::{
    Archive, Custody, CustodyConfig, CustodyError, HashAlgorithm, Result, Table, WaybackClient,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Custody - ingest, archive and verify files
#[derive(Parser)]
#[command(name = "custody")]
#[command(version)]
#[command(about = "Durable custody of files: ingest, archive and verify")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash, upload and record a local file
    Ingest {
        /// File to ingest
        path: PathBuf,
    },

    /// Archive one file and record its permanent URL
    Archive {
        /// Files record id
        record_id: String,
    },

    /// Archive every file that has no archive copy yet
    ArchivePending,

    /// Verify all copies of one file
    Verify {
        /// Files record id
        record_id: String,
    },

    /// Verify the shard due today
    DailyVerify {
        /// Verify this shard instead of today's
        #[arg(long)]
        shard: Option<usize>,
    },

    /// Extract metadata for files that have none yet
    AddMetadata {
        /// Maximum number of files to process
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Export a table to JSON
    Export {
        /// Table name
        table: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Capture a web page in the archive and print its permanent URL
    SavePage {
        /// Page to capture
        url: Url,
    },

    /// Copy the Files and Musics tables into another database
    Migrate {
        /// Configuration file naming the target database
        target: PathBuf,
    },

    /// Hash a local file
    Hash {
        /// File to hash
        path: PathBuf,

        /// Hash algorithm
        #[arg(short, long, default_value = "sha256")]
        algorithm: HashAlgorithm,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Hash { path, algorithm } => return cmd_hash(path, *algorithm).await,
        Commands::SavePage { url } => return cmd_save_page(&load_config(&cli.config)?, url).await,
        Commands::Migrate { target } => return cmd_migrate(&cli.config, target).await,
        _ => {}
    }

    let custody = open_custody(&cli.config).await?;
    let result = match cli.command {
        Commands::Ingest { path } => cmd_ingest(&custody, &path).await,
        Commands::Archive { record_id } => cmd_archive(&custody, &record_id).await,
        Commands::ArchivePending => cmd_archive_pending(&custody).await,
        Commands::Verify { record_id } => cmd_verify(&custody, &record_id).await,
        Commands::DailyVerify { shard } => cmd_daily_verify(&custody, shard).await,
        Commands::AddMetadata { limit } => cmd_add_metadata(&custody, limit).await,
        Commands::Export { table, out } => cmd_export(&custody, &table, &out).await,
        Commands::Hash { .. } | Commands::SavePage { .. } | Commands::Migrate { .. } => Ok(()),
    };
    custody.database().close().await?;
    result
}

/// Load the configuration with environment overrides applied
///
/// A missing file is only an error when it was asked for explicitly; the
/// default location falls back to the built-in defaults.
fn load_config(path: &Path) -> Result<CustodyConfig> {
    let mut config = match CustodyConfig::load(path) {
        Ok(config) => config,
        Err(CustodyError::FileNotFound(_)) if path == Path::new(DEFAULT_CONFIG_FILE) => {
            tracing::warn!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
            CustodyConfig::default()
        }
        Err(e) => return Err(e),
    };
    config.apply_env();
    Ok(config)
}

/// Load the configuration and connect every backend
async fn open_custody(path: &Path) -> Result<Custody> {
    load_config(path)?.connect().await
}

async fn cmd_ingest(custody: &Custody, path: &Path) -> Result<()> {
    let record = custody.ingest(path).await?;
    println!("{} Ingested {}", "✓".green().bold(), record.display_name().cyan());
    println!("  Record: {}", record.id.yellow());
    if let Some(sha256) = record.text(fields::SHA256) {
        println!("  SHA256: {}", sha256);
    }
    Ok(())
}

async fn cmd_archive(custody: &Custody, record_id: &str) -> Result<()> {
    println!("{}", "Archiving...".blue().bold());
    let url = custody.archive(record_id).await?;
    println!("{} Archived at {}", "✓".green().bold(), url.cyan());
    Ok(())
}

async fn cmd_archive_pending(custody: &Custody) -> Result<()> {
    let start = Instant::now();
    let urls = custody.archive_pending().await?;
    println!(
        "{} Archived {} file(s) in {}",
        "✓".green().bold(),
        urls.len(),
        format_elapsed(start.elapsed())
    );
    Ok(())
}

async fn cmd_verify(custody: &Custody, record_id: &str) -> Result<()> {
    if custody.verify(record_id).await? {
        println!("{} All copies match", "✓".green().bold());
        Ok(())
    } else {
        let record = custody.files().await?.get(record_id).await?;
        Err(CustodyError::Verification {
            failed: vec![record.display_name()],
        })
    }
}

async fn cmd_daily_verify(custody: &Custody, shard: Option<usize>) -> Result<()> {
    let start = Instant::now();
    let summary = match shard {
        Some(index) => custody.verify_shard(index).await?,
        None => custody.daily_verify().await?,
    };
    println!(
        "{} {} in {}",
        "✓".green().bold(),
        summary.summary(),
        format_elapsed(start.elapsed())
    );
    Ok(())
}

async fn cmd_add_metadata(custody: &Custody, limit: Option<usize>) -> Result<()> {
    let summary = custody.add_metadata(limit).await?;
    println!(
        "{} Added metadata to {} file(s)",
        "✓".green().bold(),
        summary.processed.len()
    );
    if !summary.failed.is_empty() {
        println!(
            "{} {} file(s) failed: {}",
            "⚠".yellow().bold(),
            summary.failed.len(),
            summary.failed.join(", ")
        );
    }
    Ok(())
}

async fn cmd_export(custody: &Custody, table: &str, out: &Path) -> Result<()> {
    let path = custody.export_table(table, out).await?;
    println!("{} Exported {} to {}", "✓".green().bold(), table, path.display().to_string().cyan());
    Ok(())
}

async fn cmd_save_page(config: &CustodyConfig, url: &Url) -> Result<()> {
    println!("{}", "Saving page...".blue().bold());
    let client = WaybackClient::new(config.archive.clone())?;
    let archived = client.capture(url).await?;
    println!("{} Saved at {}", "✓".green().bold(), archived.cyan());
    Ok(())
}

async fn cmd_migrate(source: &Path, target: &Path) -> Result<()> {
    let start = Instant::now();
    let source = load_config(source)?.database.open().await?;
    let mut target_config = CustodyConfig::load(target)?;
    target_config.apply_env();
    let target = target_config.database.open().await?;

    let result = migrate(source.as_ref(), target.as_ref()).await;
    source.close().await?;
    target.close().await?;
    let summary = result?;
    println!(
        "{} Migrated {} Files row(s) and {} Musics row(s) from {} to {} in {}",
        "✓".green().bold(),
        summary.files,
        summary.musics,
        source.name(),
        target.name(),
        format_elapsed(start.elapsed())
    );
    Ok(())
}

async fn cmd_hash(path: &Path, algorithm: HashAlgorithm) -> Result<()> {
    let digest = hash_file(path, algorithm).await?;
    println!("{}  {}", digest, path.display());
    Ok(())
}
