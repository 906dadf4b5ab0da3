use std::{
    io::{self, IsTerminal},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail, ensure};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use snapvault::{artifact::iv_path_for, prelude::*};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::{CliConfig, load_passphrase};

#[derive(Parser, Debug)]
#[command(name = "snapback")]
#[command(author, version, about = "Encrypted system snapshot tool", long_about = None)]
pub struct Cli {
    /// Config file (JSON). Default: `<config dir>/snapvault/snapback.json` if it exists
    #[arg(long, env = "SNAPBACK_CONFIG", global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding backup artifacts and IV records
    #[arg(long, env = "SNAPBACK_BACKUP_DIR", global = true, value_name = "DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Data-store directory (one JSON array file per collection)
    #[arg(long, env = "SNAPBACK_DATA_DIR", global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Live uploads directory
    #[arg(long, global = true, value_name = "DIR")]
    pub uploads_dir: Option<PathBuf>,

    /// Live application configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub app_config: Option<PathBuf>,

    /// Read the passphrase from the first line of FILE instead of `SNAPBACK_PASSPHRASE`
    #[arg(long, global = true, value_name = "FILE")]
    pub passphrase_file: Option<PathBuf>,

    /// Print machine-readable output where applicable
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose mode (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Color mode for log output
    #[arg(long, value_enum, default_value_t = ColorArg::Auto, global = true)]
    pub color: ColorArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an encrypted backup of the data store, uploads, and configuration
    Backup,

    /// Replace live state with the contents of a backup
    Restore(NameArgs),

    /// List backups, newest first
    List,

    /// Copy a backup artifact (still encrypted) out of the backup directory
    Download(DownloadArgs),

    /// Delete all but the newest backups
    Cleanup,

    /// Decrypt a backup and list its contents without restoring anything
    Verify(NameArgs),
}

#[derive(Args, Debug)]
pub struct NameArgs {
    /// Backup file name, e.g. backup-2026-03-01T09-30-00-000Z.zip.enc
    #[arg(value_name = "NAME")]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[arg(value_name = "NAME")]
    pub name: String,

    /// Destination file, or `-` for stdout. Default: NAME in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Also copy the IV record next to the destination
    #[arg(long)]
    pub with_iv: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ColorArg {
    Auto,
    Always,
    Never,
}

pub struct AppContext {
    pub config: CliConfig,
    pub passphrase_file: Option<PathBuf>,
    pub json: bool,
}

impl AppContext {
    fn passphrase(&self) -> Result<Passphrase> {
        load_passphrase(self.passphrase_file.as_deref())
    }

    /// Engine over the JSON directory store. Commands that never open a
    /// connection do not require a data directory.
    fn engine(&self, needs_store: bool) -> Result<SnapshotEngine<JsonDirStore>> {
        let data_dir = if needs_store {
            self.config.data_dir()?.to_path_buf()
        } else {
            self.config.data_dir.clone().unwrap_or_default()
        };
        Ok(SnapshotEngine::new(
            self.config.engine.clone(),
            JsonDirStore::new(data_dir),
        ))
    }
}

pub fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{text}");
    Ok(())
}

fn build_context(cli: &Cli) -> Result<AppContext> {
    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.backup_dir {
        config.engine.backup_dir.clone_from(dir);
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.uploads_dir {
        config.engine.uploads_dir = Some(dir.clone());
    }
    if let Some(file) = &cli.app_config {
        config.engine.config_file = Some(file.clone());
    }
    Ok(AppContext {
        config,
        passphrase_file: cli.passphrase_file.clone(),
        json: cli.json,
    })
}

pub async fn run(cli: Cli) -> Result<()> {
    let ctx = build_context(&cli)?;
    match cli.command {
        Commands::Backup => handle_backup(&ctx).await,
        Commands::Restore(args) => handle_restore(&ctx, &args.name).await,
        Commands::List => handle_list(&ctx),
        Commands::Download(args) => handle_download(&ctx, args).await,
        Commands::Cleanup => handle_cleanup(&ctx).await,
        Commands::Verify(args) => handle_verify(&ctx, &args.name).await,
    }
}

async fn handle_backup(ctx: &AppContext) -> Result<()> {
    let passphrase = ctx.passphrase()?;
    let engine = ctx.engine(true)?;

    let progress = ProgressReporter::new(ctx.json, "Creating backup");
    let outcome = engine
        .create_backup(&passphrase)
        .await
        .context("backup failed")?;
    // flush the artifact and its IV record before anything else touches them
    sync_filesystem_after_archive_write();
    progress.finish("Backup completed");

    if ctx.json {
        return emit_json(&outcome);
    }
    println!(
        "backup={} collections={} documents={} bytes={}",
        outcome.artifact.name,
        outcome.collections.len(),
        outcome.document_count(),
        outcome.artifact.size
    );
    if let Some(retention) = &outcome.retention {
        for name in &retention.removed {
            println!("removed={name}");
        }
    }
    Ok(())
}

async fn handle_restore(ctx: &AppContext, name: &str) -> Result<()> {
    let passphrase = ctx.passphrase()?;
    let engine = ctx.engine(true)?;

    let progress = ProgressReporter::new(ctx.json, &format!("Restoring {name}"));
    let report = engine
        .restore_backup(name, &passphrase)
        .await
        .with_context(|| format!("restore of {name} failed"))?;
    progress.finish("Restore completed");

    if ctx.json {
        return emit_json(&report);
    }
    for collection in &report.collections {
        if collection.skipped_empty {
            println!("{}: empty in backup, left unchanged", collection.name);
        } else {
            println!(
                "{}: deleted={} inserted={} failed={}",
                collection.name,
                collection.deleted,
                collection.inserted,
                collection.failures.len()
            );
        }
    }
    if let Some(files) = report.uploads_restored {
        println!("uploads: {files} files");
    }
    if let Some(backup) = &report.config_backup {
        println!("config: restored (previous saved to {})", backup.display());
    } else if report.config_restored {
        println!("config: restored");
    }
    let failed = report.failed_documents();
    if failed > 0 {
        warn!(failed, "some documents were rejected by the data store");
        eprintln!("warning: {failed} documents could not be inserted; rerun with --json for details");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ListEntry<'a> {
    name: &'a str,
    created_at: String,
    size: u64,
    has_iv: bool,
}

fn handle_list(ctx: &AppContext) -> Result<()> {
    let engine = ctx.engine(false)?;
    let artifacts = engine.list_backups()?;
    let entries: Vec<_> = artifacts
        .iter()
        .map(|artifact| ListEntry {
            name: &artifact.name,
            created_at: format_created_at(artifact),
            size: artifact.size,
            has_iv: artifact.has_iv(),
        })
        .collect();

    if ctx.json {
        return emit_json(&entries);
    }
    if entries.is_empty() {
        println!("no backups in {}", engine.config().backup_dir.display());
    }
    for entry in &entries {
        let iv_note = if entry.has_iv { "" } else { "  (missing IV)" };
        println!(
            "{}  {}  {:>12}{iv_note}",
            entry.name, entry.created_at, entry.size
        );
    }
    Ok(())
}

fn format_created_at(artifact: &Artifact) -> String {
    artifact
        .created_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

async fn handle_download(ctx: &AppContext, args: DownloadArgs) -> Result<()> {
    let engine = ctx.engine(false)?;
    let (artifact, mut source) = engine.open_artifact(&args.name).await?;

    if args.output.as_deref() == Some(Path::new("-")) {
        ensure!(!args.with_iv, "--with-iv requires an output file");
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut source, &mut stdout).await?;
        stdout.flush().await?;
        return Ok(());
    }

    let dest = args
        .output
        .unwrap_or_else(|| PathBuf::from(&artifact.name));
    ensure!(!dest.exists(), "{} already exists", dest.display());
    let mut out = tokio::fs::File::create(&dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let bytes = tokio::io::copy(&mut source, &mut out)
        .await
        .with_context(|| format!("write {}", dest.display()))?;
    out.sync_all().await?;

    let iv_dest = if args.with_iv {
        ensure!(
            artifact.has_iv(),
            "backup {} has no IV record; it cannot be decrypted",
            artifact.name
        );
        let iv_dest = iv_path_for(&dest);
        tokio::fs::copy(&artifact.iv_path, &iv_dest)
            .await
            .with_context(|| format!("write {}", iv_dest.display()))?;
        Some(iv_dest)
    } else {
        None
    };
    info!(artifact = %artifact.name, bytes, "backup downloaded");

    if ctx.json {
        return emit_json(&serde_json::json!({
            "backup": artifact.name,
            "output": dest,
            "iv": iv_dest,
            "bytes": bytes,
        }));
    }
    println!("output={} bytes={bytes}", dest.display());
    if let Some(iv_dest) = iv_dest {
        println!("iv={}", iv_dest.display());
    }
    Ok(())
}

async fn handle_cleanup(ctx: &AppContext) -> Result<()> {
    let engine = ctx.engine(false)?;
    let report = engine.cleanup_old_backups().await?;

    if ctx.json {
        emit_json(&report)?;
    } else {
        for name in &report.removed {
            println!("removed={name}");
        }
        println!("kept={}", report.kept.len());
        for failure in &report.failed {
            eprintln!("failed to remove {}: {}", failure.name, failure.error);
        }
    }
    if !report.is_clean() {
        bail!("{} old backups could not be removed", report.failed.len());
    }
    Ok(())
}

async fn handle_verify(ctx: &AppContext, name: &str) -> Result<()> {
    let passphrase = ctx.passphrase()?;
    let engine = ctx.engine(false)?;

    let progress = ProgressReporter::new(ctx.json, &format!("Verifying {name}"));
    let report = engine
        .verify_backup(name, &passphrase)
        .await
        .with_context(|| format!("verification of {name} failed"))?;
    progress.finish("Backup verified");

    if ctx.json {
        return emit_json(&report);
    }
    println!(
        "backup={} entries={} archive_bytes={}",
        report.artifact.name,
        report.entries.len(),
        report.archive_bytes
    );
    match &report.manifest {
        Some(manifest) => {
            println!("created_at={} tool={}", manifest.created_at, manifest.tool);
            for collection in &manifest.collections {
                println!("  {}: {} documents", collection.name, collection.documents);
            }
        }
        None => println!("manifest: missing"),
    }
    Ok(())
}

fn progress_enabled(json: bool, stderr_is_tty: bool) -> bool {
    !json && stderr_is_tty
}

struct ProgressReporter {
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    fn new(json: bool, message: &str) -> Self {
        if !progress_enabled(json, io::stderr().is_terminal()) {
            return Self { bar: None };
        }
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        bar.set_message(message.to_string());
        Self { bar: Some(bar) }
    }

    fn finish(&self, message: &str) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(message.to_string());
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar
            && !bar.is_finished()
        {
            bar.abandon();
        }
    }
}

fn sync_filesystem_after_archive_write() {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        nix::unistd::sync();
    }
}
