use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use blockvault::engine::{Engine, ScrubDepth};
use blockvault::{Config, VaultError, Version, VersionUid};

#[derive(Parser)]
#[command(
    name = "blockvault",
    version = "0.9.0",
    about = "Block-level deduplicating backup engine"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "blockvault.yaml")]
    config: PathBuf,
    /// Emit a single JSON document on stdout instead of human output
    #[arg(short, long)]
    machine_output: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a volume into a new version
    Backup {
        /// Volume label the version is recorded under
        volume: String,
        /// Snapshot label (free form)
        snapshot: String,
        /// Source URL, e.g. file:///var/lib/images/vm.img
        source: String,
        /// Storage name (defaults to defaultStorage)
        #[arg(short, long)]
        storage: Option<String>,
        /// Base version uid for a differential backup
        #[arg(short, long)]
        base_version: Option<String>,
        /// Labels as name=value pairs
        #[arg(short, long)]
        label: Vec<String>,
    },
    /// Restore a version into a target volume
    Restore {
        version_uid: String,
        /// Target URL, e.g. file:///var/lib/images/restore.img
        target: String,
        /// Skip writing sparse blocks (target must read as zeros)
        #[arg(short, long)]
        sparse: bool,
        /// Restore even if the version is not valid
        #[arg(short, long)]
        force: bool,
    },
    /// Verify a version against its stored blocks
    Scrub {
        version_uid: String,
        /// Fetch and re-hash every block instead of checking metadata only
        #[arg(short, long)]
        deep: bool,
        /// Check only a random percentage of blocks
        #[arg(short, long, default_value = "100")]
        block_percentage: u8,
    },
    /// List versions
    Ls {
        #[arg(short, long)]
        volume: Option<String>,
        #[arg(short, long)]
        snapshot: Option<String>,
    },
    /// Remove a version (its blocks go to the deferred-delete queue)
    Rm {
        version_uid: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Apply the deferred-delete queue and remove unreferenced blocks
    Cleanup {
        /// Minimum age of queue entries before physical deletion
        #[arg(long, default_value = "3600")]
        safety_delay: u64,
    },
    /// Add or remove labels on a version
    Label {
        version_uid: String,
        /// Labels as name=value to set; a bare name removes the label
        labels: Vec<String>,
    },
    /// Protect a version from removal
    Protect { version_uid: String },
    /// Remove the protection flag again
    Unprotect { version_uid: String },
    /// Export a version's metadata document to its storage
    MetadataExport { version_uid: String },
    /// Re-create a version from an exported metadata document
    MetadataImport {
        version_uid: String,
        #[arg(short, long)]
        storage: Option<String>,
    },
    /// Remove a stale lock (administrator action)
    BreakLock { lock_name: String },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), VaultError> {
    let config = Config::load(&cli.config)?;
    init_logging(&config)?;
    let mut engine = Engine::open(config)?;
    let machine = cli.machine_output;

    match cli.command {

        // ── Backup ───────────────────────────────────────────────────────────
        Commands::Backup { volume, snapshot, source, storage, base_version, label } => {
            let labels = Engine::parse_labels(&label)?;
            let base = base_version.map(VersionUid::new);
            let uid = engine.backup(
                &volume,
                &snapshot,
                &source,
                storage.as_deref(),
                base.as_ref(),
                labels,
            )?;
            let version = engine.version(&uid)?;
            if machine {
                emit(&serde_json::json!({ "version": version }))?;
            } else {
                println!("Backup complete: {uid}");
                print_versions(&[version]);
            }
        }

        // ── Restore ──────────────────────────────────────────────────────────
        Commands::Restore { version_uid, target, sparse, force } => {
            let uid = VersionUid::new(version_uid);
            engine.restore(&uid, &target, sparse, force)?;
            if machine {
                emit(&serde_json::json!({ "restored": uid, "target": target }))?;
            } else {
                println!("Restored {uid} to {target}");
            }
        }

        // ── Scrub ────────────────────────────────────────────────────────────
        Commands::Scrub { version_uid, deep, block_percentage } => {
            let uid = VersionUid::new(version_uid);
            let depth = if deep { ScrubDepth::Deep } else { ScrubDepth::Metadata };
            let report = engine.scrub(&uid, depth, block_percentage)?;
            if machine {
                emit(&serde_json::json!({ "scrub": report }))?;
            } else {
                println!(
                    "Scrubbed {} ({} of {} blocks checked{})",
                    report.version_uid,
                    report.checked_blocks,
                    report.total_blocks,
                    if report.complete_pass { ", complete pass" } else { "" },
                );
            }
        }

        // ── Ls ───────────────────────────────────────────────────────────────
        Commands::Ls { volume, snapshot } => {
            let versions = engine.ls(volume.as_deref(), snapshot.as_deref())?;
            if machine {
                emit(&serde_json::json!({ "versions": versions }))?;
            } else {
                print_versions(&versions);
            }
        }

        // ── Rm ───────────────────────────────────────────────────────────────
        Commands::Rm { version_uid, force } => {
            let uid = VersionUid::new(version_uid);
            let enqueued = engine.rm(&uid, force)?;
            if machine {
                emit(&serde_json::json!({ "removed": uid, "enqueued_blocks": enqueued }))?;
            } else {
                println!("Removed {uid} ({enqueued} blocks queued for deletion)");
            }
        }

        // ── Cleanup ──────────────────────────────────────────────────────────
        Commands::Cleanup { safety_delay } => {
            let report = engine.cleanup(safety_delay)?;
            if machine {
                emit(&serde_json::json!({ "cleanup": report }))?;
            } else {
                println!(
                    "Cleanup removed {} blocks ({} still referenced, {} already gone)",
                    report.removed_blocks, report.requeued_references, report.missing_objects,
                );
            }
        }

        // ── Label ────────────────────────────────────────────────────────────
        Commands::Label { version_uid, labels } => {
            let uid = VersionUid::new(version_uid);
            for entry in &labels {
                match entry.split_once('=') {
                    Some((name, value)) => engine.add_label(&uid, name, value)?,
                    None => engine.remove_label(&uid, entry)?,
                }
            }
            if machine {
                emit(&serde_json::json!({ "version": engine.version(&uid)? }))?;
            }
        }

        // ── Protect / Unprotect ──────────────────────────────────────────────
        Commands::Protect { version_uid } => {
            engine.protect(&VersionUid::new(version_uid), true)?;
        }
        Commands::Unprotect { version_uid } => {
            engine.protect(&VersionUid::new(version_uid), false)?;
        }

        // ── Metadata export / import ─────────────────────────────────────────
        Commands::MetadataExport { version_uid } => {
            let uid = VersionUid::new(version_uid);
            engine.metadata_export(&uid)?;
            if !machine {
                println!("Exported metadata of {uid}");
            }
        }
        Commands::MetadataImport { version_uid, storage } => {
            let uid = VersionUid::new(version_uid);
            let version = engine.metadata_import(storage.as_deref(), &uid)?;
            if machine {
                emit(&serde_json::json!({ "version": version }))?;
            } else {
                println!("Imported {uid}");
                print_versions(&[version]);
            }
        }

        // ── Break-lock ───────────────────────────────────────────────────────
        Commands::BreakLock { lock_name } => {
            engine.break_lock(&lock_name)?;
            println!("Lock {lock_name} removed");
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(config: &Config) -> Result<(), VaultError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    VaultError::Configuration(format!("Cannot open logFile {}: {e}.", path.display()))
                })?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn emit(document: &serde_json::Value) -> Result<(), VaultError> {
    let rendered = serde_json::to_string_pretty(document)
        .map_err(|e| VaultError::Internal(format!("Machine output failed: {e}")))?;
    println!("{rendered}");
    Ok(())
}

fn print_versions(versions: &[Version]) {
    println!(
        "{:<16} {:<20} {:<16} {:<20} {:>14} {:>9} {:<10} {:>4}",
        "Uid", "Volume", "Snapshot", "Date", "Size", "Block", "Status", "Prot"
    );
    for v in versions {
        println!(
            "{:<16} {:<20} {:<16} {:<20} {:>14} {:>9} {:<10} {:>4}",
            v.uid.to_string(),
            v.volume,
            v.snapshot,
            v.date.format("%Y-%m-%d %H:%M:%S").to_string(),
            v.size,
            v.block_size,
            v.status.as_str(),
            if v.protected { "yes" } else { "no" },
        );
    }
}
