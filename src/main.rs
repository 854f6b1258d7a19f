use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use roost::config::{generate_example_config, DEFAULT_CONFIG_FILE};
use roost::events::{JsonObserver, TracingObserver};
use roost::{
    AppConfig, Archiver, Containers, Event, Mover, Observer, Purge, RestoreOptions,
    RestoreOutcome, Restorer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roost")]
#[command(about = "Site backups with mirrored copies, retention and guarded restores")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Print progress events as JSON lines on stdout
    #[arg(long, global = true)]
    json_events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup, copy it to the mirrors and purge old backups
    Backup {
        /// Keep the new backup local only
        #[arg(long)]
        no_move: bool,
        /// Skip the purge
        #[arg(long)]
        no_purge: bool,
        /// Do nothing but report completion
        #[arg(long)]
        no_create: bool,
    },
    /// Copy a backup file into a container folder
    Move {
        file: String,
        container: String,
        folder: String,
    },
    /// Delete expired and already mirrored local backups
    Purge,
    /// Restore a backup onto the site
    Restore {
        /// Backup file name
        archive: String,
        /// Skip the pre-restore backup
        #[arg(long)]
        no_backup: bool,
        /// Do not fall back to the latest local backup on failure
        #[arg(long)]
        no_fix: bool,
    },
    /// List available backups
    List {
        /// List the mirrors instead of the local directory
        #[arg(long)]
        remote: bool,
    },
    /// Generate an example configuration file
    GenerateConfig {
        /// Output path for the config file
        #[arg(short, long, default_value = "roost.toml.example")]
        output: String,
    },
}

fn load_config(path: Option<&str>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => AppConfig::load(DEFAULT_CONFIG_FILE),
        None => Ok(AppConfig::default()),
    }
}

fn init_logging(config: &AppConfig) {
    let level = config.logging.level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("roost={}", level)))
        .unwrap_or_else(|_| EnvFilter::new("roost=info"));

    // stdout belongs to --json-events
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn backup(
    config: &AppConfig,
    observer: Arc<dyn Observer>,
    no_move: bool,
    no_purge: bool,
    no_create: bool,
) -> Result<()> {
    if !no_create {
        let containers = Containers::from_config(&config.containers).await?;
        let archive = Archiver::from_config(config, observer.clone()).create_archive()?;

        if !no_move {
            let mover = Mover::new(containers.clone(), observer.clone());
            mover
                .move_to_all(&archive.path.to_string_lossy(), &config.mirrors())
                .await?;
        }

        if !no_purge {
            let purged = Purge::from_config(config, containers, observer.clone())
                .purge()
                .await?;
            info!("Purged {} backup(s)", purged.len());
        }
    }

    observer.notify(&Event::Finished);
    Ok(())
}

async fn restore(
    config: &AppConfig,
    observer: Arc<dyn Observer>,
    archive: &str,
    options: RestoreOptions,
) -> Result<()> {
    let containers = Containers::from_config(&config.containers).await?;
    let restorer = Restorer::from_config(config, containers, observer);

    match restorer.restore_with_options(archive, options).await? {
        RestoreOutcome::Restored(report) => {
            println!(
                "✅ Restored {} ({} files)",
                report.archive, report.file_count
            );
        }
        RestoreOutcome::Recovered {
            failed,
            cause,
            report,
        } => {
            println!("⚠️  Restore of {} failed: {}", failed, cause);
            println!(
                "✅ Restored {} instead ({} files)",
                report.archive, report.file_count
            );
        }
    }
    Ok(())
}

async fn list_backups(config: &AppConfig, remote: bool) -> Result<()> {
    if !remote {
        let backups = config.storage_paths().local_backups();
        println!("Local backups in {}:", backups.dir().display());
        let now = Utc::now();
        for archive in backups.list()?.iter().rev() {
            let size_mb = archive.size_bytes as f64 / 1_048_576.0;
            println!(
                "  {} ({:.2} MB) - {} days old",
                archive.name,
                size_mb,
                archive.age_days(now)
            );
        }
        return Ok(());
    }

    let containers = Containers::from_config(&config.containers).await?;
    let mirrors = config.mirrors();
    if mirrors.is_empty() {
        warn!("No copy-backups configured");
    }
    for reference in mirrors {
        let mirror = containers.mirror(&reference)?;
        println!(
            "{}/{} ({}):",
            reference.container,
            reference.folder,
            mirror.label()
        );
        let entries = mirror.list().await?;
        for entry in entries {
            let size_mb = entry.size as f64 / 1_048_576.0;
            if let Some(last_modified) = entry.last_modified {
                println!("  {} ({:.2} MB) - {}", entry.basename, size_mb, last_modified);
            } else {
                println!("  {} ({:.2} MB)", entry.basename, size_mb);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenerateConfig { output } = &cli.command {
        generate_example_config(output)?;
        println!("✅ Example configuration file generated: {}", output);
        println!("📝 Please edit it with your actual paths and containers");
        return Ok(());
    }

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config);

    let observer: Arc<dyn Observer> = if cli.json_events {
        Arc::new(JsonObserver::new(io::stdout()))
    } else {
        Arc::new(TracingObserver)
    };

    match cli.command {
        Commands::Backup {
            no_move,
            no_purge,
            no_create,
        } => {
            backup(&config, observer, no_move, no_purge, no_create).await?;
        }
        Commands::Move {
            file,
            container,
            folder,
        } => {
            let containers = Containers::from_config(&config.containers).await?;
            Mover::new(containers, observer)
                .move_backup(&file, &container, &folder)
                .await?;
        }
        Commands::Purge => {
            let containers = Containers::from_config(&config.containers).await?;
            let purged = Purge::from_config(&config, containers, observer)
                .purge()
                .await?;
            info!("Purged {} backup(s)", purged.len());
        }
        Commands::Restore {
            archive,
            no_backup,
            no_fix,
        } => {
            let options = RestoreOptions {
                pre_backup: !no_backup,
                fallback: !no_fix,
            };
            restore(&config, observer, &archive, options).await?;
        }
        Commands::List { remote } => {
            list_backups(&config, remote).await?;
        }
        // Handled before the config is loaded.
        Commands::GenerateConfig { .. } => {}
    }

    Ok(())
}
