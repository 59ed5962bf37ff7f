use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use docstate::backup::{ArchiveReader, BackupMetadata, BackupOrigin, BackupPaths, CommandDumper};
use docstate::{DocState, StateConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docstate")]
#[command(about = "Inspect control records and manage backup archives")]
struct Cli {
    /// Data directory (overrides DOCSTATE_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the status of a control record, creating it if needed
    Status { key: String },
    /// Record a success now
    Success { key: String },
    /// Record one more consecutive error
    Error { key: String },
    /// Change the grace period of a control record
    Grace { key: String, secs: u64 },
    /// Snapshot the document store and truncate its journal
    Checkpoint,
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    Create {
        #[arg(long)]
        root: PathBuf,
        /// Path to include, relative to --root (repeatable)
        #[arg(long = "path", required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        exclude: Vec<PathBuf>,
        /// Command whose stdout is stored as the database dump
        #[arg(long)]
        dump_cmd: Option<String>,
        #[arg(long, default_value = "")]
        environment: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    List,
    Get {
        id: String,
        /// Where to write the archive
        #[arg(long)]
        out: PathBuf,
    },
    Remove { id: String },
    /// Unpack a downloaded archive into an empty directory
    Extract { archive: PathBuf, dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,docstate=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = StateConfig::from_env().context("Invalid DOCSTATE_* environment")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Command::Backup {
            command: BackupCommand::Extract { archive, dir },
        } => extract(&archive, &dir).await,
        command => {
            let state = DocState::open(config)
                .await
                .context("Failed to open state directory")?;
            run(&state, command).await
        }
    }
}

async fn run(state: &DocState, command: Command) -> Result<()> {
    let records = state.control_records();
    match command {
        Command::Status { key } => {
            let record = records.get_or_create(&key).await?;
            let status = records.status(&record, Utc::now());
            println!("{}: {}", status.level, status.message);
            println!("  consecutive errors: {}", record.consecutive_errors());
            match record.last_success_time() {
                Some(at) => println!("  last success:       {}", at.to_rfc3339()),
                None => println!("  last success:       never"),
            }
            println!("  grace period:       {}s", record.grace_period().as_secs());
        }
        Command::Success { key } => {
            let mut record = records.get_or_create(&key).await?;
            records.record_success(&mut record, Utc::now()).await?;
            println!("{}: success recorded", key);
        }
        Command::Error { key } => {
            let mut record = records.get_or_create(&key).await?;
            records.increment_errors(&mut record).await?;
            println!("{}: {} consecutive errors", key, record.consecutive_errors());
        }
        Command::Grace { key, secs } => {
            let mut record = records.get_or_create(&key).await?;
            records.set_grace_period(&mut record, Duration::from_secs(secs)).await?;
            println!("{}: grace period {}s", key, secs);
        }
        Command::Checkpoint => {
            state.checkpoint().await?;
            println!("checkpoint written");
        }
        Command::Backup { command } => backup(state, command).await?,
    }
    Ok(())
}

async fn backup(state: &DocState, command: BackupCommand) -> Result<()> {
    let mut backups = state.backups();
    match command {
        BackupCommand::Create {
            root,
            paths,
            exclude,
            dump_cmd,
            environment,
            notes,
        } => {
            if let Some(line) = dump_cmd {
                backups = backups.with_dumper(Arc::new(CommandDumper::from_command_line(&line)?));
            }
            let hostname = std::env::var("HOSTNAME").unwrap_or_default();
            let origin = BackupOrigin::new(environment, hostname, env!("CARGO_PKG_VERSION"));
            let mut meta = BackupMetadata::new(origin).with_notes(notes);
            let backup_paths = BackupPaths {
                root,
                include: paths,
                exclude,
            };
            let location = backups
                .create(&mut meta, &backup_paths)
                .await
                .context("Backup failed")?;
            println!("{}", location.id);
        }
        BackupCommand::List => {
            for meta in backups.list().await? {
                println!(
                    "{}  {}  {} bytes  {}",
                    meta.id.as_deref().unwrap_or("-"),
                    meta.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    meta.size.unwrap_or(0),
                    meta.origin.environment
                );
            }
        }
        BackupCommand::Get { id, out } => {
            let (meta, mut reader) = backups.get(&id).await?;
            let mut file = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("Failed to create '{}'", out.display()))?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            eprintln!("wrote {} bytes to {}", written, out.display());
        }
        BackupCommand::Remove { id } => {
            backups.remove(&id).await?;
            println!("removed {}", id);
        }
        BackupCommand::Extract { archive, dir } => extract(&archive, &dir).await?,
    }
    Ok(())
}

async fn extract(archive: &Path, dir: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dir = dir.to_path_buf();
    let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let file = std::fs::File::open(&archive)
            .with_context(|| format!("Failed to open '{}'", archive.display()))?;
        let reader = ArchiveReader::open(std::io::BufReader::new(file))?;
        Ok(reader.extract_all(&dir)?)
    })
    .await??;
    for name in names {
        println!("{}", name);
    }
    Ok(())
}
