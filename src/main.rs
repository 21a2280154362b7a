use std::path::{Path, PathBuf};

use anyhow::Result;
use capsync_lib::core::{ActionProgress, QueueEvent, SyncEngine};
use capsync_lib::logging::{self, RotatingFileWriter};
use capsync_lib::{ActionQueue, ActionReport, AppState, CompareMode, QueueAction, QueueRunner};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(
    name = "capsync",
    version,
    about = "Sync capture-session folders between a workstation and a network share"
)]
struct Cli {
    /// Config directory [default: ~/.config/capsync]
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check which local files are backed up on the remote
    Compare {
        /// Only consider processing (WBPP/Processing) folders
        #[arg(long)]
        wip: bool,
    },
    /// Per-target status and recommended action
    Scan {
        /// Rebuild the remote index before comparing
        #[arg(long)]
        rebuild_index: bool,
    },
    /// Walk the remote and publish a fresh index
    RebuildIndex,
    /// Copy a target from the remote to the local root
    Pull {
        target: String,
        /// Also pull matching _FlatWizard folders
        #[arg(long)]
        flats: bool,
    },
    /// Copy a local target to the remote
    Push { target: String },
    /// Move remote-only files of a target into the remote trash
    Delete {
        target: String,
        /// Skip the last-pull checkpoint check
        #[arg(long)]
        force: bool,
    },
    /// Record a successful pull for a target now
    MarkPulled { target: String },
    /// Run a JSON queue file of actions in order
    Queue { file: PathBuf },
}

/// 初始化日志：文件层 + 控制台层，`-v` 覆盖配置中的级别
fn init_logging(config_dir: &Path, config: &logging::LogConfig, verbosity: u8) {
    let level = match verbosity {
        0 => config.tracing_level(),
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let mut env_filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["sqlx=warn", "opendal=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    // 文件日志创建失败时只输出到控制台
    let mut file_error = None;
    let file_layer = if config.enabled {
        match RotatingFileWriter::new(&logging::log_dir(config_dir), config.max_size_mb) {
            Ok(file_writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            ),
            Err(e) => {
                file_error = Some(e);
                None
            }
        }
    } else {
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Some(e) = file_error {
        tracing::warn!("无法创建日志文件: {}", e);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &ActionReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "{} {}: total={} copied={} skipped={} errors={}",
        report.action,
        report.target,
        report.total_files,
        report.copied_files,
        report.skipped_files,
        report.error_files
    );
    if report.flats.processed() > 0 {
        println!(
            "  flats: copied={} skipped={} errors={}",
            report.flats.copied, report.flats.skipped, report.flats.errors
        );
    }
    println!("  log: {}", report.log_path.display());
    Ok(())
}

fn show_progress(p: &ActionProgress) {
    tracing::debug!("[{:>3}%] {}/{} {}", p.percent(), p.processed, p.total, p.current_path);
}

async fn run_queue(engine: &SyncEngine, file: &Path, json: bool) -> Result<()> {
    let mut queue = ActionQueue::load(file)?;
    if queue.is_empty() {
        println!("queue is empty");
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = QueueRunner::new(engine);

    let printer = async {
        while let Some(event) = rx.recv().await {
            match event {
                QueueEvent::Position { current, next } => {
                    let next = next.unwrap_or_else(|| "-".to_string());
                    eprintln!("now: {}  next: {}", current, next);
                }
                QueueEvent::ItemProgress {
                    target,
                    processed,
                    total,
                } => {
                    tracing::debug!("{}: {}/{}", target, processed, total);
                }
                QueueEvent::ItemFinished { report, .. } => {
                    if let Err(e) = print_report(&report, json) {
                        tracing::warn!("输出结果失败: {:#}", e);
                    }
                }
                QueueEvent::Failed { target, message } => {
                    eprintln!("{} failed: {}", target, message);
                }
                QueueEvent::Finished => break,
            }
        }
    };

    let (result, ()) = tokio::join!(runner.run(queue.items_mut(), &tx), printer);

    if !json {
        for item in queue.items() {
            println!("{:<40} {:<12} {}", item.target, item.action, item.state.status);
        }
    }
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let state = AppState::new(cli.config_dir)?;
    init_logging(&state.config_dir, &state.config.log, cli.verbose);
    if let Some(warning) = &state.config_warning {
        tracing::warn!("{}", warning);
    }

    let engine = state.engine().await?;
    let progress = |p: &ActionProgress| show_progress(p);
    let scan_progress = |path: &str| tracing::trace!("扫描: {}", path);

    match cli.command {
        Command::Compare { wip } => {
            let mode = if wip {
                CompareMode::Wip
            } else {
                CompareMode::Images
            };
            let (folders, summary) = engine.compare(mode, Some(&scan_progress)).await?;
            if cli.json {
                print_json(&serde_json::json!({ "folders": folders, "summary": summary }))?;
            } else {
                println!(
                    "{:<40} {:>8} {:>8} {:>8} {:>8}  safe",
                    "folder", "local", "backed", "missing", "differ"
                );
                for f in &folders {
                    println!(
                        "{:<40} {:>8} {:>8} {:>8} {:>8}  {}",
                        f.folder,
                        f.local_files,
                        f.backed_up_files,
                        f.missing_on_remote_files,
                        f.different_files,
                        if f.safe_to_delete() { "yes" } else { "no" }
                    );
                }
                println!(
                    "total: local={} backed={} missing={} different={}",
                    summary.total_local_files,
                    summary.total_backed_up_files,
                    summary.total_missing_on_remote_files,
                    summary.total_different_files
                );
            }
        }
        Command::Scan { rebuild_index } => {
            let (targets, summary) = engine.scan(rebuild_index, Some(&scan_progress)).await?;
            if cli.json {
                let rows: Vec<_> = targets
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "result": t,
                            "status": t.status(),
                            "recommendedAction": t.recommended_action(),
                        })
                    })
                    .collect();
                print_json(&serde_json::json!({ "targets": rows, "summary": summary }))?;
            } else {
                println!(
                    "{:<40} {:>7} {:>7} {:>7} {:>7}  {:<18} {}",
                    "target", "remote", "local", "missing", "differ", "status", "action"
                );
                for t in &targets {
                    println!(
                        "{:<40} {:>7} {:>7} {:>7} {:>7}  {:<18} {}",
                        t.target,
                        t.remote_files,
                        t.local_files,
                        t.missing_locally_files,
                        t.different_files,
                        t.status(),
                        t.recommended_action()
                    );
                }
                println!(
                    "targets={} candidates={} up_to_date={}",
                    summary.total_targets, summary.pull_candidates, summary.up_to_date_targets
                );
            }
        }
        Command::RebuildIndex => {
            let count = engine.rebuild_remote_index(Some(&scan_progress)).await?;
            if cli.json {
                print_json(&serde_json::json!({ "indexedFiles": count }))?;
            } else {
                println!("remote index rebuilt: {} files", count);
            }
        }
        Command::Pull { target, flats } => {
            let report = engine.pull(&target, flats, Some(&progress)).await?;
            if report.success() {
                engine.mark_pulled(&target, None)?;
            }
            print_report(&report, cli.json)?;
        }
        Command::Push { target } => {
            let report = engine.push(&target, Some(&progress)).await?;
            print_report(&report, cli.json)?;
        }
        Command::Delete { target, force } => {
            let action = if force {
                QueueAction::DeleteForce
            } else {
                QueueAction::Delete
            };
            let report = engine.execute(&target, action, false, Some(&progress)).await?;
            print_report(&report, cli.json)?;
        }
        Command::MarkPulled { target } => {
            let ts = engine.mark_pulled(&target, None)?;
            if cli.json {
                print_json(&serde_json::json!({ "target": target, "lastSuccessfulPull": ts }))?;
            } else {
                println!("{}: last successful pull = {}", target, ts);
            }
        }
        Command::Queue { file } => run_queue(&engine, &file, cli.json).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_initializes_with_and_without_log_file() {
        let dir = tempfile::tempdir().unwrap();

        let disabled = logging::LogConfig {
            enabled: false,
            ..Default::default()
        };
        init_logging(dir.path(), &disabled, 0);
        assert!(!logging::log_dir(dir.path()).exists());

        init_logging(dir.path(), &logging::LogConfig::default(), 2);
        assert!(logging::log_dir(dir.path()).join(logging::LOG_FILE).exists());
    }
}
