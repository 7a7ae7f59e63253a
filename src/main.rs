// ABOUTME: CLI entry point for branch-replicator
// ABOUTME: Parses commands and runs sync cycles or on-demand verification

use anyhow::Context;
use branch_replicator::report::CycleReport;
use branch_replicator::store::MatrixOneConnector;
use branch_replicator::verify::{Verdict, VerifyMode, VerifyReport};
use branch_replicator::{SyncConfig, SyncEngine};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "branch-replicator")]
#[command(about = "Snapshot-diff replication between MatrixOne tables and databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum VerifyArg {
    Full,
    Fast,
}

impl From<VerifyArg> for VerifyMode {
    fn from(arg: VerifyArg) -> Self {
        match arg {
            VerifyArg::Full => VerifyMode::Full,
            VerifyArg::Fast => VerifyMode::Fast,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate the configured table or database on an interval
    Sync {
        /// Path to the task configuration file
        #[arg(long, env = "BRANCH_REPLICATOR_CONFIG", default_value = "branch-replicator.toml")]
        config: PathBuf,
        /// Run a single cycle and exit (non-zero on failure)
        #[arg(long)]
        once: bool,
        /// Override the configured interval between cycles, in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
        /// Verify every synced table after a single cycle
        #[arg(long, value_enum, requires = "once")]
        verify: Option<VerifyArg>,
        /// Print the cycle report as JSON
        #[arg(long, requires = "once")]
        json: bool,
    },
    /// Compare destination tables against the source
    Verify {
        /// Path to the task configuration file
        #[arg(long, env = "BRANCH_REPLICATOR_CONFIG", default_value = "branch-replicator.toml")]
        config: PathBuf,
        #[arg(long, value_enum, default_value = "full")]
        mode: VerifyArg,
        /// Print verification reports as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Sync {
            config,
            once,
            interval,
            verify,
            json,
        } => {
            let mut config = SyncConfig::load(&config)?;
            if let Some(secs) = interval {
                config.sync.interval_secs = secs;
                config
                    .validate()
                    .context("Invalid sync settings after command-line overrides")?;
            }
            let engine = build_engine(config)?;

            if once {
                let report = engine.run_cycle(verify.map(VerifyMode::from)).await;
                print_cycle(&report, json)?;
                if !report.succeeded() || report.verification_failed() {
                    std::process::exit(1);
                }
                return Ok(());
            }

            tracing::info!("Starting continuous sync for task {}", engine.task_key());
            tracing::info!("Press Ctrl+C to stop");

            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
            let shutdown_tx_clone = shutdown_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                tracing::info!("Received shutdown signal; finishing the current cycle");
                let _ = shutdown_tx_clone.send(());
            });

            engine.run(shutdown_rx).await
        }
        Commands::Verify { config, mode, json } => {
            let config = SyncConfig::load(&config)?;
            let engine = build_engine(config)?;
            let reports = engine
                .verify(VerifyMode::from(mode))
                .await
                .context("Verification could not run")?;
            print_verify(&reports, json)?;
            if reports.iter().any(|r| r.verdict != Verdict::Pass) {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn build_engine(config: SyncConfig) -> anyhow::Result<SyncEngine> {
    let connector =
        MatrixOneConnector::new(config.source.clone(), config.destination.clone());
    SyncEngine::new(config, Arc::new(connector))
}

fn print_cycle(report: &CycleReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!();
    println!("========================================");
    println!("Sync cycle {:?} ({}ms)", report.status, report.duration_ms);
    println!("========================================");
    for table in &report.tables {
        let mode = table.mode.map(|m| m.as_str()).unwrap_or("-");
        println!(
            "  {}: {:?} {} snapshot={}",
            table.table,
            table.status,
            mode,
            table.snapshot.as_deref().unwrap_or("-")
        );
        if let Some(verify) = &table.verify {
            println!("    verify ({}): {}", verify.mode.as_str(), verify.verdict.as_str());
        }
        if let Some(error) = &table.error {
            println!("    error: {}", error.message);
        }
    }
    if let Some(error) = &report.error {
        println!("  error: {}", error.message);
    }
    Ok(())
}

fn print_verify(reports: &[VerifyReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }

    for report in reports {
        let counts = match (report.source, report.destination) {
            (Some(src), Some(dst)) => format!("rows {} / {}", src.count, dst.count),
            _ => "rows unavailable".to_string(),
        };
        println!(
            "{} [{}{}]: {} ({})",
            report.table,
            report.mode.as_str(),
            if report.sampled { ", sampled" } else { "" },
            report.verdict.as_str(),
            counts
        );
        if let Some(detail) = &report.detail {
            println!("  {}", detail);
        }
    }
    Ok(())
}
