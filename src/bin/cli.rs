//! shopwatch CLI
//!
//! Runs the scheduler, or one-shot maintenance commands, from a TOML config.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shopwatch::{
    app::App,
    clock::{Clock, SystemClock},
    error::{self, Phase, Result},
    models::Config,
    pipeline::RunOutcome,
};

/// shopwatch - second-hand shop listing watcher
#[derive(Parser, Debug)]
#[command(
    name = "shopwatch",
    version,
    about = "Watches shop listings and sends deduplicated alerts"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "shopwatch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,

    /// Run every active source once, sequentially
    Once,

    /// Validate the configuration file
    Validate,

    /// Show stored snapshot age and size per source
    Status,

    /// Delete notification records older than the retention period
    Prune,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Ctrl-C received"),
        Err(e) => {
            log::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    log::info!("Loaded configuration from {}", cli.config.display());

    if let Command::Validate = cli.command {
        config.validate()?;
        let (p1, p2) = config.tier_counts();
        log::info!(
            "Configuration is valid: {} source(s), {} active P1, {} active P2",
            config.sources.len(),
            p1,
            p2
        );
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let app = App::build(config, clock.clone())?;

    match cli.command {
        Command::Run => {
            app.scheduler().run(shutdown_signal()).await;
        }

        Command::Once => {
            let reports = app.run_once().await;
            let failed = reports.iter().filter(|r| !r.outcome.is_success()).count();
            for report in &reports {
                match &report.outcome {
                    RunOutcome::Updated { changes } => log::info!(
                        "[{}] ok: {} change(s), {} notified, {} suppressed",
                        report.source_id,
                        changes,
                        report.notified,
                        report.suppressed
                    ),
                    RunOutcome::Failed { attempts, error } => log::warn!(
                        "[{}] failed after {} attempt(s): {}",
                        report.source_id,
                        attempts,
                        error
                    ),
                    RunOutcome::CircuitOpen { retry_in } => log::warn!(
                        "[{}] circuit open, retry in {}s",
                        report.source_id,
                        retry_in.as_secs()
                    ),
                }
            }
            log::info!("Done: {} source(s), {} failed", reports.len(), failed);
        }

        Command::Status => {
            let now = clock.now();
            for status in app.status().await? {
                let age = status
                    .taken_at
                    .map(|at| format!("{}m ago", (now - at).num_minutes()))
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<24} {}  {:<8} {:>5} item(s)  updated {}",
                    status.id,
                    status.tier,
                    if status.active { "active" } else { "inactive" },
                    status.items,
                    age
                );
            }
            println!("notification records: {}", app.dedup_count().await?);
        }

        Command::Prune => {
            let removed = app.prune().await?;
            log::info!("Removed {} notification record(s)", removed);
        }

        Command::Validate => {}
    }

    Ok(())
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = execute(cli).await {
        error::report("shopwatch", &e, Phase::Startup);
        std::process::exit(1);
    }
}
