use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use drr_pipeline::{
    build_scheduler, load_env_file, run_report_once_from_env, runner_from_config, ReportConfig,
    RunOptions,
};
use drr_reports::ReportKind;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "drr-cli")]
#[command(about = "Daily records reporter command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a report once and print the result.
    Run {
        report: ReportKind,
        /// Preview only: in-memory sink, no notification.
        #[arg(long)]
        dry_run: bool,
        /// Send the notification but skip the sheet write.
        #[arg(long, conflicts_with = "sheets_only")]
        email_only: bool,
        /// Write the sheet but skip the notification.
        #[arg(long)]
        sheets_only: bool,
    },
    /// Serve the HTTP trigger, health, and status endpoints.
    Serve { report: ReportKind },
    /// Run the report on the configured cron schedule until interrupted.
    Schedule { report: ReportKind },
    /// Probe database connectivity; exits non-zero when unreachable.
    Health { report: ReportKind },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file(".env")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            report,
            dry_run,
            email_only,
            sheets_only,
        } => {
            let options = RunOptions {
                dry_run,
                email_only,
                sheets_only,
            };
            let result = run_report_once_from_env(report, options).await?;
            println!(
                "run complete: report={} status={:?} fetched={} appended={} skipped={}",
                result.report,
                result.status,
                result.rows_fetched,
                result.rows_appended,
                result.rows_skipped_as_duplicate
            );
            if let Some(error) = &result.error {
                eprintln!("error: {error}");
            }
            if let Some(error) = &result.notification_error {
                eprintln!("notification error: {error}");
            }
            if !result.status.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Serve { report } => {
            let config = ReportConfig::from_env();
            let runner =
                Arc::new(runner_from_config(&config, report, RunOptions::default()).await?);
            // Kept alive for the lifetime of the server.
            let _scheduler = if config.scheduler_enabled {
                let sched = build_scheduler(runner.clone(), &config.report_cron).await?;
                sched.start().await?;
                Some(sched)
            } else {
                None
            };
            let port: u16 = std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080);
            drr_web::serve(drr_web::AppState::new(runner), port).await?;
        }
        Commands::Schedule { report } => {
            let config = ReportConfig::from_env();
            let runner =
                Arc::new(runner_from_config(&config, report, RunOptions::default()).await?);
            let sched = build_scheduler(runner, &config.report_cron).await?;
            sched.start().await?;
            tokio::signal::ctrl_c().await?;
        }
        Commands::Health { report } => {
            let config = ReportConfig::from_env();
            let options = RunOptions {
                dry_run: true,
                ..Default::default()
            };
            let runner = runner_from_config(&config, report, options).await?;
            let healthy = runner.db_healthy().await;
            println!("db: {healthy}");
            if !healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
