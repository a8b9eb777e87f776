use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use courier_adapters::{StatusMapper, WASEET_STATUS_TABLE};
use courier_sync::{run_sync_once_from_env, PassOutcome, SyncConfig, SyncPolicy, SyncService};
use courier_web::AppState;
use tracing::{info, warn};

mod logging;

use logging::{init_logging, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "courier-cli")]
#[command(about = "Courier status reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and exit.
    Sync,
    /// Run the scheduler and the ops endpoint until interrupted.
    Serve,
    /// Print the courier status table, or map a single code/text.
    StatusMap {
        #[arg(long)]
        code: Option<i64>,
        #[arg(long, default_value = "")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging(LogFormat::from_env());
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            match run_sync_once_from_env().await? {
                PassOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                PassOutcome::Busy => println!("sync already in progress"),
                PassOutcome::Failed { stage, error } => bail!("sync failed while {stage}: {error}"),
            }
        }
        Commands::Serve => {
            let service = SyncService::from_env().await?;
            if service.config.scheduler_enabled {
                service.scheduler.start().await?;
            } else {
                info!("scheduler disabled; passes run only on demand");
            }

            let state = AppState::new(service.scheduler.clone());
            courier_web::serve(state, service.config.web_port, shutdown_signal()).await?;

            if service.scheduler.is_running().await {
                service.scheduler.stop().await?;
            }
        }
        Commands::StatusMap { code, text } => {
            let config = SyncConfig::from_env();
            let policy = SyncPolicy::load(&config.policy_path)?;
            let mapper = StatusMapper::default().with_overrides(policy.status_overrides.clone());
            match code {
                Some(code) => println!(
                    "{code}\t{}\t{}",
                    mapper.map(code, &text),
                    mapper.reference_text(code).unwrap_or("(unknown code)")
                ),
                None => {
                    for entry in WASEET_STATUS_TABLE {
                        println!(
                            "{}\t{}\t{}",
                            entry.code,
                            mapper.map(entry.code, ""),
                            entry.texts.join(" | ")
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
