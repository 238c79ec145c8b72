//! mycelium-run - run engine entry point.
//!
//! Thin process wrapper around the engine: start a run, resume one, or
//! import a completed run into the ledger. Exit code 0 on success and on
//! graceful stop (state stays resumable); non-zero on terminal failure.

use clap::{Parser, Subcommand};
use mycelium_core::types::new_run_id;
use mycelium_core::{MyceliumHome, RunConfig};
use mycelium_run::catalog::Catalog;
use mycelium_run::engine::{RunEngine, STALE_RUN_THRESHOLD_MINUTES};
use mycelium_run::ledger::LedgerStore;
use mycelium_run::state::StateStore;
use mycelium_run::worker::container::{ContainerWorkerRunner, DockerCli};
use mycelium_run::worker::local::LocalWorkerRunner;
use mycelium_run::worker::WorkerRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Run engine for planned agent tasks.
#[derive(Parser)]
#[command(name = "mycelium-run")]
#[command(about = "Execute planned engineering tasks in isolated workers")]
#[command(version)]
struct Cli {
    /// Mycelium home directory (default: $MYCELIUM_HOME or ~/.mycelium)
    #[arg(long, global = true, env = "MYCELIUM_HOME")]
    home: Option<PathBuf>,

    /// Project name used for state, logs, and the ledger
    #[arg(long, global = true, default_value = "default")]
    project: String,

    /// Config file path (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run over the ready tasks
    Run {
        /// Explicit run id (defaults to a generated id)
        #[arg(long)]
        run_id: Option<String>,

        /// Run workers in-process instead of containers
        #[arg(long)]
        local_worker: bool,

        /// Worker command for the local runner
        #[arg(long, default_value = "mycelium-worker")]
        worker_cmd: String,
    },
    /// Resume a stopped run
    Resume {
        /// Run id (defaults to the latest run)
        run_id: Option<String>,

        /// Run workers in-process instead of containers
        #[arg(long)]
        local_worker: bool,

        /// Worker command for the local runner
        #[arg(long, default_value = "mycelium-worker")]
        worker_cmd: String,
    },
    /// Import a completed run's tasks into the ledger
    ImportLedger {
        /// Run id to import
        run_id: String,
    },
}

fn load_config(cli: &Cli) -> eyre::Result<RunConfig> {
    match &cli.config {
        Some(path) => Ok(RunConfig::from_file(path)?),
        None => Ok(RunConfig::default()),
    }
}

fn build_worker(
    config: &RunConfig,
    run_id: &str,
    project: &str,
    local: bool,
    worker_cmd: &str,
) -> Arc<dyn WorkerRunner> {
    if local {
        Arc::new(LocalWorkerRunner::new(run_id, worker_cmd))
    } else {
        Arc::new(ContainerWorkerRunner::new(
            Arc::new(DockerCli::new()),
            project,
            run_id,
            config.docker.clone(),
        ))
    }
}

async fn drive(engine: RunEngine, resume: bool) -> eyre::Result<i32> {
    let stop = engine.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt; requesting graceful stop");
            stop.cancel();
        }
    });

    let outcome = if resume { engine.resume().await } else { engine.run().await };
    match outcome {
        Ok(outcome) => {
            info!(
                run_id = %outcome.run_id,
                status = outcome.status.as_str(),
                reason = outcome.stop_reason.as_deref().unwrap_or("-"),
                "run finished"
            );
            Ok(outcome.exit_code())
        }
        Err(err) => {
            eprintln!("{}", err.to_user_error());
            Ok(1)
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "{}",
                mycelium_core::UserError::new("config.invalid", "Invalid configuration", err.to_string())
                    .with_hint("check the config file against the documented keys")
            );
            std::process::exit(1);
        }
    };
    let home = MyceliumHome::resolve(cli.home.as_deref());

    let exit_code = match &cli.command {
        Command::Run {
            run_id,
            local_worker,
            worker_cmd,
        } => {
            let run_id = run_id.clone().unwrap_or_else(new_run_id);
            let worker = build_worker(&config, &run_id, &cli.project, *local_worker, worker_cmd);
            let engine = RunEngine::new(config, home, &cli.project, run_id, worker);
            drive(engine, false).await?
        }
        Command::Resume {
            run_id,
            local_worker,
            worker_cmd,
        } => {
            let store = StateStore::new(home.clone(), &cli.project);
            let run_id = match run_id.clone() {
                Some(id) => Some(id),
                None => store.latest_run_id(chrono::Duration::minutes(STALE_RUN_THRESHOLD_MINUTES))?,
            };
            let Some(run_id) = run_id else {
                eprintln!(
                    "{}",
                    mycelium_core::UserError::new(
                        "run.not_found",
                        "No run to resume",
                        "no prior run state was found for this project",
                    )
                );
                std::process::exit(1);
            };
            let worker = build_worker(&config, &run_id, &cli.project, *local_worker, worker_cmd);
            let engine = RunEngine::new(config, home, &cli.project, run_id, worker);
            drive(engine, true).await?
        }
        Command::ImportLedger { run_id } => {
            let store = StateStore::new(home.clone(), &cli.project);
            let catalog = Catalog::new(config.tasks_root());
            let ledger = LedgerStore::new(home.ledger_path(&cli.project));
            match store
                .load(run_id)
                .map_err(Into::into)
                .and_then(|state| ledger.import_from_run_state(&state, &catalog))
            {
                Ok(summary) => {
                    println!(
                        "imported {} task(s), skipped {}",
                        summary.imported, summary.skipped
                    );
                    for skip in &summary.skipped_details {
                        println!("  skipped {}: {}", skip.task_id, skip.reason);
                    }
                    0
                }
                Err(err) => {
                    error!(error = %err, "ledger import failed");
                    eprintln!(
                        "{}",
                        mycelium_core::UserError::new(
                            "ledger.import_failed",
                            "Ledger import failed",
                            err.to_string(),
                        )
                    );
                    1
                }
            }
        }
    };

    std::process::exit(exit_code);
}
