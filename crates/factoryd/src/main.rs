//! factoryd - autonomous task factory daemon
//!
//! `serve` runs the daemon; the other subcommands are one-shot operations
//! that print JSON and leave any runs they create to the daemon.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use factory_core::{FactoryConfig, Id, TaskSelector};
use factoryd::{open_storage, Collaborators, Daemon, Factory};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = ".factory/config";

#[derive(Parser)]
#[command(name = "factoryd", about = "Autonomous task factory daemon", version)]
struct Cli {
    /// Config file (key=value). Defaults to .factory/config when present.
    #[arg(long, global = true, env = "FACTORY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path; overrides db_path from the config file.
    #[arg(long, global = true, env = "FACTORY_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until SIGINT/SIGTERM.
    Serve,
    /// Check whether a project is ready for a run.
    Preflight {
        #[arg(long)]
        project: String,
        #[arg(long)]
        max_parallel: Option<u32>,
    },
    /// Queue a task on the project's active run, creating one if needed.
    Enqueue {
        #[arg(long)]
        project: String,
        #[arg(long)]
        task: String,
    },
    /// Start a run over a board column or an explicit task list.
    Start {
        #[arg(long)]
        project: String,
        #[arg(long, conflicts_with = "tasks", required_unless_present = "tasks")]
        column: Option<String>,
        #[arg(long = "task")]
        tasks: Vec<String>,
        #[arg(long)]
        max_parallel: Option<u32>,
    },
    /// Print metrics and bottleneck hints for a run.
    Metrics {
        #[arg(long)]
        run: String,
    },
    /// Remove expired worktrees of a project.
    Gc {
        #[arg(long)]
        project: String,
    },
    /// Run the CI auto-fix loop over a run's pull requests.
    Autofix {
        #[arg(long)]
        run: String,
    },
}

fn load_config(cli: &Cli) -> eyre::Result<FactoryConfig> {
    let mut config = FactoryConfig::default();
    match &cli.config {
        Some(path) => config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => config
            .load_file(Path::new(DEFAULT_CONFIG_PATH))
            .wrap_err("failed to load .factory/config")?,
        None => {}
    }
    if let Some(db) = &cli.db {
        config.db_path.clone_from(db);
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> eyre::Result<ExitCode> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(execute(config, cli.command))
}

async fn serve(config: FactoryConfig) -> eyre::Result<()> {
    let daemon = Daemon::new(config)
        .await
        .wrap_err("failed to initialize daemon")?;

    let run = daemon.run();
    tokio::pin!(run);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

        tokio::select! {
            result = &mut run => return Ok(result?),
            _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut run => return Ok(result?),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, initiating graceful shutdown"),
        }
    }

    daemon.shutdown();
    run.await?;
    Ok(())
}

/// Factory for one-shot commands; it never spawns worker loops.
async fn one_shot_factory(config: FactoryConfig) -> eyre::Result<Factory> {
    let storage = open_storage(&config).await?;
    let config = Arc::new(config);
    let collab = Collaborators::from_config(&config);
    Ok(Factory::new(storage, config, collab).without_workers())
}

async fn execute(config: FactoryConfig, command: Command) -> eyre::Result<ExitCode> {
    if let Command::Serve = command {
        serve(config).await?;
        return Ok(ExitCode::SUCCESS);
    }
    let default_parallel = config.default_max_parallel;
    let factory = one_shot_factory(config).await?;

    match command {
        Command::Serve => Ok(ExitCode::SUCCESS),
        Command::Preflight {
            project,
            max_parallel,
        } => {
            let project = Id::from_string(project);
            match factory
                .run_preflight_checks(&project, max_parallel.unwrap_or(default_parallel))
                .await
            {
                Ok(result) => {
                    print_json(&result)?;
                    Ok(exit_code(result.ok))
                }
                Err(fault) => {
                    print_json(&fault)?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Enqueue { project, task } => {
            let outcome = factory
                .auto_enqueue_task(&Id::from_string(project), &Id::from_string(task))
                .await;
            report(outcome)
        }
        Command::Start {
            project,
            column,
            tasks,
            max_parallel,
        } => {
            let selector = match column {
                Some(column) => TaskSelector::Column(column),
                None => TaskSelector::Selection(tasks.into_iter().map(Id::from_string).collect()),
            };
            let outcome = factory
                .start_run(
                    &Id::from_string(project),
                    selector,
                    max_parallel.unwrap_or(default_parallel),
                )
                .await;
            report(outcome)
        }
        Command::Metrics { run } => {
            let metrics = factory.get_factory_run_metrics(&Id::from_string(run)).await?;
            let bottlenecks = factory.get_factory_run_bottlenecks(&metrics);
            print_json(&serde_json::json!({
                "metrics": metrics,
                "bottlenecks": bottlenecks,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Gc { project } => {
            print_json(&factory.run_worktree_gc_guarded(&Id::from_string(project)).await)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Autofix { run } => {
            print_json(&factory.run_autofix(&Id::from_string(run)).await)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report<T: Serialize>(outcome: Result<T, factory_core::FactoryFault>) -> eyre::Result<ExitCode> {
    match outcome {
        Ok(value) => {
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(fault) => {
            print_json(&fault)?;
            Ok(ExitCode::FAILURE)
        }
    }
}
