use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use traffic_orchestrator::events::RunObserver;
use traffic_orchestrator::{OrchestratorConfig, RunParams, RunRegistry, RunStatus};

#[derive(Parser)]
#[command(name = "traffic-orchestrator", version, about = "Run and monitor traffic signal simulations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch one simulation and follow it until it ends.
    Run(RunArgs),
    /// Open the desktop dashboard.
    #[cfg(feature = "desktop")]
    Desktop,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value_t = 120)]
    sim_time: u32,
    #[arg(long, default_value_t = 10)]
    min_green: u32,
    #[arg(long, default_value_t = 60)]
    max_green: u32,
    /// Simulation executable (defaults to TRAFFIC_SIM_PROGRAM or python3).
    #[arg(long)]
    program: Option<String>,
    /// Argument passed to the executable; repeat for several.
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// JSON orchestrator config, used instead of TRAFFIC_SIM_* variables.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
    /// Echo simulation output as it arrives.
    #[arg(long)]
    echo: bool,
}

struct EchoObserver;

impl RunObserver for EchoObserver {
    fn on_line(&self, _run_id: &str, line: &str) {
        println!("  | {line}");
    }
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,traffic_orchestrator=info")
        }))
        .init();

    match Cli::parse().command {
        Command::Run(args) => tokio::runtime::Runtime::new()?.block_on(run_headless(args)),
        #[cfg(feature = "desktop")]
        Command::Desktop => {
            traffic_orchestrator::run();
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_headless(args: RunArgs) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_json_file(path)?,
        None => OrchestratorConfig::from_env()?,
    };
    if let Some(program) = args.program {
        config.program = program;
    }
    if !args.args.is_empty() {
        config.args = args.args;
    }
    if let Some(dir) = args.workdir {
        config.working_dir = Some(dir);
    }

    let registry = if args.echo {
        RunRegistry::with_observer(config, Arc::new(EchoObserver))
    } else {
        RunRegistry::new(config)
    };
    let params = RunParams {
        sim_time: args.sim_time,
        min_green: args.min_green,
        max_green: args.max_green,
    };
    let run_id = registry.create_run(params)?.run_id;
    tracing::info!(%run_id, "following simulation run; Ctrl-C stops it");

    let poll = Duration::from_millis(args.poll_ms.max(10));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_seen = None;

    let snapshot = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("listen for Ctrl-C")?;
                registry.stop_run(&run_id).await?;
                break registry.get_run(&run_id)?;
            }
            _ = tokio::time::sleep(poll) => {}
        }

        let snapshot = registry.get_run(&run_id)?;
        let stats = &snapshot.stats;
        let progress = (stats.phase.clone(), stats.total_vehicles, stats.total_time);
        if last_seen.as_ref() != Some(&progress) {
            println!(
                "[{}] vehicles={} time={} wait={:.2} density={:.1}% {}",
                snapshot.status,
                stats.total_vehicles,
                stats.total_time,
                stats.average_wait,
                stats.traffic_density,
                stats.phase
            );
            last_seen = Some(progress);
        }
        if snapshot.status.is_terminal() {
            break snapshot;
        }
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(if snapshot.status == RunStatus::Finished {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
