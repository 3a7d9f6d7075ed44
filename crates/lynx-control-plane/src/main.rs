use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lynx_control_plane::{ControlPlane, ControlPlaneConfig, emergency::SweepReport};
use lynx_protocol::{ControlStatus, HealthSnapshot};
use std::{path::PathBuf, process::ExitCode};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lynx-control-plane", about = "Lynx autonomous task control plane")]
struct Cli {
    /// TOML config file; defaults to the per-user config when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP surface with the generator and dispatcher loops.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Raise the emergency stop and disable every autonomy flag.
    Stop {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clear the emergency stop and re-enable autonomous agents.
    Resume {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Throttle concurrency and replay budget without stopping.
    Degrade {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Print the current control flags.
    Status,
    /// Ask a running server whether it is ready.
    Ready {
        #[arg(long, default_value = "http://127.0.0.1:8900")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = ControlPlaneConfig::load(cli.config.as_deref())?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }

    match cli.command {
        Command::Serve { port } => {
            let port = port.unwrap_or(config.port);
            serve(config, port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop { reason } => {
            let report = ControlPlane::open(config)?.control().stop(reason.as_deref()).await;
            Ok(print_sweep(&report))
        }
        Command::Resume { reason } => {
            let report = ControlPlane::open(config)?.control().resume(reason.as_deref()).await;
            Ok(print_sweep(&report))
        }
        Command::Degrade { reason } => {
            let report = ControlPlane::open(config)?.control().degrade(reason.as_deref()).await;
            Ok(print_sweep(&report))
        }
        Command::Status => {
            let status = ControlPlane::open(config)?.control().status().await;
            Ok(print_status(&status))
        }
        Command::Ready { url } => ready(&url).await,
    }
}

async fn serve(config: ControlPlaneConfig, port: u16) -> Result<()> {
    let plane = ControlPlane::open(config)?;
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, draining in-flight batch");
            shutdown.cancel();
        }
    });

    plane.serve(port, shutdown).await
}

fn print_sweep(report: &SweepReport) -> ExitCode {
    println!("action:  {}", report.action.as_str());
    println!("applied: {}", report.applied.len());
    println!("failed:  {}", report.failed.len());

    if report.is_clean() {
        return ExitCode::SUCCESS;
    }
    for failure in &report.failed {
        eprintln!("  {failure}");
    }
    eprintln!("{} finished with {} failed flag writes", report.action.as_str(), report.failed.len());
    ExitCode::FAILURE
}

fn print_status(status: &ControlStatus) -> ExitCode {
    for flag in &status.flags {
        let value = flag.value.as_ref().map_or_else(|| "<unset>".to_string(), ToString::to_string);
        let owner = flag.owner.as_deref().unwrap_or("-");
        let reason = flag.reason.as_deref().unwrap_or("-");
        println!("{:<26} {:<8} owner={owner} reason={reason}", flag.key, value);
    }

    if status.errors.is_empty() {
        return ExitCode::SUCCESS;
    }
    for error in &status.errors {
        eprintln!("  {error}");
    }
    ExitCode::FAILURE
}

async fn ready(url: &str) -> Result<ExitCode> {
    let endpoint = format!("{}/readyz", url.trim_end_matches('/'));
    let response =
        reqwest::get(&endpoint).await.with_context(|| format!("failed to reach {endpoint}"))?;
    let status = response.status();
    let snapshot: HealthSnapshot =
        response.json().await.with_context(|| format!("invalid readiness body from {endpoint}"))?;

    println!("ready:           {}", snapshot.ready);
    println!("database:        {}", snapshot.checks.database);
    println!("emergency clear: {}", snapshot.checks.emergency_stop_clear);
    println!("agents alive:    {}", snapshot.checks.agents_alive);
    println!("outbox backlog:  {}", display_count(snapshot.checks.outbox_backlog));
    println!("dlq backlog:     {}", display_count(snapshot.checks.dlq_backlog));

    if status.is_success() && snapshot.ready {
        return Ok(ExitCode::SUCCESS);
    }
    for error in &snapshot.errors {
        eprintln!("  {error}");
    }
    eprintln!("{endpoint} reported not ready ({status})");
    Ok(ExitCode::FAILURE)
}

fn display_count(count: Option<u64>) -> String {
    count.map_or_else(|| "unknown".to_string(), |count| count.to_string())
}
