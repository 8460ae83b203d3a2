// crates/challengectl-cli/src/agent_main.rs
// ============================================================================
// Binary: challengectl-agent
// Description: Entry point for the ChallengeCtl runner agent daemon.
// Purpose: Load a validated runner config, spawn the poll/heartbeat loops,
//          and run until a shutdown signal arrives, at which point it signs
//          itself out (spec.md §4.8, C8).
// Dependencies: challengectl-config, challengectl-runner, clap, tokio
// ============================================================================

//! ## Overview
//! This binary is intentionally thin: identity resolution, registration,
//! polling, file sync, transmit dispatch, and reporting all live in
//! [`challengectl_runner::RunnerAgent`]. The only thing owned here is config
//! loading, log sink selection, and the shutdown signal wait.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use challengectl_config::RunnerConfig;
use challengectl_runner::RunnerAgent;
use challengectl_runner::StderrRunnerLog;
use clap::Parser;

// ============================================================================
// SECTION: CLI
// ============================================================================

/// `challengectl-agent` command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "challengectl-agent", disable_version_flag = true)]
struct Cli {
    /// Path to the runner agent config YAML (defaults to
    /// `CHALLENGECTL_CONFIG` or `./challengectl.yaml`).
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,
    /// Print version information and exit.
    #[arg(long)]
    version: bool,
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version {
        let _ = write_stdout_line(&format!("challengectl-agent {}", env!("CARGO_PKG_VERSION")));
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = write_stderr_line(&format!("challengectl-agent: {err}"));
            // auth-failed at register/enroll is fatal to the agent; every
            // other unrecovered error also exits non-zero so a process
            // supervisor can restart/backoff.
            ExitCode::FAILURE
        }
    }
}

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunnerConfig::load(cli.config.as_deref())?;
    let log = Arc::new(StderrRunnerLog);
    let agent = Arc::new(RunnerAgent::new(config, log).await?);
    let handle = agent.spawn().await?;

    wait_for_shutdown_signal().await?;
    handle.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<(), std::io::Error> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await
}
