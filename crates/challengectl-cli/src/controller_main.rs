// crates/challengectl-cli/src/controller_main.rs
// ============================================================================
// Binary: challengectl-controller
// Description: Entry point for the ChallengeCtl controller daemon.
// Purpose: Wire up the durable store, blob store, event bus, dispatch core,
//          liveness monitor, and control plane API behind a validated config
//          file, then serve until a shutdown signal arrives.
// Dependencies: axum-server, challengectl-api, challengectl-blobstore,
//               challengectl-config, challengectl-dispatch,
//               challengectl-events, challengectl-store-sqlite, clap, tokio
// ============================================================================

//! ## Overview
//! The controller is a single process owning the one writable copy of the
//! durable store (spec.md §4.1's "single-writer" contract). This binary does
//! nothing beyond: load config, construct the component graph in dependency
//! order, spawn the liveness monitor, serve HTTP, and on SIGINT/SIGTERM join
//! everything back down in reverse order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use challengectl_api::AppState;
use challengectl_blobstore::LocalBlobStore;
use challengectl_config::ControllerConfig;
use challengectl_dispatch::DispatchCore;
use challengectl_dispatch::LivenessMonitor;
use challengectl_dispatch::LivenessTunables;
use challengectl_events::EventBus;
use challengectl_store_sqlite::SqliteDurableStore;
use clap::Parser;

// ============================================================================
// SECTION: CLI
// ============================================================================

/// `challengectl-controller` command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "challengectl-controller", disable_version_flag = true)]
struct Cli {
    /// Path to the controller config YAML (defaults to `CHALLENGECTL_CONFIG`
    /// or `./challengectl.yaml`).
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
        let _ = write_stdout_line(&format!("challengectl-controller {}", env!("CARGO_PKG_VERSION")));
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = write_stderr_line(&format!("challengectl-controller: {err}"));
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
    let config = ControllerConfig::load(cli.config.as_deref())?;

    let store = SqliteDurableStore::open(config.sqlite_path.clone(), i64::try_from(config.tunables.assignment_ttl.as_millis()).unwrap_or(i64::MAX)).await?;
    let blobs = LocalBlobStore::open(config.blob_store_dir.clone()).await?;
    let events = Arc::new(EventBus::new());
    let dispatch = Arc::new(DispatchCore::new(Arc::new(store), Arc::clone(&events) as Arc<dyn challengectl_core::EventLog>));

    let liveness_tunables = LivenessTunables {
        heartbeat_timeout_ms: i64::try_from(config.tunables.heartbeat_timeout.as_millis()).unwrap_or(i64::MAX),
        stale_sweep_interval: config.tunables.stale_sweep_interval,
        expired_token_sweep_interval: config.tunables.expired_token_sweep_interval,
    };
    let monitor = LivenessMonitor::spawn(Arc::clone(&dispatch), liveness_tunables);

    let state = AppState::new(dispatch, Arc::new(blobs), events, config.provisioning_key_hash.clone())
        .with_audit_sink(Arc::new(challengectl_core::StderrAuditSink));
    let app = challengectl_api::build_router(state);

    let _ = write_stdout_line(&format!("challengectl-controller listening on {}", config.bind_addr));

    let serve_result = match &config.tls {
        Some((cert, key)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
            axum_server::bind_rustls(config.bind_addr, tls_config).serve(app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await
        }
        None => axum_server::bind(config.bind_addr).serve(app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await,
    };

    monitor.shutdown().await;
    serve_result.map_err(Into::into)
}
