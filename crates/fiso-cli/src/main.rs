//! `fiso`: the process entrypoint. Loads a YAML config, wires up every
//! configured flow, and runs until a shutdown signal arrives.

mod wiring;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fiso_publisher_pool::PublisherPool;
use fiso_server_pool::ServerPool;
use fiso_wasm_manager::AppManager;
use tokio_util::sync::CancellationToken;

/// The drain deadline a running flow is given after a shutdown signal
/// before it is abandoned (§4.1, §5).
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "fiso", version, about = "Event-pipeline fabric")]
struct Cli {
    /// Path to the fiso.yaml configuration file.
    #[arg(short, long, default_value = "fiso.yaml", env = "FISO_CONFIG")]
    config: std::path::PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("fiso: failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fiso: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = fiso_config::load_config(&cli.config)?;
    let _flush_guard = fiso_tracing::init_tracing(&config.observability)?;
    let metrics_handle = fiso_tracing::init_metrics()?;

    tracing::info!(config = %cli.config.display(), flows = config.flows.len(), "fiso starting");

    let server_pool = Arc::new(ServerPool::new());
    let publisher_pool = Arc::new(PublisherPool::new());

    if let Some(addr) = &config.server.default_addr {
        let addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid server.default_addr {addr:?}: {err}"))?;
        server_pool.register_metrics(addr, "/metrics", metrics_handle).await?;
    }

    let built_flows = wiring::build_flows(&config, &server_pool, &publisher_pool).await?;

    server_pool.start().await?;
    server_pool.wait_ready().await;

    let cancel = CancellationToken::new();

    let app_manager = Arc::new(AppManager::default());
    for app_cfg in &config.wasm_apps {
        app_manager.start_app(app_cfg.clone()).await?;
    }

    let mut flow_tasks = Vec::with_capacity(built_flows.len());
    for built in built_flows {
        let flow_name = built.flow.name.clone();
        let pipeline = fiso_pipeline::Pipeline::new(built.flow, built.source, built.transformer, built.sink, built.dlq);
        let flow_cancel = cancel.clone();
        flow_tasks.push((
            flow_name,
            tokio::spawn(async move { pipeline.run(flow_cancel).await }),
        ));
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining flows");
    cancel.cancel();

    for (flow_name, task) in flow_tasks {
        match tokio::time::timeout(DRAIN_DEADLINE, task).await {
            Ok(Ok(Ok(()))) => tracing::info!(flow = %flow_name, "flow stopped cleanly"),
            Ok(Ok(Err(err))) => tracing::error!(flow = %flow_name, %err, "flow stopped with an error"),
            Ok(Err(join_err)) => tracing::error!(flow = %flow_name, %join_err, "flow task panicked"),
            Err(_elapsed) => tracing::warn!(flow = %flow_name, "flow did not drain within the deadline"),
        }
    }

    app_manager.stop_all().await?;
    server_pool.close().await?;
    tracing::info!("fiso stopped");
    Ok(())
}

/// Waits for either Ctrl-C or (on unix) SIGTERM, whichever arrives first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
