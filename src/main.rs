// Chaos Orchestrator - Main Entry Point
//
// Runs one chaos experiment described by a TOML file:
// - Preflight checks against the target workload
// - Baseline load run
// - Fault injection under load
// - Recovery monitoring
// - Verdict, report and cleanup
//
// Usage: chaos-orchestrator [CONFIG_PATH]   (default: ./chaos.toml)

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use chaos_orchestrator::cancel::CancellationSignal;
use chaos_orchestrator::cluster::KubectlClient;
use chaos_orchestrator::config::{Config, DEFAULT_CONFIG_FILE};
use chaos_orchestrator::fault::{LitmusBackend, StrategyFactory};
use chaos_orchestrator::load::K6Driver;
use chaos_orchestrator::sandbox::LocalRunner;
use chaos_orchestrator::{logging, metrics, ExperimentOrchestrator};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether the experiment passed
async fn run() -> Result<bool> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = Config::load_from_path(&config_path)?;
    logging::init(&config.logging)?;

    info!("Chaos Orchestrator v{} starting...", env!("CARGO_PKG_VERSION"));

    metrics::init().context("Failed to register metrics")?;

    // Fails before any collaborator is built, so nothing disruptive can run
    let spec = config.experiment_spec()?;

    let runner = Arc::new(LocalRunner::new(
        config.command_validator(),
        config.runner_config()?,
    ));
    let cluster = Arc::new(KubectlClient::new(
        runner.clone(),
        config.sandbox.kubectl.clone(),
        config.runner_config()?.timeout,
    ));
    let backend = Arc::new(LitmusBackend::new(runner.clone(), config.litmus_config()?));
    let faults = Arc::new(StrategyFactory::new(cluster.clone(), backend.clone()));
    let load = Arc::new(K6Driver::new(runner, config.k6_config()?));

    let orchestrator =
        ExperimentOrchestrator::new(cluster, load, faults, config.orchestrator_config()?)
            .with_backend(backend);

    let cancel = CancellationSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling experiment");
                cancel.cancel();
            }
        });
    }

    let report = orchestrator.run_with_cancellation(&spec, cancel).await;
    println!("{}", report.summary());

    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = metrics::write_textfile(path) {
            error!("Failed to write metrics: {:#}", e);
        }
    }

    Ok(report.verdict.is_pass())
}
