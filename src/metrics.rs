// Prometheus metrics for the chaos orchestrator
//
// Written as a text exposition at the end of a run (node-exporter textfile
// collector style):
// - Experiments by verdict (counter)
// - Phase durations by phase and outcome (histogram)
// - Faults injected by kind (counter)
// - Cleanup warnings (counter)
// - Recovery time (histogram)

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::Arc;
use std::sync::Once;

use crate::model::{PhaseName, PhaseOutcome, Verdict};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref EXPERIMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("chaos_experiments_total", "Experiments completed, by verdict"),
        &["verdict"]
    ).expect("Failed to create experiments metric");

    pub static ref PHASE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("chaos_phase_duration_seconds", "Experiment phase duration in seconds")
            .buckets(vec![0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["phase", "outcome"]
    ).expect("Failed to create phase duration metric");

    pub static ref FAULTS_INJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("chaos_faults_injected_total", "Faults started, by kind"),
        &["kind"]
    ).expect("Failed to create faults injected metric");

    pub static ref CLEANUP_WARNINGS_TOTAL: IntCounter = IntCounter::new(
        "chaos_cleanup_warnings_total",
        "Non-fatal problems found while releasing experiment resources"
    ).expect("Failed to create cleanup warnings metric");

    pub static ref RECOVERY_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("chaos_recovery_seconds", "Time for the target to return to steady state")
            .buckets(vec![5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    ).expect("Failed to create recovery time metric");
}

static INIT: Once = Once::new();

/// Register every metric with the registry; later calls are no-ops
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
    });
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(EXPERIMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PHASE_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(FAULTS_INJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CLEANUP_WARNINGS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECOVERY_SECONDS.clone()))?;
    Ok(())
}

pub fn observe_phase(phase: PhaseName, outcome: &PhaseOutcome, seconds: f64) {
    PHASE_DURATION_SECONDS
        .with_label_values(&[phase.as_str(), outcome.label()])
        .observe(seconds);
}

pub fn record_fault(kind: &str) {
    FAULTS_INJECTED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_verdict(verdict: &Verdict) {
    EXPERIMENTS_TOTAL.with_label_values(&[verdict.label()]).inc();
}

pub fn record_cleanup_warnings(count: usize) {
    CLEANUP_WARNINGS_TOTAL.inc_by(count as u64);
}

pub fn record_recovery(seconds: f64) {
    RECOVERY_SECONDS.observe(seconds);
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

/// Write the text exposition to a file
pub fn write_textfile(path: &std::path::Path) -> anyhow::Result<()> {
    use anyhow::Context;

    let body = gather_metrics()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create metrics directory {}", parent.display()))?;
    }
    std::fs::write(path, body)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_experiment_metrics_exported() {
        init().unwrap();
        record_verdict(&Verdict::Pass);
        record_fault("instance-kill");
        observe_phase(PhaseName::Preflight, &PhaseOutcome::Success, 0.5);

        let text = gather_metrics().unwrap();
        assert!(text.contains("chaos_experiments_total"));
        assert!(text.contains("verdict=\"pass\""));
        assert!(text.contains("kind=\"instance-kill\""));
        assert!(text.contains("phase=\"preflight\""));
    }

    #[test]
    fn test_write_textfile() {
        init().unwrap();
        CLEANUP_WARNINGS_TOTAL.inc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textfile/chaos.prom");
        write_textfile(&path).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("chaos_cleanup_warnings_total"));
    }
}
