//! Experiment Orchestrator
//!
//! Sequences one experiment through its phases:
//!
//! ```text
//! Preflight -> Baseline -> FaultAndLoad -> Recovery -> Report -> Cleanup
//! ```
//!
//! The first failed phase aborts the remaining experiment phases. A target
//! that does not recover in time is not a failed phase: Recovery ends
//! normally and the timeout fails the verdict. Cleanup always runs, exactly
//! once, and the caller always gets a complete `ExperimentReport` back;
//! `run` never returns an error or panics on a phase failure.
//!
//! # Concurrency
//!
//! FaultAndLoad is the only concurrent section. The fault task starts the
//! fault, confirms it to the load task, holds it for the fault duration,
//! and stops it. The load task waits for that confirmation before running,
//! so the whole measured load window overlaps the fault. A load failure
//! stops the fault early; a fault start failure cancels the load.
//!
//! The phase pipeline runs in its own task so that a panicking collaborator
//! is recorded as a failed phase instead of tearing down the caller.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel::{CancelToken, CancellationSignal};
use crate::cleanup::{CleanupCoordinator, CleanupGuard};
use crate::cluster::ClusterClient;
use crate::error::{CleanupWarning, ExperimentError};
use crate::experiment::ExperimentSpec;
use crate::fault::{ChaosBackend, FaultInjectorFactory};
use crate::load::LoadDriver;
use crate::metrics;
use crate::model::{MetricsSnapshot, PhaseLog, PhaseName, PhaseOutcome, Verdict};
use crate::preflight::PreflightValidator;
use crate::recovery::{RecoveryMonitor, DEFAULT_CONSECUTIVE_POLLS, DEFAULT_POLL_INTERVAL};
use crate::report::{
    ExperimentReport, Measurements, RecoveryStatus, ReportBuilder, ReportRenderer, VerdictPolicy,
};
use crate::sandbox::PhaseTimeout;

/// Timing and policy for experiment runs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for the preflight phase
    pub preflight_timeout: Duration,

    /// Time allowed beyond the load duration for a load run to finish
    pub load_grace: Duration,

    /// Budget for starting a fault
    pub fault_start_timeout: Duration,

    /// Budget for stopping a fault
    pub fault_stop_timeout: Duration,

    /// How long the target may take to recover
    pub recovery_timeout: Duration,

    /// Interval between recovery polls
    pub poll_interval: Duration,

    /// Consecutive healthy polls that count as recovered
    pub consecutive_polls: u32,

    /// Added to the summed phase budgets to form the run deadline
    pub deadline_slack: Duration,

    /// Budget for the cleanup phase
    pub cleanup_timeout: Duration,

    pub verdict: VerdictPolicy,

    /// Where to write the JSON report, if anywhere
    pub report_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            preflight_timeout: Duration::from_secs(60),
            load_grace: Duration::from_secs(90),
            fault_start_timeout: Duration::from_secs(120),
            fault_stop_timeout: Duration::from_secs(120),
            recovery_timeout: Duration::from_secs(300),
            poll_interval: DEFAULT_POLL_INTERVAL,
            consecutive_polls: DEFAULT_CONSECUTIVE_POLLS,
            deadline_slack: Duration::from_secs(60),
            cleanup_timeout: Duration::from_secs(120),
            verdict: VerdictPolicy::default(),
            report_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Total time a run of `spec` may take before every phase is cut short
    ///
    /// Preflight, both load runs, the fault window and recovery, plus
    /// slack. Cleanup is not bounded by the deadline.
    pub fn deadline_for(&self, spec: &ExperimentSpec) -> Duration {
        let load = spec.load().duration + self.load_grace;
        let baseline = if spec.skip_baseline() {
            Duration::ZERO
        } else {
            load
        };
        self.preflight_timeout
            + baseline
            + self.fault_start_timeout
            + spec.fault_duration()
            + self.fault_stop_timeout
            + load
            + self.recovery_timeout
            + self.deadline_slack
    }
}

/// Mutable state of one run, shared with the pipeline task
#[derive(Default)]
struct RunState {
    log: PhaseLog,
    current: Option<(PhaseName, DateTime<Utc>)>,
    measurements: Measurements,
}

type SharedState = Arc<Mutex<RunState>>;

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn begin_phase(state: &SharedState, phase: PhaseName) {
    info!(phase = %phase, "Phase started");
    lock(state).current = Some((phase, Utc::now()));
}

fn end_phase(state: &SharedState, phase: PhaseName, outcome: PhaseOutcome) {
    let mut guard = lock(state);
    let started_at = match guard.current.take() {
        Some((current, started_at)) if current == phase => started_at,
        _ => Utc::now(),
    };
    match &outcome {
        PhaseOutcome::Failed(reason) => error!(phase = %phase, "Phase failed: {}", reason),
        PhaseOutcome::Skipped => info!(phase = %phase, "Phase skipped"),
        PhaseOutcome::Success => info!(phase = %phase, "Phase succeeded"),
    }
    guard.log.record(phase, outcome, started_at);
    if let Some(result) = guard.log.last() {
        let seconds = result.duration().num_milliseconds().max(0) as f64 / 1000.0;
        metrics::observe_phase(phase, &result.outcome, seconds);
    }
}

/// Aborts the pipeline task if the run future is dropped
struct PipelineTask(JoinHandle<()>);

impl Drop for PipelineTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives experiments against injected collaborators
#[derive(Clone)]
pub struct ExperimentOrchestrator {
    load: Arc<dyn LoadDriver>,
    faults: Arc<dyn FaultInjectorFactory>,
    backend: Option<Arc<dyn ChaosBackend>>,
    preflight: PreflightValidator,
    recovery: RecoveryMonitor,
    reports: ReportBuilder,
    renderer: ReportRenderer,
    config: OrchestratorConfig,
}

impl ExperimentOrchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        load: Arc<dyn LoadDriver>,
        faults: Arc<dyn FaultInjectorFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        let recovery = RecoveryMonitor::new(cluster.clone())
            .with_poll_interval(config.poll_interval)
            .with_consecutive_polls(config.consecutive_polls);
        Self {
            load,
            faults,
            backend: None,
            preflight: PreflightValidator::new(cluster),
            recovery,
            reports: ReportBuilder::new(config.verdict.clone()),
            renderer: ReportRenderer::new(config.report_path.clone()),
            config,
        }
    }

    /// Chaos backend whose temporary resources cleanup releases
    pub fn with_backend(mut self, backend: Arc<dyn ChaosBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one experiment to completion
    pub async fn run(&self, spec: &ExperimentSpec) -> ExperimentReport {
        self.run_with_cancellation(spec, CancellationSignal::new())
            .await
    }

    /// Run one experiment, stopping early when `cancel` fires
    ///
    /// A cancelled run still stops any active fault, runs cleanup, and
    /// returns a report whose last experiment phase failed as cancelled.
    pub async fn run_with_cancellation(
        &self,
        spec: &ExperimentSpec,
        cancel: CancellationSignal,
    ) -> ExperimentReport {
        let id = Uuid::new_v4();
        let span = info_span!(
            "experiment",
            id = %id,
            target = %spec.target(),
            fault = spec.fault().label()
        );
        self.execute(id, spec, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        id: Uuid,
        spec: &ExperimentSpec,
        cancel: CancellationSignal,
    ) -> ExperimentReport {
        info!(
            "Starting experiment: {} on {} for {:?}, load {} VUs for {:?}",
            spec.fault(),
            spec.target(),
            spec.fault_duration(),
            spec.load().concurrency,
            spec.load().duration
        );

        let coordinator = Arc::new(CleanupCoordinator::new(self.backend.clone(), spec.cleanup()));
        let guard = CleanupGuard::new(coordinator.clone());
        let state: SharedState = Arc::new(Mutex::new(RunState::default()));
        let deadline = Instant::now() + self.config.deadline_for(spec);

        let pipeline = {
            let this = self.clone();
            let spec = spec.clone();
            let state = state.clone();
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { this.pipeline(&spec, &state, &coordinator, &cancel, deadline).await }
                    .in_current_span(),
            )
        };
        let mut task = PipelineTask(pipeline);

        if let Err(e) = (&mut task.0).await {
            let reason = if e.is_panic() {
                format!("aborted: {}", panic_message(e.into_panic()))
            } else {
                "aborted".to_string()
            };
            let current = lock(&state).current.map(|(phase, _)| phase);
            match current {
                Some(phase) => end_phase(&state, phase, PhaseOutcome::Failed(reason)),
                None => error!("Experiment pipeline {}", reason),
            }
        }

        let warnings = self.cleanup_phase(&state, guard).await;

        let (log, measurements) = {
            let mut run = lock(&state);
            (std::mem::take(&mut run.log), run.measurements)
        };

        metrics::record_cleanup_warnings(warnings.len());

        let report = self
            .reports
            .build_report(id, spec, log, measurements, warnings);
        metrics::record_verdict(&report.verdict);
        match &report.verdict {
            Verdict::Pass => info!("Experiment passed"),
            Verdict::Fail(reasons) => {
                warn!("Experiment failed: {}", reasons.join("; "))
            }
        }

        self.renderer.render(report).await
    }

    async fn cleanup_phase(&self, state: &SharedState, guard: CleanupGuard) -> Vec<CleanupWarning> {
        begin_phase(state, PhaseName::Cleanup);
        let budget = PhaseTimeout::new(PhaseName::Cleanup, self.config.cleanup_timeout);
        let warnings = match budget.run(async { Ok(guard.finish().await) }).await {
            Ok(warnings) => warnings,
            Err(e) => vec![CleanupWarning::new("cleanup", e.to_string())],
        };
        let outcome = if warnings.is_empty() {
            PhaseOutcome::Success
        } else {
            PhaseOutcome::Failed(format!("{} cleanup warning(s)", warnings.len()))
        };
        end_phase(state, PhaseName::Cleanup, outcome);
        warnings
    }

    /// Run one phase under its budget and the run's cancellation
    async fn run_phase<T, F>(
        &self,
        state: &SharedState,
        phase: PhaseName,
        budget: PhaseTimeout,
        cancel: &CancelToken,
        work: F,
    ) -> Result<T, ExperimentError>
    where
        F: Future<Output = Result<T, ExperimentError>>,
    {
        begin_phase(state, phase);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExperimentError::Cancelled),
            result = budget.run(work) => result,
        };
        let outcome = match &result {
            Ok(_) => PhaseOutcome::Success,
            Err(e) => PhaseOutcome::Failed(e.to_string()),
        };
        end_phase(state, phase, outcome);
        result
    }

    async fn pipeline(
        &self,
        spec: &ExperimentSpec,
        state: &SharedState,
        coordinator: &Arc<CleanupCoordinator>,
        cancel: &CancellationSignal,
        deadline: Instant,
    ) {
        let token = cancel.token();
        let remaining = || deadline.saturating_duration_since(Instant::now());

        // Preflight: nothing disruptive happens unless this succeeds
        let budget = PhaseTimeout::new(PhaseName::Preflight, self.config.preflight_timeout)
            .capped_at(remaining());
        let preflight = self.preflight.validate(spec.target());
        if self
            .run_phase(state, PhaseName::Preflight, budget, &token, preflight)
            .await
            .is_err()
        {
            return;
        }

        // Baseline
        if spec.skip_baseline() {
            begin_phase(state, PhaseName::Baseline);
            end_phase(state, PhaseName::Baseline, PhaseOutcome::Skipped);
        } else {
            let budget = PhaseTimeout::new(
                PhaseName::Baseline,
                spec.load().duration + self.config.load_grace,
            )
            .capped_at(remaining());
            let load = self.load.run_load(spec.target(), spec.load(), token.clone());
            match self
                .run_phase(state, PhaseName::Baseline, budget, &token, load)
                .await
            {
                Ok(snapshot) => lock(state).measurements.baseline = Some(snapshot),
                Err(_) => return,
            }
        }

        // Fault and load; cancellation is handled inside so the fault is
        // always stopped by the phase itself
        let budget = PhaseTimeout::new(
            PhaseName::FaultAndLoad,
            self.config.fault_start_timeout
                + spec.fault_duration()
                + self.config.fault_stop_timeout
                + self.config.load_grace,
        )
        .capped_at(remaining());
        let fault_and_load = self.fault_and_load(spec, coordinator, cancel);
        match self
            .run_phase(
                state,
                PhaseName::FaultAndLoad,
                budget,
                &CancelToken::never(),
                fault_and_load,
            )
            .await
        {
            Ok(snapshot) => lock(state).measurements.under_fault = Some(snapshot),
            Err(_) => return,
        }

        // Recovery
        let recovery_timeout = self.config.recovery_timeout;
        let budget = PhaseTimeout::new(
            PhaseName::Recovery,
            recovery_timeout + self.config.poll_interval,
        )
        .capped_at(remaining());
        // A target that never recovers is an experiment result, judged by
        // the verdict; only a failed measurement aborts the run
        let wait = async {
            match self
                .recovery
                .wait_for_recovery(spec.target(), recovery_timeout)
                .await
            {
                Ok(elapsed) => Ok(RecoveryStatus::Recovered(elapsed)),
                Err(ExperimentError::RecoveryTimeout(timeout)) => {
                    Ok(RecoveryStatus::TimedOut(timeout))
                }
                Err(e) => Err(e),
            }
        };
        let status = self
            .run_phase(state, PhaseName::Recovery, budget, &token, wait)
            .await
            .unwrap_or(RecoveryStatus::NotMeasured);
        if let RecoveryStatus::Recovered(elapsed) = status {
            metrics::record_recovery(elapsed.as_secs_f64());
        }
        lock(state).measurements.recovery = status;
        if status == RecoveryStatus::NotMeasured {
            return;
        }

        // Report: the verdict is settled here, before any rendering
        begin_phase(state, PhaseName::Report);
        let verdict = {
            let run = lock(state);
            self.reports.evaluate(&run.log, &run.measurements)
        };
        info!("Verdict: {}", verdict.label());
        end_phase(state, PhaseName::Report, PhaseOutcome::Success);
    }

    /// Start the fault, run load under it, and stop the fault
    async fn fault_and_load(
        &self,
        spec: &ExperimentSpec,
        coordinator: &CleanupCoordinator,
        cancel: &CancellationSignal,
    ) -> Result<MetricsSnapshot, ExperimentError> {
        let injector = self.faults.create(spec.fault());
        let phase_signal = cancel.child();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let target = spec.target();

        let fault_task = async {
            let start = PhaseTimeout::new(PhaseName::FaultAndLoad, self.config.fault_start_timeout)
                .run(injector.start(target, spec.fault_duration()))
                .await;
            let handle = match start {
                Ok(handle) => handle,
                Err(e) => {
                    drop(started_tx);
                    phase_signal.cancel();
                    return Err(match e {
                        ExperimentError::FaultInjection(_) => e,
                        other => ExperimentError::FaultInjection(other.to_string()),
                    });
                }
            };

            coordinator.track(handle.clone(), injector.clone());
            metrics::record_fault(spec.fault().label());
            if handle.is_partial() {
                warn!("Fault {} only partially applied", handle.id());
            }
            let _ = started_tx.send(());

            let stop_early = phase_signal.token();
            tokio::select! {
                _ = tokio::time::sleep(spec.fault_duration()) => {
                    debug!("Fault window of {:?} elapsed", spec.fault_duration());
                }
                _ = stop_early.cancelled() => {
                    info!("Stopping fault {} early", handle.id());
                }
            }

            PhaseTimeout::new(PhaseName::FaultAndLoad, self.config.fault_stop_timeout)
                .run(injector.stop(&handle))
                .await
                .map_err(|e| match e {
                    ExperimentError::FaultInjection(_) => e,
                    other => ExperimentError::FaultInjection(other.to_string()),
                })
        };

        let load_task = async {
            if started_rx.await.is_err() {
                debug!("Fault never started; load not run");
                return Err(ExperimentError::Cancelled);
            }
            let result = self
                .load
                .run_load(target, spec.load(), phase_signal.token())
                .await;
            if let Err(e) = &result {
                warn!("Load under fault failed: {}", e);
                phase_signal.cancel();
            }
            result
        };

        let (fault_result, load_result) = tokio::join!(fault_task, load_task);
        match (fault_result, load_result) {
            (Ok(()), Ok(snapshot)) => Ok(snapshot),
            (Err(fault_err), Err(ExperimentError::Cancelled)) if !cancel.is_cancelled() => {
                Err(fault_err)
            }
            (_, Err(load_err)) => Err(load_err),
            (Err(fault_err), Ok(_)) => Err(fault_err),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
