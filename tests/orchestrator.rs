//! End-to-end experiment runs against fake collaborators
//!
//! Every collaborator is injected through its trait. Time is paused, so
//! fault windows, load runs and recovery polling complete instantly while
//! keeping their relative ordering.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chaos_orchestrator::cancel::{CancelToken, CancellationSignal};
use chaos_orchestrator::cluster::{ClusterClient, Readiness, TerminationOutcome};
use chaos_orchestrator::fault::{
    AppliedChaos, ChaosAction, ChaosBackend, FaultHandle, FaultInjector, FaultInjectorFactory,
};
use chaos_orchestrator::load::LoadDriver;
use chaos_orchestrator::report::ArtifactStatus;
use chaos_orchestrator::{
    CleanupWarning, ExperimentError, ExperimentOrchestrator, ExperimentReport, ExperimentSpec,
    FaultKind, LoadProfile, MetricsSnapshot, OrchestratorConfig, PhaseName, PhaseOutcome,
    TargetRef, Verdict,
};

/// Ordered record of collaborator calls shared by all fakes
#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<&'static str>>>);

impl Events {
    fn push(&self, event: &'static str) {
        self.0.lock().unwrap().push(event);
    }

    fn all(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

struct FakeCluster {
    namespace_exists: bool,
    readiness: Mutex<VecDeque<Readiness>>,
    fallback: Readiness,
}

impl FakeCluster {
    fn healthy() -> Self {
        Self {
            namespace_exists: true,
            readiness: Mutex::new(VecDeque::new()),
            fallback: Readiness::new(3, 3),
        }
    }

    /// Healthy for preflight, degraded forever afterwards
    fn never_recovers() -> Self {
        Self {
            namespace_exists: true,
            readiness: Mutex::new(VecDeque::from([Readiness::new(3, 3)])),
            fallback: Readiness::new(3, 1),
        }
    }

    fn missing_namespace() -> Self {
        Self {
            namespace_exists: false,
            ..Self::healthy()
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn check_connectivity(&self) -> Result<(), ExperimentError> {
        Ok(())
    }

    async fn namespace_exists(&self, _namespace: &str) -> Result<bool, ExperimentError> {
        Ok(self.namespace_exists)
    }

    async fn workload_exists(&self, _target: &TargetRef) -> Result<bool, ExperimentError> {
        Ok(true)
    }

    async fn readiness(&self, _target: &TargetRef) -> Result<Readiness, ExperimentError> {
        Ok(self
            .readiness
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback))
    }

    async fn terminate_instances(
        &self,
        _target: &TargetRef,
    ) -> Result<TerminationOutcome, ExperimentError> {
        Ok(TerminationOutcome::default())
    }
}

enum LoadStep {
    /// Run for the full duration and report the snapshot
    Snapshot(MetricsSnapshot),
    /// Give up halfway through as if the engine was cancelled
    CancelledMidRun,
    /// Never return
    Hang,
    /// Panic halfway through
    Panic,
}

struct FakeLoad {
    steps: Mutex<VecDeque<LoadStep>>,
    calls: AtomicUsize,
    events: Events,
}

impl FakeLoad {
    fn new(events: &Events, steps: Vec<LoadStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            events: events.clone(),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoadDriver for FakeLoad {
    async fn run_load(
        &self,
        _target: &TargetRef,
        profile: &LoadProfile,
        cancel: CancelToken,
    ) -> Result<MetricsSnapshot, ExperimentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.push("load");
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(LoadStep::Hang);

        match step {
            LoadStep::Snapshot(snapshot) => {
                tokio::select! {
                    _ = tokio::time::sleep(profile.duration) => Ok(snapshot),
                    _ = cancel.cancelled() => Err(ExperimentError::Cancelled),
                }
            }
            LoadStep::CancelledMidRun => {
                tokio::time::sleep(profile.duration / 2).await;
                Err(ExperimentError::Cancelled)
            }
            LoadStep::Hang => {
                std::future::pending::<()>().await;
                Err(ExperimentError::LoadRun("unreachable".into()))
            }
            LoadStep::Panic => {
                tokio::time::sleep(profile.duration / 2).await;
                panic!("load engine crashed");
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    starts: AtomicUsize,
    stop_attempts: AtomicUsize,
    stops: AtomicUsize,
}

struct FakeInjector {
    kind: FaultKind,
    fail_start: bool,
    fail_first_stop: bool,
    counters: Arc<Counters>,
    events: Events,
}

#[async_trait]
impl FaultInjector for FakeInjector {
    fn kind(&self) -> &FaultKind {
        &self.kind
    }

    async fn start(
        &self,
        target: &TargetRef,
        _duration: Duration,
    ) -> Result<FaultHandle, ExperimentError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.events.push("start");
        if self.fail_start {
            return Err(ExperimentError::FaultInjection("no permission".into()));
        }
        Ok(FaultHandle::new(
            self.kind.clone(),
            target.clone(),
            vec!["pod/checkout-0".into()],
            false,
        ))
    }

    async fn stop(&self, handle: &FaultHandle) -> Result<(), ExperimentError> {
        handle
            .stop_once(|| async {
                let attempt = self.counters.stop_attempts.fetch_add(1, Ordering::SeqCst);
                if self.fail_first_stop && attempt == 0 {
                    return Err(ExperimentError::FaultInjection("stop denied".into()));
                }
                self.counters.stops.fetch_add(1, Ordering::SeqCst);
                self.events.push("stop");
                Ok(())
            })
            .await
    }
}

struct FakeFactory {
    fail_start: bool,
    fail_first_stop: bool,
    counters: Arc<Counters>,
    events: Events,
}

impl FakeFactory {
    fn new(events: &Events) -> Self {
        Self {
            fail_start: false,
            fail_first_stop: false,
            counters: Arc::new(Counters::default()),
            events: events.clone(),
        }
    }

    fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    fn stop_attempts(&self) -> usize {
        self.counters.stop_attempts.load(Ordering::SeqCst)
    }
}

impl FaultInjectorFactory for FakeFactory {
    fn create(&self, kind: &FaultKind) -> Arc<dyn FaultInjector> {
        Arc::new(FakeInjector {
            kind: kind.clone(),
            fail_start: self.fail_start,
            fail_first_stop: self.fail_first_stop,
            counters: self.counters.clone(),
            events: self.events.clone(),
        })
    }
}

#[derive(Default)]
struct TempBackend {
    releases: AtomicUsize,
}

#[async_trait]
impl ChaosBackend for TempBackend {
    async fn apply(
        &self,
        _target: &TargetRef,
        _action: ChaosAction,
        _duration: Duration,
    ) -> Result<AppliedChaos, ExperimentError> {
        Ok(AppliedChaos::default())
    }

    async fn revert(&self, _target: &TargetRef, _resources: &[String]) -> Result<(), ExperimentError> {
        Ok(())
    }

    async fn release_temporary(&self) -> Vec<CleanupWarning> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Vec::new()
    }
}

fn snapshot(error_rate: f64, p99: f64) -> MetricsSnapshot {
    MetricsSnapshot::new(error_rate, p99, 100.0, 100.0 - error_rate).unwrap()
}

fn spec() -> ExperimentSpec {
    ExperimentSpec::new(
        TargetRef::new("shop", "checkout").unwrap(),
        FaultKind::InstanceKill,
        Duration::from_secs(60),
        LoadProfile {
            concurrency: 10,
            duration: Duration::from_secs(30),
        },
        true,
    )
    .unwrap()
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        preflight_timeout: Duration::from_secs(10),
        load_grace: Duration::from_secs(5),
        fault_start_timeout: Duration::from_secs(10),
        fault_stop_timeout: Duration::from_secs(10),
        recovery_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_secs(1),
        consecutive_polls: 2,
        deadline_slack: Duration::from_secs(10),
        cleanup_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

fn orchestrator(
    cluster: FakeCluster,
    load: &Arc<FakeLoad>,
    faults: &Arc<FakeFactory>,
) -> ExperimentOrchestrator {
    ExperimentOrchestrator::new(Arc::new(cluster), load.clone(), faults.clone(), config())
}

fn trail(report: &ExperimentReport) -> Vec<(PhaseName, &'static str)> {
    report
        .phases
        .iter()
        .map(|r| (r.phase, r.outcome.label()))
        .collect()
}

fn assert_well_formed(report: &ExperimentReport) {
    let last = report.final_phase().expect("report has phases");
    assert_eq!(last.phase, PhaseName::Cleanup);
    assert_eq!(
        report
            .phases
            .iter()
            .filter(|r| r.phase == PhaseName::Cleanup)
            .count(),
        1
    );
    for pair in report.phases.windows(2) {
        assert!(pair[0].ended_at <= pair[1].started_at);
    }
    for result in &report.phases {
        assert!(result.started_at <= result.ended_at);
    }
}

#[tokio::test(start_paused = true)]
async fn test_passing_experiment_runs_every_phase() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![
            LoadStep::Snapshot(snapshot(0.5, 120.0)),
            LoadStep::Snapshot(snapshot(3.2, 450.0)),
        ],
    ));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(report.verdict, Verdict::Pass);
    assert_eq!(
        trail(&report),
        vec![
            (PhaseName::Preflight, "success"),
            (PhaseName::Baseline, "success"),
            (PhaseName::FaultAndLoad, "success"),
            (PhaseName::Recovery, "success"),
            (PhaseName::Report, "success"),
            (PhaseName::Cleanup, "success"),
        ]
    );
    assert_well_formed(&report);

    // Load under fault only starts once the fault is confirmed
    assert_eq!(events.all(), vec!["load", "start", "load", "stop"]);
    assert_eq!(faults.starts(), 1);
    assert_eq!(faults.stops(), 1);

    assert_eq!(report.baseline, Some(snapshot(0.5, 120.0)));
    assert_eq!(report.under_fault, Some(snapshot(3.2, 450.0)));
    let deltas = report.deltas.unwrap();
    assert!((deltas.error_rate - 2.7).abs() < 1e-9);
    assert_eq!(report.recovery_duration, Some(Duration::from_secs(1)));
    assert!(report.cleanup_warnings.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_error_rate_regression_fails() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![
            LoadStep::Snapshot(snapshot(0.5, 120.0)),
            LoadStep::Snapshot(snapshot(8.0, 450.0)),
        ],
    ));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert!(!report.verdict.is_pass());
    assert!(report
        .verdict
        .reasons()
        .contains(&"error-rate regression 7.5 > 5.0".to_string()));
    // Every phase still ran; the verdict alone carries the failure
    assert_eq!(report.phases.len(), 6);
    assert_eq!(faults.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_timeout_fails_verdict() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![
            LoadStep::Snapshot(snapshot(0.5, 120.0)),
            LoadStep::Snapshot(snapshot(1.0, 200.0)),
        ],
    ));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::never_recovers(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(report.verdict, Verdict::Fail(vec!["recovery timeout".to_string()]));
    assert_eq!(report.recovery_duration, None);
    // Not recovering is a result, not an abort: the run still reports
    assert_eq!(
        trail(&report),
        vec![
            (PhaseName::Preflight, "success"),
            (PhaseName::Baseline, "success"),
            (PhaseName::FaultAndLoad, "success"),
            (PhaseName::Recovery, "success"),
            (PhaseName::Report, "success"),
            (PhaseName::Cleanup, "success"),
        ]
    );
    assert_eq!(faults.stops(), 1);
    assert_well_formed(&report);
}

#[tokio::test(start_paused = true)]
async fn test_missing_namespace_never_injects() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(&events, vec![]));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::missing_namespace(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(
        trail(&report),
        vec![(PhaseName::Preflight, "failed"), (PhaseName::Cleanup, "success")]
    );
    match &report.phases[0].outcome {
        PhaseOutcome::Failed(reason) => assert!(reason.contains("namespace 'shop' does not exist")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(faults.starts(), 0);
    assert_eq!(load.calls(), 0);
    assert!(events.all().is_empty());
    assert!(!report.verdict.is_pass());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_load_stops_fault_once() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![
            LoadStep::Snapshot(snapshot(0.5, 120.0)),
            LoadStep::CancelledMidRun,
        ],
    ));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(faults.starts(), 1);
    assert_eq!(faults.stops(), 1);
    assert_eq!(
        trail(&report),
        vec![
            (PhaseName::Preflight, "success"),
            (PhaseName::Baseline, "success"),
            (PhaseName::FaultAndLoad, "failed"),
            (PhaseName::Cleanup, "success"),
        ]
    );
    assert_eq!(
        report.phases[2].outcome,
        PhaseOutcome::Failed("Cancelled".to_string())
    );
    assert!(report.under_fault.is_none());
    assert!(!report.verdict.is_pass());
    assert_well_formed(&report);
}

#[tokio::test(start_paused = true)]
async fn test_run_cancellation_stops_fault_and_cleans_up() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![
            LoadStep::Snapshot(snapshot(0.5, 120.0)),
            LoadStep::Snapshot(snapshot(1.0, 200.0)),
        ],
    ));
    let faults = Arc::new(FakeFactory::new(&events));
    let backend = Arc::new(TempBackend::default());
    let orchestrator =
        orchestrator(FakeCluster::healthy(), &load, &faults).with_backend(backend.clone());

    let cancel = CancellationSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        // Baseline takes 30s; cancel inside the fault window
        tokio::time::sleep(Duration::from_secs(45)).await;
        trigger.cancel();
    });

    let report = orchestrator.run_with_cancellation(&spec(), cancel).await;

    assert_eq!(faults.stops(), 1);
    assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
    assert_eq!(
        report.phases[2].outcome,
        PhaseOutcome::Failed("Cancelled".to_string())
    );
    assert_eq!(report.phases.len(), 4);
    assert_well_formed(&report);
}

#[tokio::test(start_paused = true)]
async fn test_fault_start_failure_skips_load_under_fault() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![LoadStep::Snapshot(snapshot(0.5, 120.0))],
    ));
    let faults = Arc::new(FakeFactory {
        fail_start: true,
        ..FakeFactory::new(&events)
    });

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(load.calls(), 1);
    assert_eq!(faults.stops(), 0);
    assert_eq!(events.all(), vec!["load", "start"]);
    match &report.phases[2].outcome {
        PhaseOutcome::Failed(reason) => assert!(reason.contains("no permission")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(report
        .verdict
        .reasons()
        .iter()
        .any(|r| r.starts_with("fault_and_load failed")));
    assert_well_formed(&report);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fault_stop_is_retried_by_cleanup() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![
            LoadStep::Snapshot(snapshot(0.5, 120.0)),
            LoadStep::Snapshot(snapshot(1.0, 200.0)),
        ],
    ));
    let faults = Arc::new(FakeFactory {
        fail_first_stop: true,
        ..FakeFactory::new(&events)
    });

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(
        trail(&report),
        vec![
            (PhaseName::Preflight, "success"),
            (PhaseName::Baseline, "success"),
            (PhaseName::FaultAndLoad, "failed"),
            (PhaseName::Cleanup, "success"),
        ]
    );
    // The window-end stop failed; cleanup reversed the fault
    assert_eq!(faults.stop_attempts(), 2);
    assert_eq!(faults.stops(), 1);
    assert!(report.cleanup_warnings.is_empty());
    assert_eq!(
        report.verdict,
        Verdict::Fail(vec![
            "fault_and_load failed: Fault injection failed: stop denied".to_string()
        ])
    );
    assert_well_formed(&report);
}

#[tokio::test(start_paused = true)]
async fn test_hung_load_under_fault_times_out() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![LoadStep::Snapshot(snapshot(0.5, 120.0)), LoadStep::Hang],
    ));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(
        trail(&report),
        vec![
            (PhaseName::Preflight, "success"),
            (PhaseName::Baseline, "success"),
            (PhaseName::FaultAndLoad, "failed"),
            (PhaseName::Cleanup, "success"),
        ]
    );
    match &report.phases[2].outcome {
        PhaseOutcome::Failed(reason) => assert!(reason.contains("timed out")),
        other => panic!("unexpected outcome {:?}", other),
    }
    // Stopped at the end of the window; cleanup finds nothing left to do
    assert_eq!(faults.starts(), 1);
    assert_eq!(faults.stops(), 1);
    assert_eq!(faults.stop_attempts(), 1);
    assert!(report.under_fault.is_none());
    assert_well_formed(&report);
}

#[tokio::test(start_paused = true)]
async fn test_hung_baseline_times_out() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(&events, vec![LoadStep::Hang]));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(
        trail(&report),
        vec![
            (PhaseName::Preflight, "success"),
            (PhaseName::Baseline, "failed"),
            (PhaseName::Cleanup, "success"),
        ]
    );
    match &report.phases[1].outcome {
        PhaseOutcome::Failed(reason) => assert!(reason.contains("timed out")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(faults.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_load_still_releases_fault() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![LoadStep::Snapshot(snapshot(0.5, 120.0)), LoadStep::Panic],
    ));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec())
        .await;

    assert_eq!(faults.starts(), 1);
    assert_eq!(faults.stops(), 1);
    match &report.phases[2].outcome {
        PhaseOutcome::Failed(reason) => assert!(reason.contains("load engine crashed")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_well_formed(&report);
}

#[tokio::test(start_paused = true)]
async fn test_skipped_baseline_uses_absolute_thresholds() {
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![LoadStep::Snapshot(snapshot(7.0, 300.0))],
    ));
    let faults = Arc::new(FakeFactory::new(&events));

    let report = orchestrator(FakeCluster::healthy(), &load, &faults)
        .run(&spec().without_baseline())
        .await;

    assert_eq!(report.phases[1].phase, PhaseName::Baseline);
    assert_eq!(report.phases[1].outcome, PhaseOutcome::Skipped);
    assert!(report.baseline.is_none());
    assert!(report.deltas.is_none());
    assert_eq!(load.calls(), 1);
    assert!(!report.verdict.is_pass());
    assert!(report
        .verdict
        .reasons()
        .iter()
        .any(|r| r.starts_with("error rate 7.0")));
}

#[tokio::test(start_paused = true)]
async fn test_report_written_to_configured_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out/report.json");
    let events = Events::default();
    let load = Arc::new(FakeLoad::new(
        &events,
        vec![
            LoadStep::Snapshot(snapshot(0.5, 120.0)),
            LoadStep::Snapshot(snapshot(3.2, 450.0)),
        ],
    ));
    let faults = Arc::new(FakeFactory::new(&events));
    let config = OrchestratorConfig {
        report_path: Some(path.clone()),
        ..config()
    };

    let report = ExperimentOrchestrator::new(
        Arc::new(FakeCluster::healthy()),
        load.clone(),
        faults.clone(),
        config,
    )
    .run(&spec())
    .await;

    assert_eq!(report.artifact, ArtifactStatus::Written { path: path.clone() });
    let body: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(body["id"], report.id.to_string());
    assert_eq!(body["verdict"]["result"], "pass");
    assert_eq!(body["phases"].as_array().unwrap().len(), 6);
}
