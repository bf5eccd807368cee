//! k6 load driver
//!
//! Runs `k6 run` with the configured script through a `CommandRunner` and
//! reads the four snapshot fields from the `--summary-export` JSON file.
//! The script receives the target through `VUS`, `DURATION`, `NAMESPACE`,
//! `DEPLOYMENT` and `SERVICE_URL`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::LoadDriver;
use crate::cancel::CancelToken;
use crate::error::ExperimentError;
use crate::experiment::{LoadProfile, TargetRef};
use crate::model::MetricsSnapshot;
use crate::sandbox::{CommandRequest, CommandRunner};

/// Exit code k6 uses when the run completed but a threshold was crossed
const THRESHOLDS_FAILED_EXIT: i32 = 99;

/// Trend statistics requested from k6; p(99) is not in its default set
const TREND_STATS: &str = "avg,min,med,max,p(90),p(95),p(99)";

/// k6 driver settings
#[derive(Debug, Clone)]
pub struct K6Config {
    /// k6 binary
    pub binary: String,

    /// Load script
    pub script: PathBuf,

    /// Directory for summary export files
    pub summary_dir: PathBuf,

    /// Extra time allowed beyond the load duration (start-up, ramp, export)
    pub grace: Duration,
}

impl Default for K6Config {
    fn default() -> Self {
        Self {
            binary: "k6".to_string(),
            script: PathBuf::from("manifests/k6/test.js"),
            summary_dir: std::env::temp_dir().join("chaos-orchestrator"),
            grace: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Summary {
    metrics: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl Summary {
    fn field(&self, metric: &str, field: &str) -> Result<f64, ExperimentError> {
        self.metrics
            .get(metric)
            .and_then(|values| values.get(field))
            .and_then(|value| value.as_f64())
            .ok_or_else(|| {
                ExperimentError::LoadRun(format!("k6 summary has no {}.{}", metric, field))
            })
    }
}

/// Load driver backed by the k6 CLI
pub struct K6Driver {
    runner: Arc<dyn CommandRunner>,
    config: K6Config,
}

impl K6Driver {
    pub fn new(runner: Arc<dyn CommandRunner>, config: K6Config) -> Self {
        Self { runner, config }
    }

    fn request(&self, target: &TargetRef, profile: &LoadProfile, summary: &str) -> CommandRequest {
        let duration = format!("{}s", profile.duration.as_secs().max(1));
        let vus = profile.concurrency.to_string();
        CommandRequest::new(
            self.config.binary.clone(),
            [
                "run".to_string(),
                "--vus".to_string(),
                vus.clone(),
                "--duration".to_string(),
                duration.clone(),
                "--summary-export".to_string(),
                summary.to_string(),
                self.config.script.to_string_lossy().to_string(),
            ],
        )
        .env("VUS", vus)
        .env("DURATION", duration)
        .env("NAMESPACE", target.namespace.clone())
        .env("DEPLOYMENT", target.workload.clone())
        .env("SERVICE_URL", target.service_url())
        .env("K6_SUMMARY_TREND_STATS", TREND_STATS)
        .timeout(profile.duration + self.config.grace)
    }
}

/// Convert a k6 summary export into a snapshot
pub(crate) fn parse_summary(json: &str) -> Result<MetricsSnapshot, ExperimentError> {
    let summary: Summary = serde_json::from_str(json)
        .map_err(|e| ExperimentError::LoadRun(format!("unparseable k6 summary: {}", e)))?;

    let failed_fraction = summary.field("http_req_failed", "value")?;
    let p99 = summary.field("http_req_duration", "p(99)")?;
    let throughput = summary.field("http_reqs", "rate")?;

    MetricsSnapshot::from_error_rate(failed_fraction * 100.0, p99, throughput)
}

#[async_trait]
impl LoadDriver for K6Driver {
    async fn run_load(
        &self,
        target: &TargetRef,
        profile: &LoadProfile,
        cancel: CancelToken,
    ) -> Result<MetricsSnapshot, ExperimentError> {
        tokio::fs::create_dir_all(&self.config.summary_dir)
            .await
            .map_err(|e| ExperimentError::LoadRun(format!("cannot create summary dir: {}", e)))?;
        let summary_path = self
            .config
            .summary_dir
            .join(format!("k6-summary-{}.json", Uuid::new_v4().simple()));
        let request = self.request(target, profile, &summary_path.to_string_lossy());

        info!(
            "Running k6 against {} ({} VUs for {:?})",
            target, profile.concurrency, profile.duration
        );
        let result = self.runner.execute(&request, &cancel).await;

        let output = match result {
            Ok(output) => output,
            Err(ExperimentError::Cancelled) => {
                remove_summary(&summary_path).await;
                return Err(ExperimentError::Cancelled);
            }
            Err(e) => {
                remove_summary(&summary_path).await;
                return Err(ExperimentError::LoadRun(e.to_string()));
            }
        };

        if output.timed_out {
            remove_summary(&summary_path).await;
            return Err(ExperimentError::LoadRun(format!(
                "k6 did not finish: {}",
                output.summary()
            )));
        }
        match output.exit_code {
            Some(0) => {}
            Some(THRESHOLDS_FAILED_EXIT) => {
                warn!("k6 thresholds crossed for {}", target);
            }
            _ => {
                remove_summary(&summary_path).await;
                return Err(ExperimentError::LoadRun(format!(
                    "k6 run failed: {}",
                    output.summary()
                )));
            }
        }

        let body = tokio::fs::read_to_string(&summary_path).await.map_err(|e| {
            ExperimentError::LoadRun(format!("cannot read k6 summary {:?}: {}", summary_path, e))
        })?;
        remove_summary(&summary_path).await;

        let snapshot = parse_summary(&body)?;
        debug!(
            "k6 snapshot for {}: error_rate={:.2}% p99={:.1}ms throughput={:.1}/s",
            target, snapshot.error_rate, snapshot.p99_latency_ms, snapshot.throughput
        );
        Ok(snapshot)
    }
}

async fn remove_summary(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove k6 summary {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CommandOutput;
    use std::sync::Mutex;

    const SUMMARY: &str = r#"{
        "metrics": {
            "http_req_failed": {"passes": 8, "fails": 992, "value": 0.032},
            "http_req_duration": {"avg": 140.2, "p(90)": 300.0, "p(99)": 450.0},
            "http_reqs": {"count": 1000, "rate": 85.5}
        }
    }"#;

    /// Writes a summary to the exported path, as k6 would
    struct SummaryWritingRunner {
        exit_code: i32,
        body: Option<&'static str>,
        requests: Mutex<Vec<CommandRequest>>,
    }

    impl SummaryWritingRunner {
        fn new(exit_code: i32, body: Option<&'static str>) -> Self {
            Self {
                exit_code,
                body,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for SummaryWritingRunner {
        async fn execute(
            &self,
            request: &CommandRequest,
            _cancel: &CancelToken,
        ) -> Result<CommandOutput, ExperimentError> {
            self.requests.lock().unwrap().push(request.clone());
            let position = request
                .args
                .iter()
                .position(|a| a == "--summary-export")
                .unwrap();
            if let Some(body) = self.body {
                std::fs::write(&request.args[position + 1], body).unwrap();
            }
            if self.exit_code == 0 {
                Ok(CommandOutput::success("done"))
            } else {
                Ok(CommandOutput::failure(self.exit_code, "run failed"))
            }
        }
    }

    struct CancelledRunner;

    #[async_trait]
    impl CommandRunner for CancelledRunner {
        async fn execute(
            &self,
            _request: &CommandRequest,
            _cancel: &CancelToken,
        ) -> Result<CommandOutput, ExperimentError> {
            Err(ExperimentError::Cancelled)
        }
    }

    fn driver(runner: Arc<dyn CommandRunner>, dir: &std::path::Path) -> K6Driver {
        K6Driver::new(
            runner,
            K6Config {
                summary_dir: dir.to_path_buf(),
                ..Default::default()
            },
        )
    }

    fn target() -> TargetRef {
        TargetRef::new("shop", "checkout").unwrap()
    }

    fn profile() -> LoadProfile {
        LoadProfile {
            concurrency: 10,
            duration: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_parse_summary() {
        let snapshot = parse_summary(SUMMARY).unwrap();
        assert!((snapshot.error_rate - 3.2).abs() < 1e-9);
        assert!((snapshot.success_rate - 96.8).abs() < 1e-9);
        assert_eq!(snapshot.p99_latency_ms, 450.0);
        assert_eq!(snapshot.throughput, 85.5);
    }

    #[test]
    fn test_parse_summary_missing_p99() {
        let err = parse_summary(r#"{"metrics":{"http_req_failed":{"value":0},"http_reqs":{"rate":1}}}"#)
            .unwrap_err();
        assert!(matches!(err, ExperimentError::LoadRun(msg) if msg.contains("p(99)")));
    }

    #[tokio::test]
    async fn test_run_load_reads_summary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(SummaryWritingRunner::new(0, Some(SUMMARY)));
        let snapshot = driver(runner.clone(), dir.path())
            .run_load(&target(), &profile(), CancelToken::never())
            .await
            .unwrap();
        assert_eq!(snapshot.p99_latency_ms, 450.0);

        let requests = runner.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.program, "k6");
        assert_eq!(&request.args[..5], ["run", "--vus", "10", "--duration", "60s"]);
        assert!(request
            .env
            .contains(&("SERVICE_URL".to_string(), "http://checkout.shop.svc.cluster.local".to_string())));
        assert_eq!(request.timeout, Some(Duration::from_secs(150)));

        // Summary file is consumed
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_threshold_exit_still_yields_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(SummaryWritingRunner::new(THRESHOLDS_FAILED_EXIT, Some(SUMMARY)));
        let snapshot = driver(runner, dir.path())
            .run_load(&target(), &profile(), CancelToken::never())
            .await
            .unwrap();
        assert!((snapshot.error_rate - 3.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_engine_failure_is_load_run_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(SummaryWritingRunner::new(107, None));
        let err = driver(runner, dir.path())
            .run_load(&target(), &profile(), CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::LoadRun(_)));
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let err = driver(Arc::new(CancelledRunner), dir.path())
            .run_load(&target(), &profile(), CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err, ExperimentError::Cancelled);
    }
}
