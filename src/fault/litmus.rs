//! Litmus chaos backend
//!
//! Resource-level faults are expressed as Litmus `ChaosEngine` objects.
//! Each fault renders one engine manifest to a temporary JSON file, applies
//! it with `kubectl apply -f`, and deletes the engine on revert. The
//! manifest files are temporary resources released during cleanup.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AppliedChaos, ChaosAction, ChaosBackend};
use crate::cancel::CancelToken;
use crate::error::{CleanupWarning, ExperimentError};
use crate::experiment::TargetRef;
use crate::sandbox::{CommandRequest, CommandRunner};

/// Litmus backend settings
#[derive(Debug, Clone)]
pub struct LitmusConfig {
    /// kubectl binary
    pub kubectl: String,

    /// Directory for rendered engine manifests
    pub manifest_dir: PathBuf,

    /// Service account the chaos runner uses
    pub service_account: String,

    /// Label key selecting the workload's pods (`<key>=<workload>`)
    pub app_label_key: String,

    /// Timeout for each kubectl call
    pub command_timeout: Duration,
}

impl Default for LitmusConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            manifest_dir: std::env::temp_dir().join("chaos-orchestrator"),
            service_account: "litmus-admin".to_string(),
            app_label_key: "app".to_string(),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Chaos backend applying Litmus `ChaosEngine` resources
pub struct LitmusBackend {
    runner: Arc<dyn CommandRunner>,
    config: LitmusConfig,
    manifests: Mutex<Vec<PathBuf>>,
}

impl LitmusBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, config: LitmusConfig) -> Self {
        Self {
            runner,
            config,
            manifests: Mutex::new(Vec::new()),
        }
    }

    /// Manifest files written so far and not yet released
    pub async fn manifest_paths(&self) -> Vec<PathBuf> {
        self.manifests.lock().await.clone()
    }

    /// Render the `ChaosEngine` object for an action
    pub fn engine_manifest(
        &self,
        name: &str,
        target: &TargetRef,
        action: ChaosAction,
        duration: Duration,
    ) -> Value {
        let mut env = vec![json!({
            "name": "TOTAL_CHAOS_DURATION",
            "value": duration.as_secs().max(1).to_string(),
        })];
        let experiment = match action {
            ChaosAction::NetworkLatency { latency } => {
                env.push(json!({"name": "NETWORK_LATENCY", "value": latency.as_millis().to_string()}));
                "pod-network-latency"
            }
            ChaosAction::CpuHog { cores } => {
                env.push(json!({"name": "CPU_CORES", "value": cores.to_string()}));
                "pod-cpu-hog"
            }
            ChaosAction::MemoryHog { megabytes } => {
                env.push(json!({"name": "MEMORY_CONSUMPTION", "value": megabytes.to_string()}));
                "pod-memory-hog"
            }
        };

        json!({
            "apiVersion": "litmuschaos.io/v1alpha1",
            "kind": "ChaosEngine",
            "metadata": {
                "name": name,
                "namespace": target.namespace,
            },
            "spec": {
                "engineState": "active",
                "appinfo": {
                    "appns": target.namespace,
                    "applabel": format!("{}={}", self.config.app_label_key, target.workload),
                    "appkind": "deployment",
                },
                "chaosServiceAccount": self.config.service_account,
                "experiments": [{
                    "name": experiment,
                    "spec": { "components": { "env": env } },
                }],
            },
        })
    }

    fn kubectl<I, S>(&self, args: I) -> CommandRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandRequest::new(self.config.kubectl.clone(), args).timeout(self.config.command_timeout)
    }
}

#[async_trait]
impl ChaosBackend for LitmusBackend {
    async fn apply(
        &self,
        target: &TargetRef,
        action: ChaosAction,
        duration: Duration,
    ) -> Result<AppliedChaos, ExperimentError> {
        let short_id = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}-{}", target.workload, action.label(), &short_id[..8]);
        let manifest = self.engine_manifest(&name, target, action, duration);

        tokio::fs::create_dir_all(&self.config.manifest_dir)
            .await
            .map_err(|e| {
                ExperimentError::FaultInjection(format!(
                    "cannot create manifest dir {:?}: {}",
                    self.config.manifest_dir, e
                ))
            })?;
        let path = self.config.manifest_dir.join(format!("{}.json", name));
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ExperimentError::FaultInjection(e.to_string()))?;
        tokio::fs::write(&path, body).await.map_err(|e| {
            ExperimentError::FaultInjection(format!("cannot write manifest {:?}: {}", path, e))
        })?;
        self.manifests.lock().await.push(path.clone());
        debug!("Rendered ChaosEngine manifest {:?}", path);

        let path_arg = path.to_string_lossy().to_string();
        let output = self
            .runner
            .execute(&self.kubectl(["apply", "-f", path_arg.as_str()]), &CancelToken::never())
            .await?;

        if output.is_success() {
            info!("ChaosEngine {} applied in {}", name, target.namespace);
            return Ok(AppliedChaos {
                resources: vec![name],
                failures: Vec::new(),
            });
        }

        if output.timed_out {
            // The engine may exist even though kubectl did not answer
            warn!("kubectl apply for {} timed out; treating as partial", name);
            return Ok(AppliedChaos {
                resources: vec![name],
                failures: vec!["kubectl apply timed out".to_string()],
            });
        }

        Err(ExperimentError::FaultInjection(format!(
            "kubectl apply {}: {}",
            name,
            output.summary()
        )))
    }

    async fn revert(&self, target: &TargetRef, resources: &[String]) -> Result<(), ExperimentError> {
        let mut errors = Vec::new();
        for name in resources {
            let request = self.kubectl([
                "delete",
                "chaosengine",
                name.as_str(),
                "-n",
                target.namespace.as_str(),
                "--ignore-not-found",
            ]);
            match self.runner.execute(&request, &CancelToken::never()).await {
                Ok(output) if output.is_success() => {
                    info!("ChaosEngine {} deleted", name);
                }
                Ok(output) => errors.push(format!("{}: {}", name, output.summary())),
                Err(e) => errors.push(format!("{}: {}", name, e)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExperimentError::FaultInjection(format!(
                "failed to delete chaos engines: {}",
                errors.join("; ")
            )))
        }
    }

    async fn release_temporary(&self) -> Vec<CleanupWarning> {
        let mut manifests = self.manifests.lock().await;
        let mut warnings = Vec::new();
        for path in manifests.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed manifest {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warnings.push(CleanupWarning::new(
                    format!("manifest {}", path.display()),
                    e.to_string(),
                )),
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::ScriptedRunner;
    use crate::sandbox::CommandOutput;

    fn backend(runner: Arc<ScriptedRunner>, dir: &std::path::Path) -> LitmusBackend {
        LitmusBackend::new(
            runner,
            LitmusConfig {
                manifest_dir: dir.to_path_buf(),
                ..Default::default()
            },
        )
    }

    fn target() -> TargetRef {
        TargetRef::new("shop", "checkout").unwrap()
    }

    #[test]
    fn test_engine_manifest_network_latency() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(Arc::new(ScriptedRunner::new()), dir.path());
        let manifest = backend.engine_manifest(
            "checkout-network-latency-1",
            &target(),
            ChaosAction::NetworkLatency {
                latency: Duration::from_millis(2000),
            },
            Duration::from_secs(60),
        );

        assert_eq!(manifest["kind"], "ChaosEngine");
        assert_eq!(manifest["metadata"]["namespace"], "shop");
        assert_eq!(manifest["spec"]["appinfo"]["applabel"], "app=checkout");
        let experiment = &manifest["spec"]["experiments"][0];
        assert_eq!(experiment["name"], "pod-network-latency");
        let env = experiment["spec"]["components"]["env"].as_array().unwrap();
        assert!(env.contains(&json!({"name": "TOTAL_CHAOS_DURATION", "value": "60"})));
        assert!(env.contains(&json!({"name": "NETWORK_LATENCY", "value": "2000"})));
    }

    #[tokio::test]
    async fn test_apply_revert_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(CommandOutput::success("chaosengine created"))
                .respond(CommandOutput::success("chaosengine deleted")),
        );
        let backend = backend(runner.clone(), dir.path());

        let applied = backend
            .apply(&target(), ChaosAction::CpuHog { cores: 2 }, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(applied.resources.len(), 1);
        assert!(!applied.is_partial());

        let paths = backend.manifest_paths().await;
        assert_eq!(paths.len(), 1);
        let written: Value = serde_json::from_slice(&std::fs::read(&paths[0]).unwrap()).unwrap();
        assert_eq!(written["spec"]["experiments"][0]["name"], "pod-cpu-hog");

        backend.revert(&target(), &applied.resources).await.unwrap();
        let requests = runner.requests();
        assert_eq!(requests[0].args[..2], ["apply".to_string(), "-f".to_string()]);
        assert_eq!(requests[1].args[..3], [
            "delete".to_string(),
            "chaosengine".to_string(),
            applied.resources[0].clone()
        ]);

        let warnings = backend.release_temporary().await;
        assert!(warnings.is_empty());
        assert!(!paths[0].exists());
        assert!(backend.manifest_paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_manifest_for_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().respond(CommandOutput::failure(1, "no CRD")));
        let backend = backend(runner, dir.path());

        let err = backend
            .apply(&target(), ChaosAction::MemoryHog { megabytes: 128 }, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::FaultInjection(msg) if msg.contains("no CRD")));
        assert_eq!(backend.manifest_paths().await.len(), 1);
    }

    #[tokio::test]
    async fn test_revert_failure_is_fault_injection_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().respond(CommandOutput::failure(1, "forbidden")));
        let backend = backend(runner, dir.path());
        let err = backend
            .revert(&target(), &["checkout-cpu-hog-1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::FaultInjection(msg) if msg.contains("forbidden")));
    }
}
