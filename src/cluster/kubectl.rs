//! kubectl-backed cluster client
//!
//! Issues `kubectl` commands through a `CommandRunner` and interprets exit
//! codes and JSON output. Workloads are Deployments.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ClusterClient, Readiness, TerminationOutcome};
use crate::cancel::CancelToken;
use crate::error::ExperimentError;
use crate::experiment::TargetRef;
use crate::sandbox::{CommandOutput, CommandRequest, CommandRunner};

/// Subset of a Deployment object read by the client
#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    spec: DeploymentSpec,
    #[serde(default)]
    status: DeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentSpec {
    replicas: Option<u32>,
    #[serde(default)]
    selector: LabelSelector,
}

#[derive(Debug, Default, Deserialize)]
struct LabelSelector {
    #[serde(rename = "matchLabels", default)]
    match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentStatus {
    #[serde(rename = "readyReplicas")]
    ready_replicas: Option<u32>,
}

/// Cluster client that shells out to `kubectl`
#[derive(Clone)]
pub struct KubectlClient {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
}

impl KubectlClient {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout,
        }
    }

    async fn kubectl<I, S>(&self, args: I) -> Result<CommandOutput, ExperimentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = CommandRequest::new(self.binary.clone(), args).timeout(self.timeout);
        self.runner
            .execute(&request, &CancelToken::never())
            .await
            .map_err(|e| match e {
                ExperimentError::Cancelled => ExperimentError::Cancelled,
                other => ExperimentError::Cluster(other.to_string()),
            })
    }

    /// Run a `get` and map NotFound to `false`
    async fn exists<I, S>(&self, what: &str, args: I) -> Result<bool, ExperimentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let output = self.kubectl(args).await?;
        if output.is_success() {
            return Ok(true);
        }
        if output.stderr.contains("NotFound") || output.stderr.contains("not found") {
            debug!("{} not found", what);
            return Ok(false);
        }
        Err(command_failure(&format!("get {}", what), &output))
    }

    async fn deployment(&self, target: &TargetRef) -> Result<Deployment, ExperimentError> {
        let output = self
            .kubectl([
                "get",
                "deployment",
                target.workload.as_str(),
                "-n",
                target.namespace.as_str(),
                "-o",
                "json",
            ])
            .await?;
        if !output.is_success() {
            return Err(command_failure(&format!("get deployment {}", target), &output));
        }
        serde_json::from_str(&output.stdout).map_err(|e| {
            ExperimentError::Cluster(format!("unparseable deployment {}: {}", target, e))
        })
    }
}

fn command_failure(action: &str, output: &CommandOutput) -> ExperimentError {
    ExperimentError::Cluster(format!("kubectl {}: {}", action, output.summary()))
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn check_connectivity(&self) -> Result<(), ExperimentError> {
        let output = self.kubectl(["cluster-info"]).await?;
        if !output.is_success() {
            return Err(command_failure("cluster-info", &output));
        }
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ExperimentError> {
        self.exists(
            &format!("namespace {}", namespace),
            ["get", "namespace", namespace, "-o", "name"],
        )
        .await
    }

    async fn workload_exists(&self, target: &TargetRef) -> Result<bool, ExperimentError> {
        self.exists(
            &format!("deployment {}", target),
            [
                "get",
                "deployment",
                target.workload.as_str(),
                "-n",
                target.namespace.as_str(),
                "-o",
                "name",
            ],
        )
        .await
    }

    async fn readiness(&self, target: &TargetRef) -> Result<Readiness, ExperimentError> {
        let deployment = self.deployment(target).await?;
        // The API server omits replicas when it is the default of 1
        let desired = deployment.spec.replicas.unwrap_or(1);
        let ready = deployment.status.ready_replicas.unwrap_or(0);
        Ok(Readiness::new(desired, ready))
    }

    async fn terminate_instances(
        &self,
        target: &TargetRef,
    ) -> Result<TerminationOutcome, ExperimentError> {
        let deployment = self.deployment(target).await?;
        let labels = &deployment.spec.selector.match_labels;
        if labels.is_empty() {
            return Err(ExperimentError::Cluster(format!(
                "deployment {} has no matchLabels selector",
                target
            )));
        }
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let output = self
            .kubectl([
                "get",
                "pods",
                "-n",
                target.namespace.as_str(),
                "-l",
                selector.as_str(),
                "-o",
                "name",
            ])
            .await?;
        if !output.is_success() {
            return Err(command_failure(&format!("get pods -l {}", selector), &output));
        }

        let pods: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let mut outcome = TerminationOutcome::default();
        for pod in pods {
            let result = self
                .kubectl([
                    "delete",
                    pod,
                    "-n",
                    target.namespace.as_str(),
                    "--wait=false",
                ])
                .await;
            match result {
                Ok(out) if out.is_success() => outcome.terminated.push(pod.to_string()),
                Ok(out) => {
                    warn!("Failed to terminate {}: {}", pod, out.summary());
                    outcome.failed.push((pod.to_string(), out.summary()));
                }
                Err(e) => {
                    warn!("Failed to terminate {}: {}", pod, e);
                    outcome.failed.push((pod.to_string(), e.to_string()));
                }
            }
        }

        info!(
            "Terminated {}/{} instances of {}",
            outcome.terminated.len(),
            outcome.terminated.len() + outcome.failed.len(),
            target
        );
        Ok(outcome)
    }
}
