//! Report artifact rendering
//!
//! Writes the JSON form of a finished report to the configured path. The
//! verdict is computed before rendering and a rendering failure is only
//! ever recorded next to it.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::ExperimentReport;
use crate::error::ExperimentError;

/// Outcome of persisting a report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// No artifact path configured, or rendering not attempted yet
    #[default]
    NotRendered,

    Written { path: PathBuf },

    Failed { path: PathBuf, error: String },
}

impl ArtifactStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ArtifactStatus::Failed { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            ArtifactStatus::NotRendered => None,
            ArtifactStatus::Written { path } | ArtifactStatus::Failed { path, .. } => Some(path),
        }
    }
}

/// Persists reports as pretty-printed JSON files
#[derive(Debug, Clone, Default)]
pub struct ReportRenderer {
    path: Option<PathBuf>,
}

impl ReportRenderer {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Render the report and attach the outcome
    ///
    /// Never fails: the verdict must survive a broken output path.
    pub async fn render(&self, report: ExperimentReport) -> ExperimentReport {
        let Some(path) = self.path.clone() else {
            return report;
        };

        let status = match write_json(&report, &path).await {
            Ok(()) => {
                info!("Report written to {}", path.display());
                ArtifactStatus::Written { path }
            }
            Err(e) => {
                warn!("Failed to write report to {}: {}", path.display(), e);
                ArtifactStatus::Failed {
                    path,
                    error: e.to_string(),
                }
            }
        };
        report.with_artifact(status)
    }
}

async fn write_json(report: &ExperimentReport, path: &Path) -> Result<(), ExperimentError> {
    let json = report.to_json()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ExperimentError::Report(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    tokio::fs::write(path, json)
        .await
        .map_err(|e| ExperimentError::Report(format!("cannot write {}: {}", path.display(), e)))
}
