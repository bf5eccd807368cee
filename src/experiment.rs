//! Experiment Definition
//!
//! `ExperimentDefinition` is the raw, string-typed form read from
//! configuration. `ExperimentSpec` is the validated, immutable form the
//! orchestrator runs. All parsing (fault kind, durations, names) happens in
//! the conversion between the two, before any side effect.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ExperimentError;

/// Workload targeted by an experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub namespace: String,
    pub workload: String,
}

impl TargetRef {
    /// Create a validated target reference
    ///
    /// Names must be non-empty DNS-1123 style identifiers (lowercase
    /// alphanumerics, `-` and `.`), at most 253 characters.
    pub fn new(
        namespace: impl Into<String>,
        workload: impl Into<String>,
    ) -> Result<Self, ExperimentError> {
        let namespace = namespace.into();
        let workload = workload.into();
        validate_name("namespace", &namespace)?;
        validate_name("workload", &workload)?;
        Ok(Self {
            namespace,
            workload,
        })
    }

    /// In-cluster service URL for the workload
    pub fn service_url(&self) -> String {
        format!(
            "http://{}.{}.svc.cluster.local",
            self.workload, self.namespace
        )
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.workload)
    }
}

fn validate_name(field: &str, value: &str) -> Result<(), ExperimentError> {
    if value.is_empty() {
        return Err(ExperimentError::Configuration(format!(
            "{} must not be empty",
            field
        )));
    }
    if value.len() > 253 {
        return Err(ExperimentError::Configuration(format!(
            "{} '{}' exceeds 253 characters",
            field, value
        )));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = value
        .chars()
        .next()
        .zip(value.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);
    if !valid_chars || !valid_edges {
        return Err(ExperimentError::Configuration(format!(
            "{} '{}' is not a valid resource name",
            field, value
        )));
    }
    Ok(())
}

/// Kind of fault to inject, with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    /// Terminate the workload's running instances
    InstanceKill,

    /// Add latency to the workload's network traffic
    NetworkLatency {
        #[serde(with = "duration_ms")]
        latency: Duration,
    },

    /// Saturate CPU cores in each instance
    CpuHog { cores: u32 },

    /// Consume memory in each instance
    MemoryHog { megabytes: u64 },
}

/// Parameters for parameterised fault kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultParams {
    pub latency_ms: u64,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

impl Default for FaultParams {
    fn default() -> Self {
        Self {
            latency_ms: 2000,
            cpu_cores: 1,
            memory_mb: 500,
        }
    }
}

impl FaultKind {
    /// Resolve a chaos type name into a fault kind
    ///
    /// Accepts the short names (`instance-kill`, `network-latency`,
    /// `cpu-hog`, `memory-hog`) and the Litmus experiment names
    /// (`pod-delete`, `pod-network-latency`, `pod-cpu-hog`,
    /// `pod-memory-hog`). Unknown names are a configuration error.
    pub fn parse(name: &str, params: &FaultParams) -> Result<Self, ExperimentError> {
        let kind = match name.trim().to_ascii_lowercase().as_str() {
            "instance-kill" | "pod-kill" | "pod-delete" => FaultKind::InstanceKill,
            "network-latency" | "pod-network-latency" => {
                if params.latency_ms == 0 {
                    return Err(ExperimentError::Configuration(
                        "network latency must be > 0ms".to_string(),
                    ));
                }
                FaultKind::NetworkLatency {
                    latency: Duration::from_millis(params.latency_ms),
                }
            }
            "cpu-hog" | "pod-cpu-hog" => {
                if params.cpu_cores == 0 {
                    return Err(ExperimentError::Configuration(
                        "cpu hog cores must be > 0".to_string(),
                    ));
                }
                FaultKind::CpuHog {
                    cores: params.cpu_cores,
                }
            }
            "memory-hog" | "pod-memory-hog" => {
                if params.memory_mb == 0 {
                    return Err(ExperimentError::Configuration(
                        "memory hog amount must be > 0MB".to_string(),
                    ));
                }
                FaultKind::MemoryHog {
                    megabytes: params.memory_mb,
                }
            }
            other => {
                return Err(ExperimentError::Configuration(format!(
                    "unknown chaos type '{}'. Must be one of: instance-kill, network-latency, cpu-hog, memory-hog",
                    other
                )))
            }
        };
        Ok(kind)
    }

    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            FaultKind::InstanceKill => "instance-kill",
            FaultKind::NetworkLatency { .. } => "network-latency",
            FaultKind::CpuHog { .. } => "cpu-hog",
            FaultKind::MemoryHog { .. } => "memory-hog",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::InstanceKill => write!(f, "instance-kill"),
            FaultKind::NetworkLatency { latency } => {
                write!(f, "network-latency({}ms)", latency.as_millis())
            }
            FaultKind::CpuHog { cores } => write!(f, "cpu-hog({} cores)", cores),
            FaultKind::MemoryHog { megabytes } => write!(f, "memory-hog({}MB)", megabytes),
        }
    }
}

/// Synthetic load shape for one load run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProfile {
    /// Virtual users
    pub concurrency: u32,

    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Validated, immutable experiment input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    target: TargetRef,
    fault: FaultKind,
    #[serde(with = "duration_ms")]
    fault_duration: Duration,
    load: LoadProfile,
    cleanup: bool,
    skip_baseline: bool,
}

impl ExperimentSpec {
    /// Create a validated experiment spec
    ///
    /// # Errors
    ///
    /// Returns `ExperimentError::Configuration` if a duration or the
    /// concurrency is zero, or if the load window is longer than the fault
    /// window (the measured load must overlap the fault entirely).
    pub fn new(
        target: TargetRef,
        fault: FaultKind,
        fault_duration: Duration,
        load: LoadProfile,
        cleanup: bool,
    ) -> Result<Self, ExperimentError> {
        if fault_duration.is_zero() {
            return Err(ExperimentError::Configuration(
                "fault duration must be > 0".to_string(),
            ));
        }
        if load.duration.is_zero() {
            return Err(ExperimentError::Configuration(
                "load duration must be > 0".to_string(),
            ));
        }
        if load.concurrency == 0 {
            return Err(ExperimentError::Configuration(
                "load concurrency must be > 0".to_string(),
            ));
        }
        if load.duration > fault_duration {
            return Err(ExperimentError::Configuration(format!(
                "load duration {:?} exceeds fault duration {:?}",
                load.duration, fault_duration
            )));
        }

        Ok(Self {
            target,
            fault,
            fault_duration,
            load,
            cleanup,
            skip_baseline: false,
        })
    }

    /// Mark the baseline phase as skipped
    ///
    /// Without a baseline the verdict uses absolute thresholds instead of
    /// baseline-relative ones.
    pub fn without_baseline(mut self) -> Self {
        self.skip_baseline = true;
        self
    }

    pub fn target(&self) -> &TargetRef {
        &self.target
    }

    pub fn fault(&self) -> &FaultKind {
        &self.fault
    }

    pub fn fault_duration(&self) -> Duration {
        self.fault_duration
    }

    pub fn load(&self) -> &LoadProfile {
        &self.load
    }

    pub fn cleanup(&self) -> bool {
        self.cleanup
    }

    pub fn skip_baseline(&self) -> bool {
        self.skip_baseline
    }
}

/// Raw experiment definition as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentDefinition {
    /// Target namespace
    pub namespace: String,

    /// Target deployment name
    pub deployment: String,

    /// Chaos type (e.g. "pod-delete", "network-latency")
    pub chaos_type: String,

    /// Chaos duration (e.g. "60", "90s", "5m")
    pub chaos_duration: String,

    /// Load test duration (e.g. "5m")
    pub load_duration: String,

    /// Number of virtual users
    pub load_vus: u32,

    /// Release temporary resources after the run
    pub cleanup: bool,

    /// Skip the baseline load run
    pub skip_baseline: bool,

    /// Latency added by network-latency faults
    pub latency_ms: u64,

    /// Cores saturated by cpu-hog faults
    pub cpu_cores: u32,

    /// Memory consumed by memory-hog faults
    pub memory_mb: u64,
}

impl Default for ExperimentDefinition {
    fn default() -> Self {
        let params = FaultParams::default();
        Self {
            namespace: "default".to_string(),
            deployment: String::new(),
            chaos_type: "pod-delete".to_string(),
            chaos_duration: "120s".to_string(),
            load_duration: "60s".to_string(),
            load_vus: 10,
            cleanup: true,
            skip_baseline: false,
            latency_ms: params.latency_ms,
            cpu_cores: params.cpu_cores,
            memory_mb: params.memory_mb,
        }
    }
}

impl ExperimentDefinition {
    fn fault_params(&self) -> FaultParams {
        FaultParams {
            latency_ms: self.latency_ms,
            cpu_cores: self.cpu_cores,
            memory_mb: self.memory_mb,
        }
    }
}

impl TryFrom<&ExperimentDefinition> for ExperimentSpec {
    type Error = ExperimentError;

    fn try_from(def: &ExperimentDefinition) -> Result<Self, Self::Error> {
        let target = TargetRef::new(def.namespace.clone(), def.deployment.clone())?;
        let fault = FaultKind::parse(&def.chaos_type, &def.fault_params())?;
        let fault_duration = parse_duration(&def.chaos_duration)?;
        let load = LoadProfile {
            concurrency: def.load_vus,
            duration: parse_duration(&def.load_duration)?,
        };

        let spec = ExperimentSpec::new(target, fault, fault_duration, load, def.cleanup)?;
        Ok(if def.skip_baseline {
            spec.without_baseline()
        } else {
            spec
        })
    }
}

/// Parse a duration string
///
/// Accepts a bare number of seconds (`"90"`) or a number followed by one of
/// `ms`, `s`, `m`, `h` (`"500ms"`, `"30s"`, `"5m"`, `"1h"`).
pub fn parse_duration(input: &str) -> Result<Duration, ExperimentError> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let value: u64 = digits.parse().map_err(|_| {
        ExperimentError::Configuration(format!("invalid duration '{}'", input))
    })?;

    let duration = match unit {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        _ => {
            return Err(ExperimentError::Configuration(format!(
                "invalid duration unit in '{}'. Must be one of: ms, s, m, h",
                input
            )))
        }
    };
    Ok(duration)
}

/// Serialize durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize optional durations as integer milliseconds
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}
