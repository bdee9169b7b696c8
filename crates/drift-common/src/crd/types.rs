//! Supporting types for the DriftRuntime CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Logging configuration for the runtime processes
///
/// The rendered logging properties land in the runtime ConfigMap. A hash of
/// this subset is stamped on the ConfigMap so later reconciles can detect
/// logging-only drift without diffing the whole rendered file.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSpec {
    /// Root logger level
    #[serde(default = "default_root_level")]
    pub root_level: String,

    /// Per-logger level overrides, keyed by logger name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loggers: BTreeMap<String, String>,
}

fn default_root_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingSpec {
    fn default() -> Self {
        Self {
            root_level: default_root_level(),
            loggers: BTreeMap::new(),
        }
    }
}

/// Metrics exporter configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    /// Whether the JMX metrics exporter is enabled
    #[serde(default)]
    pub enabled: bool,
}

/// Labels and annotations merged onto a generated object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataTemplate {
    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Template overrides for generated objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Overrides for the workload pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<MetadataTemplate>,

    /// Overrides for the workload controller itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<MetadataTemplate>,

    /// Extra environment variables for the runtime container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// A single environment variable override
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Literal value
    pub value: String,
}

/// Health probe tuning shared by liveness and readiness probes
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    /// Seconds before the first probe
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: i32,

    /// Probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: i32,
}

fn default_initial_delay() -> i32 {
    60
}

fn default_probe_timeout() -> i32 {
    5
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            initial_delay_seconds: default_initial_delay(),
            timeout_seconds: default_probe_timeout(),
        }
    }
}

/// Compute resources for the runtime container (Kubernetes quantity strings)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    /// Resource requests (e.g., cpu: "500m", memory: "1Gi")
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Resource limits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// JVM tuning for the runtime processes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JvmOptions {
    /// Initial heap size (-Xms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xms: Option<String>,

    /// Maximum heap size (-Xmx)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xmx: Option<String>,

    /// Additional JVM flags, passed through verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<String>,
}

/// A connector declared inline on the runtime
///
/// Connectors are materialized as one ConfigMap each during the
/// post-convergence step, after the runtime itself is ready.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSpec {
    /// Connector name, unique within the runtime
    pub name: String,

    /// Fully qualified connector class
    pub class: String,

    /// Maximum number of tasks
    #[serde(default = "default_tasks_max")]
    pub tasks_max: i32,

    /// Connector configuration passed through to the runtime
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
}

fn default_tasks_max() -> i32 {
    1
}
