//! DriftRuntime Custom Resource Definition
//!
//! A DriftRuntime describes one connector-runtime cluster of the messaging
//! system: how many replicas, which image (or how to build one), logging and
//! metrics configuration, and the connectors it should run.

/// Build specification types
pub mod build;
/// Supporting spec/status types
pub mod types;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use build::{Artifact, BuildOutput, BuildSpec, Plugin};
pub use types::{
    Condition, ConditionStatus, ConnectorSpec, EnvVar, JvmOptions, LoggingSpec, MetadataTemplate,
    MetricsSpec, ProbeSpec, ResourcesSpec, TemplateSpec,
};

/// Specification for a DriftRuntime
///
/// A runtime either runs a fixed `image`, or declares a `build` and runs the
/// image the operator builds from it. Exactly one of the two must be present.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "drift.dev",
    version = "v1alpha1",
    kind = "DriftRuntime",
    plural = "driftruntimes",
    shortname = "dr",
    status = "DriftRuntimeStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DriftRuntimeSpec {
    /// Desired number of runtime replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Fixed container image to run (mutually exclusive with `build`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Runtime version, surfaced as a label on generated objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Build specification; when present the operator builds the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    /// Address of the messaging cluster the runtime connects to
    pub bootstrap_servers: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSpec,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsSpec,

    /// Template overrides for generated objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateSpec>,

    /// Compute resources for the runtime container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    /// JVM tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm_options: Option<JvmOptions>,

    /// Liveness probe tuning
    #[serde(default)]
    pub liveness_probe: ProbeSpec,

    /// Readiness probe tuning
    #[serde(default)]
    pub readiness_probe: ProbeSpec,

    /// Connectors declared inline on this runtime
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connectors: Vec<ConnectorSpec>,
}

fn default_replicas() -> i32 {
    3
}

impl DriftRuntimeSpec {
    /// Validate the runtime specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.replicas < 0 {
            return Err(crate::Error::validation("replicas cannot be negative"));
        }
        if self.bootstrap_servers.is_empty() {
            return Err(crate::Error::validation("bootstrapServers cannot be empty"));
        }
        match (&self.image, &self.build) {
            (None, None) => {
                return Err(crate::Error::validation(
                    "either image or build must be specified",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(crate::Error::validation(
                    "image and build are mutually exclusive",
                ))
            }
            _ => {}
        }
        if let Some(build) = &self.build {
            build.validate()?;
        }

        let mut seen = std::collections::BTreeSet::new();
        for connector in &self.connectors {
            if connector.name.is_empty() {
                return Err(crate::Error::validation("connector name cannot be empty"));
            }
            if !seen.insert(connector.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "connector name '{}' is declared more than once",
                    connector.name
                )));
            }
        }

        Ok(())
    }
}

/// Status of a DriftRuntime, written back once per reconciliation run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriftRuntimeStatus {
    /// The generation of the spec that was last processed by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the runtime state (one Ready condition)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Number of desired replicas, mirrored for `kubectl scale` tooling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector string for the runtime pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// Reachable URL of the runtime's REST API service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl DriftRuntimeStatus {
    /// Build a Ready status with derived fields
    pub fn ready(
        observed_generation: Option<i64>,
        replicas: i32,
        label_selector: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            observed_generation,
            conditions: vec![Condition::new(
                "Ready",
                ConditionStatus::True,
                "Converged",
                "Runtime is converged to the desired state",
            )],
            replicas: Some(replicas),
            label_selector: Some(label_selector.into()),
            url: Some(url.into()),
        }
    }

    /// Build a NotReady status carrying the causing error's message
    pub fn not_ready(observed_generation: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            observed_generation,
            conditions: vec![Condition::new(
                "Ready",
                ConditionStatus::False,
                "ReconciliationFailed",
                message,
            )],
            replicas: None,
            label_selector: None,
            url: None,
        }
    }

    /// The Ready condition, if one has been recorded
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == "Ready")
    }

    /// True when phase and message match, ignoring the transition timestamp
    ///
    /// `Condition::new` stamps a fresh `lastTransitionTime` on every call, so
    /// a naive equality check would make every status patch "different" and
    /// feed a self-triggering reconcile loop.
    pub fn same_outcome(&self, other: &DriftRuntimeStatus) -> bool {
        match (self.ready_condition(), other.ready_condition()) {
            (Some(a), Some(b)) => {
                a.status == b.status && a.message == b.message && self.url == other.url
            }
            (None, None) => true,
            _ => false,
        }
    }
}
