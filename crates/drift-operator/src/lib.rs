//! Drift operator: converges DriftRuntime resources to their declared state

#![deny(missing_docs)]

/// Build decisioning and the two build backends
pub mod build;
/// Desired-state manifest model
pub mod model;
/// The convergence pipeline (ordered reconciliation steps)
pub mod pipeline;
/// Generic converge-one-object primitive
pub mod reconciler;
/// Infrastructure client and resource kind mapping
pub mod resources;
/// Controller wiring: periodic ticks, watch events, deletion handling
pub mod scheduler;
/// Cooperative readiness waiting
pub mod wait;

pub use drift_common::{crd, Error};

/// Field manager name used for all server-side apply patches
pub const FIELD_MANAGER: &str = "drift-operator";

/// Annotation recording the build revision on the workload controller
pub const BUILD_REVISION_ANNOTATION: &str = "drift.dev/build-revision";

/// Annotation operators set to force a rebuild on the next reconciliation
pub const FORCE_REBUILD_ANNOTATION: &str = "drift.dev/force-rebuild";

/// Annotation recording the hash of the logging-relevant configuration subset
pub const LOGGING_HASH_ANNOTATION: &str = "drift.dev/logging-hash";
