//! Image build decisioning and execution
//!
//! The decision engine is pure: it recovers the previous build outcome from
//! annotations on the workload controller and compares revisions. Execution
//! is behind one backend trait with a pod-based implementation for plain
//! Kubernetes and a platform-native one for substrates with a build pipeline.

pub mod platform;
pub mod pod;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use drift_common::crd::build::BuildSpec;
use drift_common::Error;

use crate::model::RuntimeNames;
use crate::reconciler;
use crate::resources::{InfraClient, ResourceKind};
use crate::wait::WaitParams;
use crate::{BUILD_REVISION_ANNOTATION, FORCE_REBUILD_ANNOTATION};

/// Build-related state recovered at the start of a run
///
/// Run-local and never shared. Everything durable lives in annotations on the
/// workload controller; this struct is just their in-memory shape plus the
/// run name once a platform build has been triggered.
#[derive(Clone, Debug, Default)]
pub struct BuildState {
    /// Image the workload currently runs, from its container spec
    pub recorded_image: Option<String>,
    /// Build revision recorded by the last successful run
    pub recorded_revision: Option<String>,
    /// True when a user requested a rebuild via annotation
    pub force_rebuild: bool,
    /// Generated name of the triggered platform build run, if any
    pub run_name: Option<String>,
}

impl BuildState {
    /// Recover build state from the current workload controller object
    ///
    /// A missing workload (first reconciliation) yields an empty state, which
    /// the decision engine treats as "never built".
    pub fn recover(workload: Option<&Value>) -> Self {
        let Some(workload) = workload else {
            return Self::default();
        };

        let annotations = workload.pointer("/metadata/annotations");
        let annotation = |key: &str| {
            annotations
                .and_then(|a| a.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Self {
            recorded_image: workload
                .pointer("/spec/template/spec/containers/0/image")
                .and_then(Value::as_str)
                .map(str::to_string),
            recorded_revision: annotation(BUILD_REVISION_ANNOTATION),
            force_rebuild: annotation(FORCE_REBUILD_ANNOTATION)
                .map(|v| v == "true")
                .unwrap_or(false),
            run_name: None,
        }
    }
}

/// Outcome of the build decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildDecision {
    /// Nothing changed: reuse the recorded image and revision unchanged
    Skip {
        /// The image the workload already runs
        image: String,
        /// The revision already recorded on the workload
        revision: String,
    },
    /// The recipe changed (or a rebuild was forced): build at this revision
    Rebuild {
        /// Revision of the recipe about to be built
        revision: String,
    },
}

/// Decide whether a rebuild is required
///
/// Cheap and side-effect-free. The skip path requires all three: revision
/// match, a recorded image to reuse, and no force flag. A recorded revision
/// with no recorded image (a half-written workload) rebuilds rather than
/// guessing.
pub fn decide(build: &BuildSpec, state: &BuildState) -> Result<BuildDecision, Error> {
    build.validate()?;
    let revision = build.revision();

    if !state.force_rebuild {
        if let (Some(recorded_revision), Some(recorded_image)) =
            (&state.recorded_revision, &state.recorded_image)
        {
            if *recorded_revision == revision {
                return Ok(BuildDecision::Skip {
                    image: recorded_image.clone(),
                    revision,
                });
            }
        }
    }

    Ok(BuildDecision::Rebuild { revision })
}

/// One build backend: turns a build spec into a digest-pinned image reference
///
/// Backends are selected by substrate capability at startup and never mixed
/// within a run. The mock is generated from the desugared methods, so mock
/// expectations return boxed futures.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait BuildBackend: Send + Sync {
    /// Run the build to completion, returning the resulting image reference
    async fn execute(
        &self,
        infra: &dyn InfraClient,
        names: &RuntimeNames,
        build: &BuildSpec,
        revision: &str,
        state: &mut BuildState,
        params: WaitParams,
    ) -> Result<String, Error>;
}

/// Repository part of an image reference, with any tag removed
///
/// Only a trailing `:suffix` that contains no `/` is a tag; a colon inside
/// the host part (`registry:5000/app`) is a port and stays.
pub(crate) fn repository(image: &str) -> &str {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => image,
    }
}

/// Reconcile away every build artifact either backend may have left behind
///
/// Called when a runtime drops its build spec, and on runtime deletion.
pub async fn teardown(infra: &dyn InfraClient, names: &RuntimeNames) -> Result<(), Error> {
    for (kind, name) in [
        (ResourceKind::Pod, names.builder_pod()),
        (ResourceKind::ConfigMap, names.build_recipe()),
        (ResourceKind::BuildConfig, names.build_config()),
    ] {
        let outcome = reconciler::reconcile(infra, kind, &names.namespace, &name, None).await?;
        if outcome.action == reconciler::ReconcileAction::Deleted {
            info!(kind = kind.as_str(), name = %name, "removed stale build artifact");
        }
    }
    Ok(())
}
