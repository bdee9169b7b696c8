//! Platform-native build backend
//!
//! Used when the substrate serves build.openshift.io: the recipe goes into a
//! BuildConfig whose output matches the declared target kind, a Build run is
//! created against it, and the digest-pinned reference is assembled from the
//! run's reported output reference and image digest.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use drift_common::crd::build::{BuildOutput, BuildSpec};
use drift_common::Error;

use crate::build::{BuildBackend, BuildState};
use crate::model::RuntimeNames;
use crate::reconciler;
use crate::resources::{InfraClient, ResourceKind};
use crate::wait::{self, WaitParams};

/// Builds images through the platform's native build pipeline
pub struct PlatformBuild;

impl PlatformBuild {
    /// Create the platform backend
    pub fn new() -> Self {
        Self
    }

    fn build_config(&self, names: &RuntimeNames, build: &BuildSpec, recipe: &str) -> Value {
        let output = match &build.output {
            BuildOutput::DirectPush { image, push_secret } => {
                let mut to = json!({
                    "to": { "kind": "DockerImage", "name": image },
                });
                if let Some(secret) = push_secret {
                    to["pushSecret"] = json!({ "name": secret });
                }
                to
            }
            BuildOutput::RegistryTag { image } => json!({
                "to": { "kind": "ImageStreamTag", "name": image },
            }),
        };

        json!({
            "apiVersion": "build.openshift.io/v1",
            "kind": "BuildConfig",
            "metadata": {
                "name": names.build_config(),
                "namespace": names.namespace,
            },
            "spec": {
                "source": {
                    "type": "Dockerfile",
                    "dockerfile": recipe,
                },
                "strategy": {
                    "type": "Docker",
                    "dockerStrategy": {},
                },
                "output": output,
                "runPolicy": "Serial",
            }
        })
    }

    fn build_run(&self, names: &RuntimeNames, revision: &str) -> Value {
        json!({
            "apiVersion": "build.openshift.io/v1",
            "kind": "Build",
            "metadata": {
                "generateName": format!("{}-", names.build_config()),
                "namespace": names.namespace,
                "labels": {
                    "buildconfig": names.build_config(),
                },
                "annotations": {
                    crate::BUILD_REVISION_ANNOTATION: revision,
                },
            },
            "spec": {
                "serviceAccount": names.service_account(),
            }
        })
    }
}

impl Default for PlatformBuild {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildBackend for PlatformBuild {
    async fn execute(
        &self,
        infra: &dyn InfraClient,
        names: &RuntimeNames,
        build: &BuildSpec,
        revision: &str,
        state: &mut BuildState,
        params: WaitParams,
    ) -> Result<String, Error> {
        let namespace = names.namespace.as_str();

        // Remove generic-backend leftovers in case the substrate changed.
        reconciler::reconcile(
            infra,
            ResourceKind::ConfigMap,
            namespace,
            &names.build_recipe(),
            None,
        )
        .await?;
        reconciler::reconcile(infra, ResourceKind::Pod, namespace, &names.builder_pod(), None)
            .await?;

        let recipe = build.render_containerfile();
        let config = self.build_config(names, build, &recipe);
        reconciler::reconcile(
            infra,
            ResourceKind::BuildConfig,
            namespace,
            &names.build_config(),
            Some(&config),
        )
        .await?;

        let run = infra
            .create(ResourceKind::BuildRun, namespace, &self.build_run(names, revision))
            .await?;
        let run_name = run
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::build(&names.runtime, "build run has no generated name"))?
            .to_string();
        state.run_name = Some(run_name.clone());
        info!(runtime = %names.runtime, run = %run_name, revision, "triggered platform build");

        let finished = wait::wait_until(
            infra,
            ResourceKind::BuildRun,
            namespace,
            &run_name,
            params,
            "build completion",
            build_run_terminal,
        )
        .await?;

        extract_image_reference(&names.runtime, &finished)
    }
}

/// Predicate: the build run has reached a terminal phase
fn build_run_terminal(run: &Value) -> bool {
    matches!(
        run.pointer("/status/phase").and_then(Value::as_str),
        Some("Complete" | "Failed" | "Error" | "Cancelled")
    )
}

/// Assemble the digest-pinned reference from a completed build run
///
/// The run reports the pushed tag reference and the content digest
/// separately; the tag is replaced by the digest to pin the exact content.
fn extract_image_reference(runtime: &str, run: &Value) -> Result<String, Error> {
    let phase = run
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    if phase != "Complete" {
        let snippet = run
            .pointer("/status/logSnippet")
            .and_then(Value::as_str)
            .unwrap_or("no log snippet available");
        return Err(Error::build_in_phase(
            runtime,
            phase,
            format!("build ended in phase {}: {}", phase, snippet),
        ));
    }

    let output_ref = run
        .pointer("/status/outputDockerImageReference")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::build(runtime, "completed build reports no output reference"))?;
    let digest = run
        .pointer("/status/output/to/imageDigest")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::build(runtime, "completed build reports no image digest"))?;

    Ok(format!("{}@{}", crate::build::repository(output_ref), digest))
}
