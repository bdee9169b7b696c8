//! Pod-based build backend for plain Kubernetes substrates
//!
//! Renders the recipe into a ConfigMap, runs a single-shot builder pod that
//! mounts it, and reads the resulting digest-pinned image reference from the
//! pod's termination message. The builder writes the pushed digest there so
//! no second registry round-trip is needed.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use drift_common::crd::build::BuildSpec;
use drift_common::Error;

use crate::build::{BuildBackend, BuildState};
use crate::model::RuntimeNames;
use crate::reconciler;
use crate::resources::{InfraClient, ResourceKind};
use crate::wait::{self, WaitParams};

/// Default image of the single-shot builder executor
pub const DEFAULT_BUILDER_IMAGE: &str = "quay.io/buildah/stable:v1";

/// Builds images by running a builder pod
pub struct PodBuild {
    builder_image: String,
}

impl PodBuild {
    /// Create a backend using the default builder image
    pub fn new() -> Self {
        Self {
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
        }
    }

    /// Create a backend with a custom builder image
    pub fn with_builder_image(builder_image: impl Into<String>) -> Self {
        Self {
            builder_image: builder_image.into(),
        }
    }

    fn recipe_config_map(&self, names: &RuntimeNames, recipe: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": names.build_recipe(),
                "namespace": names.namespace,
            },
            "data": { "Containerfile": recipe },
        })
    }

    fn builder_pod(&self, names: &RuntimeNames, build: &BuildSpec) -> Value {
        let output_image = build.output.image();

        let mut volume_mounts = vec![
            json!({ "name": "recipe", "mountPath": "/workspace/recipe", "readOnly": true }),
            json!({ "name": "scratch", "mountPath": "/workspace/scratch" }),
        ];
        let mut volumes = vec![
            json!({ "name": "recipe", "configMap": { "name": names.build_recipe() } }),
            json!({ "name": "scratch", "emptyDir": {} }),
        ];
        if let Some(secret) = build.output.push_secret() {
            volume_mounts.push(json!({
                "name": "push-secret",
                "mountPath": "/workspace/push-secret",
                "readOnly": true,
            }));
            volumes.push(json!({ "name": "push-secret", "secret": { "secretName": secret } }));
        }

        // The builder script pushes the image and writes the digest-pinned
        // reference to the termination message file as its last act.
        let script = format!(
            "set -e\n\
             buildah bud --file /workspace/recipe/Containerfile --tag {image} /workspace/scratch\n\
             buildah push {auth} --digestfile /tmp/digest {image}\n\
             printf '%s@%s' '{repo}' \"$(cat /tmp/digest)\" > /dev/termination-log\n",
            image = output_image,
            repo = crate::build::repository(output_image),
            auth = if build.output.push_secret().is_some() {
                "--authfile /workspace/push-secret/.dockerconfigjson"
            } else {
                ""
            },
        );

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": names.builder_pod(),
                "namespace": names.namespace,
            },
            "spec": {
                "restartPolicy": "Never",
                "serviceAccountName": names.service_account(),
                "containers": [{
                    "name": "builder",
                    "image": self.builder_image,
                    "command": ["/bin/sh", "-c", script],
                    "volumeMounts": volume_mounts,
                    "securityContext": { "privileged": true },
                }],
                "volumes": volumes,
            }
        })
    }
}

impl Default for PodBuild {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildBackend for PodBuild {
    async fn execute(
        &self,
        infra: &dyn InfraClient,
        names: &RuntimeNames,
        build: &BuildSpec,
        revision: &str,
        _state: &mut BuildState,
        params: WaitParams,
    ) -> Result<String, Error> {
        let namespace = names.namespace.as_str();

        // The backend choice may have changed between runs; remove any
        // platform build definition before starting.
        reconciler::reconcile(
            infra,
            ResourceKind::BuildConfig,
            namespace,
            &names.build_config(),
            None,
        )
        .await?;
        reconciler::reconcile(infra, ResourceKind::Pod, namespace, &names.builder_pod(), None)
            .await?;

        let recipe = build.render_containerfile();
        let recipe_cm = self.recipe_config_map(names, &recipe);
        reconciler::reconcile(
            infra,
            ResourceKind::ConfigMap,
            namespace,
            &names.build_recipe(),
            Some(&recipe_cm),
        )
        .await?;

        info!(runtime = %names.runtime, revision, "starting builder pod");
        let pod = self.builder_pod(names, build);
        infra.create(ResourceKind::Pod, namespace, &pod).await?;

        let result = wait::wait_until(
            infra,
            ResourceKind::Pod,
            namespace,
            &names.builder_pod(),
            params,
            "build completion",
            wait::pod_terminated,
        )
        .await
        .and_then(|pod| extract_image_reference(&names.runtime, &pod));

        // Cleanup runs on both success and failure paths.
        if let Err(e) = infra
            .delete(ResourceKind::Pod, namespace, &names.builder_pod())
            .await
        {
            warn!(runtime = %names.runtime, error = %e, "failed to clean up builder pod");
        }

        result
    }
}

/// Pull the digest-pinned image reference out of a terminated builder pod
fn extract_image_reference(runtime: &str, pod: &Value) -> Result<String, Error> {
    let terminated = pod
        .pointer("/status/containerStatuses/0/state/terminated")
        .ok_or_else(|| Error::build(runtime, "builder pod has no termination state"))?;

    let exit_code = terminated
        .get("exitCode")
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let message = terminated
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();

    if exit_code != 0 {
        let diagnostic = if message.is_empty() {
            format!("builder pod exited with code {}", exit_code)
        } else {
            message.to_string()
        };
        return Err(Error::build(runtime, diagnostic));
    }

    if message.is_empty() {
        return Err(Error::build(
            runtime,
            "builder pod succeeded but reported no image reference",
        ));
    }
    Ok(message.to_string())
}
