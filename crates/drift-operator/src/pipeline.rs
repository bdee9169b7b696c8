//! The convergence pipeline
//!
//! One run converges a single DriftRuntime: derive the desired state, settle
//! identity and access objects, decide and execute the image build, scale and
//! update the workload in the safe order, wait for readiness, then settle
//! connector configuration. Steps run strictly in sequence and the first
//! failure aborts the rest, but a status is assembled and returned
//! unconditionally so the runtime's conditions always reflect the last run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use drift_common::crd::{DriftRuntime, DriftRuntimeStatus};
use drift_common::Error;

use crate::build::{self, BuildBackend, BuildDecision, BuildState};
use crate::model::{DesiredState, RuntimeNames};
use crate::reconciler::{self, tolerate_forbidden};
use crate::resources::{InfraClient, ResourceKind};
use crate::wait::{self, WaitParams};
use crate::FORCE_REBUILD_ANNOTATION;

/// Provides certificate material for the runtime's certs secret
///
/// The operator itself never mints certificates; a provider either copies
/// material from a CA secret maintained elsewhere or reports that none is
/// available, in which case no certs secret is managed.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait CertProvider: Send + Sync {
    /// Certificate material for the runtime, None when certs are not managed
    async fn material(
        &self,
        infra: &dyn InfraClient,
        names: &RuntimeNames,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;
}

/// Default provider: copies the trust bundle from a CA secret in the
/// runtime's namespace, maintained by an external certificate manager
pub struct CaSecretProvider {
    ca_secret: String,
}

impl CaSecretProvider {
    /// Copy material from the named CA secret
    pub fn new(ca_secret: impl Into<String>) -> Self {
        Self {
            ca_secret: ca_secret.into(),
        }
    }
}

impl Default for CaSecretProvider {
    fn default() -> Self {
        Self::new("drift-cluster-ca")
    }
}

#[async_trait]
impl CertProvider for CaSecretProvider {
    async fn material(
        &self,
        infra: &dyn InfraClient,
        names: &RuntimeNames,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let Some(secret) = infra
            .get(ResourceKind::Secret, &names.namespace, &self.ca_secret)
            .await?
        else {
            return Ok(None);
        };

        let mut material = BTreeMap::new();
        if let Some(data) = secret.get("data").and_then(Value::as_object) {
            for (key, value) in data {
                if let Some(value) = value.as_str() {
                    material.insert(key.clone(), value.to_string());
                }
            }
        }
        if material.is_empty() {
            return Ok(None);
        }
        Ok(Some(material))
    }
}

/// What one pipeline run produced: the status to persist, and the failure
/// that aborted the run, if any
pub struct RunOutcome {
    /// Status reflecting this run, always present
    pub status: DriftRuntimeStatus,
    /// The aborting failure, used by the scheduler to pick a requeue policy
    pub error: Option<Error>,
}

/// The convergence pipeline for DriftRuntime resources
pub struct Pipeline {
    infra: Arc<dyn InfraClient>,
    backend: Arc<dyn BuildBackend>,
    certs: Arc<dyn CertProvider>,
    readiness: WaitParams,
    build_wait: WaitParams,
}

impl Pipeline {
    /// Assemble a pipeline from its collaborators
    pub fn new(
        infra: Arc<dyn InfraClient>,
        backend: Arc<dyn BuildBackend>,
        certs: Arc<dyn CertProvider>,
        readiness: WaitParams,
        build_wait: WaitParams,
    ) -> Self {
        Self {
            infra,
            backend,
            certs,
            readiness,
            build_wait,
        }
    }

    /// Run the full pipeline for one runtime
    ///
    /// Never returns an error directly: the failing step's error is folded
    /// into a NotReady status and handed back alongside it.
    #[instrument(skip_all, fields(runtime = %runtime.metadata.name.as_deref().unwrap_or("")))]
    pub async fn run(&self, runtime: &DriftRuntime) -> RunOutcome {
        let generation = runtime.metadata.generation;
        match self.converge(runtime).await {
            Ok(ready) => RunOutcome {
                status: DriftRuntimeStatus::ready(
                    generation,
                    ready.replicas,
                    ready.selector,
                    ready.url,
                ),
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "reconciliation failed");
                RunOutcome {
                    status: DriftRuntimeStatus::not_ready(generation, e.to_string()),
                    error: Some(e),
                }
            }
        }
    }

    async fn converge(&self, runtime: &DriftRuntime) -> Result<ReadyFields, Error> {
        let infra = self.infra.as_ref();

        // Step 1: derive and validate before touching anything.
        let desired = DesiredState::derive(runtime)?;
        let names = desired.names.clone();
        let namespace = names.namespace.as_str();

        // Step 2: identity and access.
        reconciler::reconcile(
            infra,
            ResourceKind::ServiceAccount,
            namespace,
            &names.service_account(),
            Some(&desired.service_account()),
        )
        .await?;
        tolerate_forbidden(
            reconciler::reconcile(
                infra,
                ResourceKind::ClusterRoleBinding,
                namespace,
                &names.cluster_role_binding(),
                Some(&desired.cluster_role_binding()),
            )
            .await,
            ResourceKind::ClusterRoleBinding,
            &names.cluster_role_binding(),
        )?;
        reconciler::reconcile(
            infra,
            ResourceKind::NetworkPolicy,
            namespace,
            &names.network_policy(),
            Some(&desired.network_policy()),
        )
        .await?;

        // Step 3: recover build state from the current workload.
        let workload = infra
            .get(ResourceKind::Deployment, namespace, &names.workload())
            .await?;
        let mut state = BuildState::recover(workload.as_ref());

        // Step 4: build decisioning and execution.
        let (image, revision) = match &runtime.spec.build {
            Some(build) => match build::decide(build, &state)? {
                BuildDecision::Skip { image, revision } => (image, Some(revision)),
                BuildDecision::Rebuild { revision } => {
                    let image = self
                        .backend
                        .execute(infra, &names, build, &revision, &mut state, self.build_wait)
                        .await?;
                    info!(image = %image, revision = %revision, "build complete");
                    if state.force_rebuild && workload.is_some() {
                        self.clear_force_rebuild(&names).await?;
                    }
                    (image, Some(revision))
                }
            },
            None => {
                build::teardown(infra, &names).await?;
                let image = desired
                    .fixed_image()
                    .ok_or_else(|| {
                        Error::validation_for(&names.runtime, "no image and no build specified")
                    })?
                    .to_string();
                (image, None)
            }
        };

        // Step 5: shrink before any other mutation.
        let desired_replicas = desired.replicas();
        let current_replicas = workload
            .as_ref()
            .and_then(|w| w.pointer("/spec/replicas"))
            .and_then(Value::as_i64)
            .map(|r| r as i32)
            .unwrap_or(desired_replicas);
        if desired_replicas < current_replicas {
            info!(
                from = current_replicas,
                to = desired_replicas,
                "scaling down before update"
            );
            infra
                .scale(namespace, &names.workload(), desired_replicas)
                .await?;
        }

        // Step 6: service, ancillary config, certs, disruption budget.
        reconciler::reconcile(
            infra,
            ResourceKind::Service,
            namespace,
            &names.service(),
            Some(&desired.service()),
        )
        .await?;
        reconciler::reconcile(
            infra,
            ResourceKind::ConfigMap,
            namespace,
            &names.config(),
            Some(&desired.config_map()),
        )
        .await?;
        if let Some(material) = self.certs.material(infra, &names).await? {
            reconciler::reconcile(
                infra,
                ResourceKind::Secret,
                namespace,
                &names.certs_secret(),
                Some(&desired.certs_secret(&material)),
            )
            .await?;
        }
        reconciler::reconcile(
            infra,
            ResourceKind::PodDisruptionBudget,
            namespace,
            &names.pdb(),
            Some(&desired.pod_disruption_budget()),
        )
        .await?;

        // Step 7: the workload itself, rendered at the shrunken replica count
        // so scale-up stays an explicit separate step.
        let manifest_replicas = current_replicas.min(desired_replicas);
        let manifest = desired.workload(&image, revision.as_deref(), manifest_replicas);
        let outcome = reconciler::reconcile(
            infra,
            ResourceKind::Deployment,
            namespace,
            &names.workload(),
            Some(&manifest),
        )
        .await?;

        // Step 8: grow after the update so new replicas start on the new
        // configuration.
        if desired_replicas > manifest_replicas {
            info!(
                from = manifest_replicas,
                to = desired_replicas,
                "scaling up after update"
            );
            infra
                .scale(namespace, &names.workload(), desired_replicas)
                .await?;
        }

        // Step 9: wait for the controller manager to observe the update, then
        // for readiness, unless scaled to zero.
        let written_generation = outcome
            .current
            .as_ref()
            .and_then(|w| w.pointer("/metadata/generation"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        wait::wait_for_observed_generation(
            infra,
            ResourceKind::Deployment,
            namespace,
            &names.workload(),
            written_generation,
            self.readiness,
        )
        .await?;
        if desired_replicas > 0 {
            wait::wait_until(
                infra,
                ResourceKind::Deployment,
                namespace,
                &names.workload(),
                self.readiness,
                "workload readiness",
                wait::deployment_ready(desired_replicas),
            )
            .await?;
        }

        // Step 10: connector configuration, including pruning removed ones.
        self.converge_connectors(&desired).await?;

        Ok(ReadyFields {
            replicas: desired_replicas,
            selector: names.selector(),
            url: names.service_url(),
        })
    }

    async fn converge_connectors(&self, desired: &DesiredState) -> Result<(), Error> {
        let infra = self.infra.as_ref();
        let names = &desired.names;

        let mut wanted = std::collections::BTreeSet::new();
        for connector in desired.connectors() {
            let name = names.connector_config(&connector.name);
            reconciler::reconcile(
                infra,
                ResourceKind::ConfigMap,
                &names.namespace,
                &name,
                Some(&desired.connector_config_map(connector)),
            )
            .await?;
            wanted.insert(name);
        }

        // A connector removed from the spec leaves a labeled ConfigMap
        // behind; find and delete those.
        let prefix = format!("{}-connector-", names.workload());
        let existing = infra
            .list_labeled(ResourceKind::ConfigMap, &names.namespace, &names.selector())
            .await?;
        for cm in existing {
            let Some(name) = cm.pointer("/metadata/name").and_then(Value::as_str) else {
                continue;
            };
            if name.starts_with(&prefix) && !wanted.contains(name) {
                info!(name = %name, "removing configuration of deleted connector");
                reconciler::reconcile(
                    infra,
                    ResourceKind::ConfigMap,
                    &names.namespace,
                    name,
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Clear the user's force-rebuild annotation once the rebuild it asked
    /// for has succeeded. Merge patch, because server-side apply cannot
    /// remove a field another manager owns.
    async fn clear_force_rebuild(&self, names: &RuntimeNames) -> Result<(), Error> {
        let patch = json!({
            "metadata": { "annotations": { FORCE_REBUILD_ANNOTATION: null } }
        });
        self.infra
            .patch_merge(
                ResourceKind::Deployment,
                &names.namespace,
                &names.workload(),
                &patch,
            )
            .await
    }
}

struct ReadyFields {
    replicas: i32,
    selector: String,
    url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::MockBuildBackend;
    use crate::model::tests::sample_runtime;
    use crate::resources::MockInfraClient;
    use drift_common::crd::ConditionStatus;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::time::Duration;

    fn quick_params() -> WaitParams {
        WaitParams::new(Duration::from_millis(10), Duration::from_millis(200))
    }

    fn pipeline(infra: MockInfraClient, backend: MockBuildBackend) -> Pipeline {
        let mut certs = MockCertProvider::new();
        certs
            .expect_material()
            .returning(|_, _| Box::pin(async { Ok(None) }));
        Pipeline::new(
            Arc::new(infra),
            Arc::new(backend),
            Arc::new(certs),
            quick_params(),
            quick_params(),
        )
    }

    fn ready_deployment(replicas: i64) -> Value {
        json!({
            "metadata": {
                "name": "my-runtime-runtime",
                "generation": 2,
            },
            "spec": { "replicas": replicas },
            "status": {
                "observedGeneration": 2,
                "readyReplicas": replicas,
            }
        })
    }

    /// Story: a fresh runtime converges to Ready with all objects created
    #[tokio::test(start_paused = true)]
    async fn story_fresh_runtime_becomes_ready() {
        let runtime = sample_runtime("my-runtime");
        let mut infra = MockInfraClient::new();

        // First Deployment read (build-state recovery) sees nothing; reads
        // after the apply see a ready object.
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_in_mock = std::sync::Arc::clone(&seen);
        infra.expect_get().returning(move |kind, _, _| {
            Ok(match kind {
                ResourceKind::Deployment => {
                    let n = seen_in_mock.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (n > 1).then(|| ready_deployment(3))
                }
                _ => None,
            })
        });
        infra
            .expect_apply()
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));
        infra.expect_scale().times(0);

        let outcome = pipeline(infra, MockBuildBackend::new()).run(&runtime).await;
        assert!(outcome.error.is_none());
        let condition = outcome.status.ready_condition().unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(outcome.status.replicas, Some(3));
        assert_eq!(
            outcome.status.url.as_deref(),
            Some("http://my-runtime-runtime-api.messaging.svc:8083")
        );
        assert_eq!(outcome.status.observed_generation, Some(1));
    }

    /// Story: a converged runtime on a periodic tick mutates nothing, every
    /// object already matches its desired shape
    #[tokio::test(start_paused = true)]
    async fn story_converged_runtime_mutates_nothing() {
        let runtime = sample_runtime("my-runtime");
        let desired = DesiredState::derive(&runtime).unwrap();

        // The ServiceAccount, NetworkPolicy, PodDisruptionBudget and
        // Deployment share one name, so the primed reads key on kind.
        let service_account = desired.service_account();
        let crb = desired.cluster_role_binding();
        let network_policy = desired.network_policy();
        let service = desired.service();
        let config_map = desired.config_map();
        let pdb = desired.pod_disruption_budget();
        let mut workload = desired.workload("registry.example/runtime:3.7.0", None, 3);
        workload["metadata"]["generation"] = json!(2);
        workload["status"] = json!({ "observedGeneration": 2, "readyReplicas": 3 });

        let mut infra = MockInfraClient::new();
        infra.expect_get().returning(move |kind, _, name| {
            Ok(match kind {
                ResourceKind::ServiceAccount => Some(service_account.clone()),
                ResourceKind::ClusterRoleBinding => Some(crb.clone()),
                ResourceKind::NetworkPolicy => Some(network_policy.clone()),
                ResourceKind::Service => Some(service.clone()),
                ResourceKind::ConfigMap if name == "my-runtime-runtime-config" => {
                    Some(config_map.clone())
                }
                ResourceKind::PodDisruptionBudget => Some(pdb.clone()),
                ResourceKind::Deployment => Some(workload.clone()),
                _ => None,
            })
        });
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));
        infra.expect_apply().times(0);
        infra.expect_create().times(0);
        infra.expect_scale().times(0);
        infra.expect_delete().times(0);
        infra.expect_patch_merge().times(0);

        let outcome = pipeline(infra, MockBuildBackend::new()).run(&runtime).await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error.map(|e| e.to_string()));
        let condition = outcome.status.ready_condition().unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
    }

    /// Story: shrinking from 3 to 1 scales down before the workload update
    /// and never scales up
    #[tokio::test(start_paused = true)]
    async fn story_shrink_scales_down_before_update() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.replicas = 1;
        let mut infra = MockInfraClient::new();

        infra.expect_get().returning(|kind, _, _| {
            Ok(match kind {
                ResourceKind::Deployment => Some(ready_deployment(3)),
                _ => None,
            })
        });
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));

        let mut seq = Sequence::new();
        infra
            .expect_scale()
            .with(eq("messaging"), eq("my-runtime-runtime"), eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        infra
            .expect_apply()
            .withf(|kind, _, _, desired| {
                *kind == ResourceKind::Deployment && desired["spec"]["replicas"] == json!(1)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra
            .expect_apply()
            .withf(|kind, _, _, _| *kind != ResourceKind::Deployment)
            .returning(|_, _, _, desired| Ok(desired.clone()));

        let outcome = pipeline(infra, MockBuildBackend::new()).run(&runtime).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status.replicas, Some(1));
    }

    /// Story: a failing step still produces a NotReady status carrying the
    /// step's error message
    #[tokio::test(start_paused = true)]
    async fn story_failure_still_yields_status() {
        let runtime = sample_runtime("my-runtime");
        let mut infra = MockInfraClient::new();

        infra.expect_get().returning(|_, _, _| Ok(None));
        infra
            .expect_apply()
            .returning(|_, _, _, _| Err(Error::internal_with_context("test", "api unreachable")));

        let outcome = pipeline(infra, MockBuildBackend::new()).run(&runtime).await;
        let error = outcome.error.unwrap();
        assert!(error.is_retryable());
        let condition = outcome.status.ready_condition().unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(condition.message.contains("api unreachable"));
    }

    /// Story: an invalid spec fails fast, before any infrastructure call
    #[tokio::test(start_paused = true)]
    async fn story_invalid_spec_touches_nothing() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.image = None;
        let mut infra = MockInfraClient::new();
        infra.expect_get().times(0);
        infra.expect_apply().times(0);

        let outcome = pipeline(infra, MockBuildBackend::new()).run(&runtime).await;
        assert!(matches!(outcome.error, Some(Error::Validation { .. })));
    }

    /// Story: a runtime with a build spec runs the backend and deploys the
    /// digest-pinned image it returns, stamping the build revision
    #[tokio::test(start_paused = true)]
    async fn story_build_output_flows_into_workload() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.image = None;
        runtime.spec.build = Some(
            serde_json::from_value(json!({
                "baseImage": "registry.example/base:3.7.0",
                "plugins": [{
                    "name": "plugin-a",
                    "artifacts": [{ "type": "url", "url": "https://example.com/a.tgz" }],
                }],
                "output": { "type": "directPush", "image": "registry/example:latest" },
            }))
            .unwrap(),
        );
        let mut infra = MockInfraClient::new();

        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_in_mock = std::sync::Arc::clone(&seen);
        infra.expect_get().returning(move |kind, _, _| {
            Ok(match kind {
                ResourceKind::Deployment => {
                    let n = seen_in_mock.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (n > 1).then(|| ready_deployment(3))
                }
                _ => None,
            })
        });
        infra
            .expect_apply()
            .withf(|kind, _, _, desired| {
                if *kind != ResourceKind::Deployment {
                    return true;
                }
                let container = &desired["spec"]["template"]["spec"]["containers"][0];
                container["image"] == json!("registry/example@sha256:abc")
                    && desired["metadata"]["annotations"][crate::BUILD_REVISION_ANNOTATION]
                        .is_string()
            })
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));

        let mut backend = MockBuildBackend::new();
        backend.expect_execute().times(1).returning(|_, _, _, _, _, _| {
            Box::pin(async { Ok("registry/example@sha256:abc".to_string()) })
        });

        let outcome = pipeline(infra, backend).run(&runtime).await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error.map(|e| e.to_string()));
    }

    /// Story: after a forced rebuild succeeds, the force annotation is
    /// cleared so the next tick skips again
    #[tokio::test(start_paused = true)]
    async fn story_force_rebuild_annotation_cleared_after_build() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.image = None;
        runtime.spec.build = Some(
            serde_json::from_value(json!({
                "baseImage": "registry.example/base:3.7.0",
                "plugins": [{
                    "name": "plugin-a",
                    "artifacts": [{ "type": "url", "url": "https://example.com/a.tgz" }],
                }],
                "output": { "type": "directPush", "image": "registry/example:latest" },
            }))
            .unwrap(),
        );
        let revision = runtime.spec.build.as_ref().unwrap().revision();

        let mut infra = MockInfraClient::new();
        infra.expect_get().returning(move |kind, _, _| {
            Ok(match kind {
                ResourceKind::Deployment => {
                    let mut workload = ready_deployment(3);
                    workload["metadata"]["annotations"] = json!({
                        crate::BUILD_REVISION_ANNOTATION: revision,
                        FORCE_REBUILD_ANNOTATION: "true",
                    });
                    workload["spec"]["template"] = json!({ "spec": { "containers": [
                        { "image": "registry/example@sha256:old" }
                    ]}});
                    Some(workload)
                }
                _ => None,
            })
        });
        infra
            .expect_apply()
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));
        infra
            .expect_patch_merge()
            .withf(|kind, _, name, patch| {
                *kind == ResourceKind::Deployment
                    && name == "my-runtime-runtime"
                    && patch["metadata"]["annotations"][FORCE_REBUILD_ANNOTATION].is_null()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut backend = MockBuildBackend::new();
        backend.expect_execute().times(1).returning(|_, _, _, _, _, _| {
            Box::pin(async { Ok("registry/example@sha256:new".to_string()) })
        });

        let outcome = pipeline(infra, backend).run(&runtime).await;
        assert!(outcome.error.is_none());
    }

    /// Story: dropping the build spec tears the build artifacts down
    #[tokio::test(start_paused = true)]
    async fn story_dropping_build_spec_removes_artifacts() {
        let runtime = sample_runtime("my-runtime");
        let mut infra = MockInfraClient::new();

        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_in_mock = std::sync::Arc::clone(&seen);
        infra.expect_get().returning(move |kind, _, name| {
            Ok(match kind {
                ResourceKind::Deployment => {
                    let n = seen_in_mock.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (n > 1).then(|| ready_deployment(3))
                }
                // A recipe ConfigMap from an earlier built configuration
                ResourceKind::ConfigMap if name == "my-runtime-runtime-build-recipe" => {
                    Some(json!({ "metadata": { "name": name } }))
                }
                _ => None,
            })
        });
        infra
            .expect_delete()
            .withf(|kind, _, name| {
                *kind == ResourceKind::ConfigMap && name == "my-runtime-runtime-build-recipe"
            })
            .times(1)
            .returning(|_, _, _| Ok(true));
        infra
            .expect_apply()
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));

        let outcome = pipeline(infra, MockBuildBackend::new()).run(&runtime).await;
        assert!(outcome.error.is_none());
    }

    /// Story: a connector removed from the spec has its ConfigMap pruned
    #[tokio::test(start_paused = true)]
    async fn story_removed_connector_config_is_pruned() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.connectors = vec![serde_json::from_value(json!({
            "name": "kept",
            "class": "io.example.Sink",
        }))
        .unwrap()];
        let mut infra = MockInfraClient::new();

        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_in_mock = std::sync::Arc::clone(&seen);
        infra.expect_get().returning(move |kind, _, name| {
            Ok(match kind {
                ResourceKind::Deployment => {
                    let n = seen_in_mock.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (n > 1).then(|| ready_deployment(3))
                }
                ResourceKind::ConfigMap if name.ends_with("-connector-removed") => {
                    Some(json!({ "metadata": { "name": name } }))
                }
                _ => None,
            })
        });
        infra
            .expect_apply()
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra.expect_list_labeled().returning(|_, _, _| {
            Ok(vec![
                json!({ "metadata": { "name": "my-runtime-runtime-connector-kept" } }),
                json!({ "metadata": { "name": "my-runtime-runtime-connector-removed" } }),
            ])
        });
        infra
            .expect_delete()
            .withf(|kind, _, name| {
                *kind == ResourceKind::ConfigMap && name == "my-runtime-runtime-connector-removed"
            })
            .times(1)
            .returning(|_, _, _| Ok(true));

        let outcome = pipeline(infra, MockBuildBackend::new()).run(&runtime).await;
        assert!(outcome.error.is_none());
    }
}
