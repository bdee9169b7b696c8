//! Controller wiring
//!
//! The controller runtime supplies the scheduling guarantees the pipeline
//! relies on: watch events and periodic requeues feed reconcile requests,
//! different runtimes reconcile concurrently, and a second request for a
//! runtime already in flight is deferred until that run completes. This
//! module adds what sits around a run: finalizer management, explicit
//! cleanup of cluster-scoped objects on deletion, and status persistence.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use drift_common::crd::DriftRuntime;
use drift_common::Error;

use crate::build;
use crate::model::RuntimeNames;
use crate::pipeline::Pipeline;
use crate::resources::{InfraClient, ResourceKind};

/// Finalizer guarding cleanup of objects owner references cannot reach
pub const FINALIZER: &str = "drift.dev/cleanup";

/// How long a failed run waits before the retry tick
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state handed to every reconcile invocation
pub struct Context {
    /// Infrastructure client
    pub infra: Arc<dyn InfraClient>,
    /// The convergence pipeline
    pub pipeline: Arc<Pipeline>,
    /// Interval between periodic reconciliations of a healthy runtime
    pub requeue_interval: Duration,
}

/// Reconcile one DriftRuntime
///
/// Deletion bypasses the pipeline entirely; everything else runs the full
/// pipeline and persists whatever status it produced, then propagates the
/// run's failure so the error policy can pick a retry cadence.
pub async fn reconcile(runtime: Arc<DriftRuntime>, ctx: Arc<Context>) -> Result<Action, Error> {
    let names = RuntimeNames::new(&runtime)?;

    if runtime.metadata.deletion_timestamp.is_some() {
        handle_deletion(ctx.infra.as_ref(), &runtime, &names).await?;
        return Ok(Action::await_change());
    }

    ensure_finalizer(ctx.infra.as_ref(), &runtime, &names).await?;

    let outcome = ctx.pipeline.run(&runtime).await;
    persist_status(ctx.infra.as_ref(), &runtime, &names, &outcome.status).await?;

    match outcome.error {
        Some(e) => Err(e),
        None => {
            debug!(runtime = %names.runtime, "reconciled");
            Ok(Action::requeue(ctx.requeue_interval))
        }
    }
}

/// Decide the retry cadence after a failed run
///
/// Retryable failures (transport, timeouts, builds) get a timed retry;
/// configuration errors wait for the user to change the spec.
pub fn error_policy(runtime: Arc<DriftRuntime>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(runtime = %runtime.name_any(), error = %error, "reconcile failed");
    if error.is_retryable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::await_change()
    }
}

/// Delete what owner-reference garbage collection cannot, then release the
/// finalizer so the runtime object itself can go away
async fn handle_deletion(
    infra: &dyn InfraClient,
    runtime: &DriftRuntime,
    names: &RuntimeNames,
) -> Result<(), Error> {
    if !runtime.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    info!(runtime = %names.runtime, "cleaning up deleted runtime");

    // The binding is cluster-scoped, outside the owner reference's reach.
    match infra
        .delete(
            ResourceKind::ClusterRoleBinding,
            &names.namespace,
            &names.cluster_role_binding(),
        )
        .await
    {
        Ok(_) => {}
        Err(e) if e.is_forbidden() => {
            warn!(runtime = %names.runtime, "no permission to delete cluster role binding");
        }
        Err(e) => return Err(e),
    }

    // Build artifacts may include an in-flight builder pod.
    build::teardown(infra, names).await?;

    let remaining: Vec<&String> = runtime
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .collect();
    infra
        .patch_runtime_metadata(
            &names.namespace,
            &names.runtime,
            &json!({ "metadata": { "finalizers": remaining } }),
        )
        .await
}

async fn ensure_finalizer(
    infra: &dyn InfraClient,
    runtime: &DriftRuntime,
    names: &RuntimeNames,
) -> Result<(), Error> {
    if runtime.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let mut finalizers = runtime.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    infra
        .patch_runtime_metadata(
            &names.namespace,
            &names.runtime,
            &json!({ "metadata": { "finalizers": finalizers } }),
        )
        .await
}

/// Write the run's status onto the runtime, unless it says nothing new
///
/// Conditions carry a fresh transition timestamp on every run, so the guard
/// compares outcome rather than equality. Skipping no-op patches keeps
/// periodic ticks from generating watch events that feed back into the
/// controller.
async fn persist_status(
    infra: &dyn InfraClient,
    runtime: &DriftRuntime,
    names: &RuntimeNames,
    status: &drift_common::crd::DriftRuntimeStatus,
) -> Result<(), Error> {
    if let Some(current) = &runtime.status {
        if current.same_outcome(status)
            && current.observed_generation == status.observed_generation
        {
            debug!(runtime = %names.runtime, "status unchanged");
            return Ok(());
        }
    }
    infra
        .patch_runtime_status(&names.namespace, &names.runtime, status)
        .await
}

/// Run the controller until shutdown
///
/// Watches DriftRuntime across all namespaces; the watcher timeout keeps
/// long-poll connections fresh through well-behaved proxies.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let runtimes: Api<DriftRuntime> = Api::all(client);

    Controller::new(runtimes, WatcherConfig::default().timeout(25))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object.name, "reconcile complete"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::MockBuildBackend;
    use crate::model::tests::sample_runtime;
    use crate::pipeline::MockCertProvider;
    use crate::resources::MockInfraClient;
    use crate::wait::WaitParams;
    use drift_common::crd::DriftRuntimeStatus;
    use serde_json::{json, Value};

    fn context(infra: MockInfraClient) -> Arc<Context> {
        let infra: Arc<dyn InfraClient> = Arc::new(infra);
        let mut certs = MockCertProvider::new();
        certs
            .expect_material()
            .returning(|_, _| Box::pin(async { Ok(None) }));
        let params = WaitParams::new(
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        Arc::new(Context {
            pipeline: Arc::new(Pipeline::new(
                Arc::clone(&infra),
                Arc::new(MockBuildBackend::new()),
                Arc::new(certs),
                params,
                params,
            )),
            infra,
            requeue_interval: Duration::from_secs(120),
        })
    }

    fn deleting_runtime() -> DriftRuntime {
        let mut runtime = sample_runtime("my-runtime");
        runtime.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        runtime.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        runtime
    }

    /// Story: deletion removes the cluster-scoped binding and build
    /// artifacts, then releases the finalizer; the pipeline never runs
    #[tokio::test(start_paused = true)]
    async fn story_deletion_cleans_up_and_releases_finalizer() {
        let mut infra = MockInfraClient::new();
        infra
            .expect_delete()
            .withf(|kind, _, name| {
                *kind == ResourceKind::ClusterRoleBinding
                    && name == "drift-messaging-my-runtime-runtime"
            })
            .times(1)
            .returning(|_, _, _| Ok(true));
        // Build artifact teardown probes
        infra.expect_get().returning(|_, _, _| Ok(None));
        infra
            .expect_patch_merge()
            .times(0)
            .returning(|_, _, _, _| Ok(()));
        infra
            .expect_patch_runtime_metadata()
            .withf(|_, name, patch| {
                name == "my-runtime"
                    && patch["metadata"]["finalizers"] == json!(Vec::<Value>::new())
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        infra.expect_apply().times(0);
        infra.expect_patch_runtime_status().times(0);

        let action = reconcile(Arc::new(deleting_runtime()), context(infra))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a deleting runtime that never got our finalizer needs no
    /// cleanup from us
    #[tokio::test(start_paused = true)]
    async fn story_deletion_without_finalizer_is_a_no_op() {
        let mut runtime = deleting_runtime();
        runtime.metadata.finalizers = None;

        let mut infra = MockInfraClient::new();
        infra.expect_delete().times(0);
        infra.expect_patch_runtime_metadata().times(0);

        reconcile(Arc::new(runtime), context(infra)).await.unwrap();
    }

    /// Story: the first reconcile of a runtime adds the finalizer, runs the
    /// pipeline, and persists the resulting status
    #[tokio::test(start_paused = true)]
    async fn story_first_reconcile_adds_finalizer_and_status() {
        let mut infra = MockInfraClient::new();
        infra
            .expect_patch_runtime_metadata()
            .withf(|_, _, patch| {
                patch["metadata"]["finalizers"] == json!([FINALIZER])
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        // Happy-path pipeline mocks: deployment appears ready after apply.
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_in_mock = std::sync::Arc::clone(&seen);
        infra.expect_get().returning(move |kind, _, _| {
            Ok(match kind {
                ResourceKind::Deployment => {
                    let n = seen_in_mock.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (n > 1).then(|| {
                        json!({
                            "metadata": { "generation": 1 },
                            "spec": { "replicas": 3 },
                            "status": { "observedGeneration": 1, "readyReplicas": 3 },
                        })
                    })
                }
                _ => None,
            })
        });
        infra
            .expect_apply()
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));
        infra
            .expect_patch_runtime_status()
            .withf(|namespace, name, status| {
                namespace == "messaging" && name == "my-runtime" && status.replicas == Some(3)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(sample_runtime("my-runtime")), context(infra))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(120)));
    }

    /// Story: an unchanged outcome on a periodic tick is not re-patched
    #[tokio::test(start_paused = true)]
    async fn story_unchanged_status_is_not_repatched() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        runtime.status = Some(DriftRuntimeStatus::ready(
            Some(1),
            3,
            "app.kubernetes.io/name=drift-runtime,app.kubernetes.io/instance=my-runtime",
            "http://my-runtime-runtime-api.messaging.svc:8083",
        ));

        let mut infra = MockInfraClient::new();
        infra.expect_patch_runtime_metadata().times(0);
        infra.expect_patch_runtime_status().times(0);
        infra.expect_get().returning(|kind, _, _| {
            Ok(match kind {
                ResourceKind::Deployment => Some(json!({
                    "metadata": { "generation": 1 },
                    "spec": { "replicas": 3 },
                    "status": { "observedGeneration": 1, "readyReplicas": 3 },
                })),
                _ => None,
            })
        });
        infra
            .expect_apply()
            .returning(|_, _, _, desired| Ok(desired.clone()));
        infra.expect_list_labeled().returning(|_, _, _| Ok(vec![]));

        reconcile(Arc::new(runtime), context(infra)).await.unwrap();
    }

    /// Story: a validation failure persists NotReady and parks until the
    /// spec changes
    #[tokio::test(start_paused = true)]
    async fn story_validation_failure_awaits_spec_change() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        runtime.spec.image = None;

        let mut infra = MockInfraClient::new();
        infra
            .expect_patch_runtime_status()
            .withf(|_, _, status| {
                status
                    .ready_condition()
                    .map(|c| c.message.contains("image"))
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let err = reconcile(Arc::new(runtime), context(infra))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            error_policy(Arc::new(sample_runtime("my-runtime")), &err, context(MockInfraClient::new())),
            Action::await_change()
        );
    }
}
