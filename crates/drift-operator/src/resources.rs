//! Infrastructure client and resource kind mapping
//!
//! Every object the operator manages goes through one narrow client trait so
//! the pipeline and build backends can be tested against a mock. All resources
//! are handled as `DynamicObject` with an explicit `ApiResource`: native kinds
//! via `ApiResource::erase`, platform build kinds constructed manually.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use drift_common::crd::{DriftRuntime, DriftRuntimeStatus};
use drift_common::Error;

use crate::FIELD_MANAGER;

/// Every infrastructure object kind the operator reads or writes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// rbac.authorization.k8s.io/v1 ClusterRoleBinding (cluster-scoped)
    ClusterRoleBinding,
    /// networking.k8s.io/v1 NetworkPolicy
    NetworkPolicy,
    /// core/v1 Service
    Service,
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Secret
    Secret,
    /// policy/v1 PodDisruptionBudget
    PodDisruptionBudget,
    /// apps/v1 Deployment (the workload controller)
    Deployment,
    /// core/v1 Pod (the builder pod)
    Pod,
    /// Platform-native build definition (build.openshift.io/v1 BuildConfig)
    BuildConfig,
    /// Platform-native build run (build.openshift.io/v1 Build)
    BuildRun,
}

impl ResourceKind {
    /// The `ApiResource` used to address this kind through the dynamic API
    pub fn api_resource(&self) -> ApiResource {
        use k8s_openapi::api::apps::v1::Deployment;
        use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount};
        use k8s_openapi::api::networking::v1::NetworkPolicy;
        use k8s_openapi::api::policy::v1::PodDisruptionBudget;
        use k8s_openapi::api::rbac::v1::ClusterRoleBinding;

        match self {
            Self::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            Self::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
            Self::NetworkPolicy => ApiResource::erase::<NetworkPolicy>(&()),
            Self::Service => ApiResource::erase::<Service>(&()),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            Self::Secret => ApiResource::erase::<Secret>(&()),
            Self::PodDisruptionBudget => ApiResource::erase::<PodDisruptionBudget>(&()),
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::Pod => ApiResource::erase::<Pod>(&()),
            Self::BuildConfig => platform_build_resource("BuildConfig", "buildconfigs"),
            Self::BuildRun => platform_build_resource("Build", "builds"),
        }
    }

    /// True for kinds that exist outside any namespace
    pub fn cluster_scoped(&self) -> bool {
        matches!(self, Self::ClusterRoleBinding)
    }

    /// Kind name for logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::Service => "Service",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::PodDisruptionBudget => "PodDisruptionBudget",
            Self::Deployment => "Deployment",
            Self::Pod => "Pod",
            Self::BuildConfig => "BuildConfig",
            Self::BuildRun => "Build",
        }
    }
}

/// The platform build group served when the substrate has a native build
/// pipeline. Addressed manually because it is not in `k8s_openapi`.
fn platform_build_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: "build.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "build.openshift.io/v1".to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Substrate capability, detected once at startup
///
/// Selects the build backend: pod-based image building on plain Kubernetes,
/// the native build pipeline when the platform serves one. Never re-detected
/// mid-run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Substrate {
    /// Plain Kubernetes: builds run in a builder pod
    Kubernetes,
    /// Platform with a native build pipeline (BuildConfig/Build)
    Platform,
}

impl Substrate {
    /// Detect the substrate by looking for the platform build group in API
    /// discovery. Discovery failure falls back to plain Kubernetes.
    pub async fn detect(client: &Client) -> Self {
        use kube::discovery::Discovery;

        let discovery = match Discovery::new(client.clone()).run().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "API discovery failed, assuming plain Kubernetes");
                return Self::Kubernetes;
            }
        };

        for group in discovery.groups() {
            if group.name() == "build.openshift.io" {
                tracing::info!("platform build pipeline detected");
                return Self::Platform;
            }
        }
        Self::Kubernetes
    }
}

/// Trait abstracting infrastructure operations
///
/// This trait allows mocking the Kubernetes client in tests while using the
/// real client in production. Operations are the narrow set the pipeline
/// needs: get, list-by-label, apply, create, delete, scale, patch-status.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraClient: Send + Sync {
    /// Get one object, None when it does not exist
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, Error>;

    /// List objects matching a label selector
    async fn list_labeled(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Value>, Error>;

    /// Server-side apply the desired value, returning the resulting object
    async fn apply(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        desired: &Value,
    ) -> Result<Value, Error>;

    /// Create an object (used for build runs, which must not be patched over)
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        obj: &Value,
    ) -> Result<Value, Error>;

    /// Delete an object; returns true when it existed
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str)
        -> Result<bool, Error>;

    /// JSON merge patch an object (used to clear annotations, which
    /// server-side apply cannot remove when another manager owns them)
    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;

    /// Patch the replica count of the workload controller
    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), Error>;

    /// Patch the status subresource of a DriftRuntime
    async fn patch_runtime_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DriftRuntimeStatus,
    ) -> Result<(), Error>;

    /// Merge-patch a DriftRuntime's metadata (finalizer add/remove)
    async fn patch_runtime_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;
}

/// Real infrastructure client backed by a kube `Client`
pub struct KubeInfra {
    client: Client,
}

impl KubeInfra {
    /// Create a new KubeInfra wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        if kind.cluster_scoped() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }

    fn to_object(kind: ResourceKind, value: &Value) -> Result<DynamicObject, Error> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
    }

    fn to_value(kind: ResourceKind, obj: DynamicObject) -> Result<Value, Error> {
        serde_json::to_value(obj)
            .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
    }
}

#[async_trait]
impl InfraClient for KubeInfra {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, Error> {
        match self.api(kind, namespace).get(name).await {
            Ok(obj) => Ok(Some(Self::to_value(kind, obj)?)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_labeled(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Value>, Error> {
        let params = kube::api::ListParams::default().labels(selector);
        let list = self.api(kind, namespace).list(&params).await?;
        list.items
            .into_iter()
            .map(|obj| Self::to_value(kind, obj))
            .collect()
    }

    async fn apply(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        desired: &Value,
    ) -> Result<Value, Error> {
        debug!(kind = kind.as_str(), name = %name, "applying resource");
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let obj = self
            .api(kind, namespace)
            .patch(name, &params, &Patch::Apply(desired))
            .await?;
        Self::to_value(kind, obj)
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        obj: &Value,
    ) -> Result<Value, Error> {
        let obj = Self::to_object(kind, obj)?;
        let created = self
            .api(kind, namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        Self::to_value(kind, created)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.api(kind, namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), Error> {
        debug!(name = %name, replicas, "scaling workload");
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.patch_merge(ResourceKind::Deployment, namespace, name, &patch)
            .await
    }

    async fn patch_runtime_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DriftRuntimeStatus,
    ) -> Result<(), Error> {
        let api: Api<DriftRuntime> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_runtime_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        let api: Api<DriftRuntime> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_resource_mapping() {
        let ar = ResourceKind::Deployment.api_resource();
        assert_eq!(ar.kind, "Deployment");
        assert_eq!(ar.api_version, "apps/v1");

        let ar = ResourceKind::Service.api_resource();
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.plural, "services");

        let ar = ResourceKind::BuildConfig.api_resource();
        assert_eq!(ar.api_version, "build.openshift.io/v1");
        assert_eq!(ar.plural, "buildconfigs");
    }

    #[test]
    fn test_only_role_binding_is_cluster_scoped() {
        assert!(ResourceKind::ClusterRoleBinding.cluster_scoped());
        assert!(!ResourceKind::Deployment.cluster_scoped());
        assert!(!ResourceKind::Pod.cluster_scoped());
    }
}
