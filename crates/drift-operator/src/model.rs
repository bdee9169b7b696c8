//! Desired-state manifest model
//!
//! Pure functions turning a DriftRuntime snapshot into the concrete object
//! literals the pipeline reconciles. Everything here is deterministic: no
//! clocks, no I/O, no cluster reads. `DesiredState::derive` validates the
//! spec before producing anything, so an invalid runtime never reaches the
//! reconciler.

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde_json::{json, Value};

use drift_common::crd::{ConnectorSpec, DriftRuntime, LoggingSpec};
use drift_common::hash::content_hash;
use drift_common::Error;

use crate::{BUILD_REVISION_ANNOTATION, LOGGING_HASH_ANNOTATION};

/// Port the runtime's REST API listens on
pub const API_PORT: i32 = 8083;

/// ClusterRole the runtime's service account is bound to
pub const RUNTIME_CLUSTER_ROLE: &str = "drift-runtime";

/// Kubernetes DNS label length limit for generated names
const MAX_NAME_LEN: usize = 63;

/// Generated object names for one runtime
#[derive(Clone, Debug)]
pub struct RuntimeNames {
    /// The runtime's own name
    pub runtime: String,
    /// The runtime's namespace
    pub namespace: String,
}

impl RuntimeNames {
    /// Derive names from a runtime resource
    pub fn new(runtime: &DriftRuntime) -> Result<Self, Error> {
        let namespace = runtime
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::internal("DriftRuntime is missing a namespace"))?;
        Ok(Self {
            runtime: runtime.name_any(),
            namespace,
        })
    }

    /// Workload controller (Deployment) name
    pub fn workload(&self) -> String {
        format!("{}-runtime", self.runtime)
    }

    /// Service account name
    pub fn service_account(&self) -> String {
        format!("{}-runtime", self.runtime)
    }

    /// Cluster role binding name; namespace-qualified because bindings for
    /// every managed namespace share the cluster scope
    pub fn cluster_role_binding(&self) -> String {
        format!("drift-{}-{}-runtime", self.namespace, self.runtime)
    }

    /// Network policy name
    pub fn network_policy(&self) -> String {
        format!("{}-runtime", self.runtime)
    }

    /// REST API service name
    pub fn service(&self) -> String {
        format!("{}-runtime-api", self.runtime)
    }

    /// Merged logging+metrics ConfigMap name
    pub fn config(&self) -> String {
        format!("{}-runtime-config", self.runtime)
    }

    /// Certificate secret name
    pub fn certs_secret(&self) -> String {
        format!("{}-runtime-certs", self.runtime)
    }

    /// Pod disruption budget name
    pub fn pdb(&self) -> String {
        format!("{}-runtime", self.runtime)
    }

    /// Builder pod name (pod build backend)
    pub fn builder_pod(&self) -> String {
        format!("{}-runtime-build", self.runtime)
    }

    /// Rendered-Containerfile ConfigMap name (pod build backend)
    pub fn build_recipe(&self) -> String {
        format!("{}-runtime-build-recipe", self.runtime)
    }

    /// Platform build-config name (platform build backend)
    pub fn build_config(&self) -> String {
        format!("{}-runtime-build", self.runtime)
    }

    /// Per-connector ConfigMap name
    pub fn connector_config(&self, connector: &str) -> String {
        format!("{}-runtime-connector-{}", self.runtime, connector)
    }

    /// Label selector string for the runtime pods, as written into status
    pub fn selector(&self) -> String {
        format!(
            "app.kubernetes.io/name=drift-runtime,app.kubernetes.io/instance={}",
            self.runtime
        )
    }

    /// In-cluster URL of the REST API service
    pub fn service_url(&self) -> String {
        format!(
            "http://{}.{}.svc:{}",
            self.service(),
            self.namespace,
            API_PORT
        )
    }
}

/// The full set of target object literals for one reconciliation run
///
/// Built once from the custom resource snapshot and read-only afterward; the
/// workload manifest is rendered late (it depends on the build outcome) but
/// only from data fixed at derive time.
#[derive(Debug)]
pub struct DesiredState {
    /// Generated names
    pub names: RuntimeNames,
    /// Snapshot of the runtime this state was derived from
    runtime: DriftRuntime,
    /// Rendered logging properties (also embedded in connector configs)
    pub logging_config: String,
    /// Hash of the logging-relevant configuration subset
    pub logging_hash: String,
}

impl DesiredState {
    /// Derive the desired state, failing fast on an invalid spec
    pub fn derive(runtime: &DriftRuntime) -> Result<Self, Error> {
        let name = runtime.name_any();
        runtime
            .spec
            .validate()
            .map_err(|e| match e {
                Error::Validation { message, field, .. } => Error::Validation {
                    runtime: name.clone(),
                    message,
                    field,
                },
                other => other,
            })?;

        let names = RuntimeNames::new(runtime)?;

        // Every generated name must fit the DNS label limit; the connector
        // suffix is the longest.
        let longest = runtime
            .spec
            .connectors
            .iter()
            .map(|c| names.connector_config(&c.name).len())
            .chain([names.build_recipe().len()])
            .max()
            .unwrap_or(0);
        if longest > MAX_NAME_LEN {
            return Err(Error::validation_for(
                &name,
                format!(
                    "generated object names exceed {} characters; shorten the runtime or connector name",
                    MAX_NAME_LEN
                ),
            ));
        }

        let logging_config = render_logging(&runtime.spec.logging);
        let logging_hash = content_hash(&logging_config);

        Ok(Self {
            names,
            runtime: runtime.clone(),
            logging_config,
            logging_hash,
        })
    }

    /// Desired replica count
    pub fn replicas(&self) -> i32 {
        self.runtime.spec.replicas
    }

    /// Fixed image from the spec, when no build is declared
    pub fn fixed_image(&self) -> Option<&str> {
        self.runtime.spec.image.as_deref()
    }

    /// ServiceAccount literal
    pub fn service_account(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": self.metadata(&self.names.service_account()),
        })
    }

    /// ClusterRoleBinding literal
    ///
    /// Cluster-scoped, so it carries no owner reference and is deleted
    /// explicitly when the runtime goes away.
    pub fn cluster_role_binding(&self) -> Value {
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {
                "name": self.names.cluster_role_binding(),
                "labels": self.labels(),
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": self.names.service_account(),
                "namespace": self.names.namespace,
            }],
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": RUNTIME_CLUSTER_ROLE,
            }
        })
    }

    /// NetworkPolicy literal: the API port is reachable from within the
    /// namespace, replication traffic only between the runtime's own pods
    pub fn network_policy(&self) -> Value {
        let selector = self.selector_labels();
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": self.metadata(&self.names.network_policy()),
            "spec": {
                "podSelector": { "matchLabels": selector },
                "ingress": [
                    {
                        "from": [{ "podSelector": { "matchLabels": selector } }],
                    },
                    {
                        "from": [{ "podSelector": {} }],
                        "ports": [{ "port": API_PORT, "protocol": "TCP" }],
                    }
                ],
                "policyTypes": ["Ingress"],
            }
        })
    }

    /// REST API Service literal
    pub fn service(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.metadata(&self.names.service()),
            "spec": {
                "type": "ClusterIP",
                "selector": self.selector_labels(),
                "ports": [{
                    "name": "rest-api",
                    "port": API_PORT,
                    "targetPort": API_PORT,
                    "protocol": "TCP",
                }],
            }
        })
    }

    /// Merged logging+metrics ConfigMap literal, stamped with the logging
    /// hash so later runs can detect logging-only drift
    pub fn config_map(&self) -> Value {
        let mut metadata = self.metadata(&self.names.config());
        metadata["annotations"] = json!({ LOGGING_HASH_ANNOTATION: self.logging_hash });

        let mut data = json!({ "log4j.properties": self.logging_config });
        if self.runtime.spec.metrics.enabled {
            data["metrics-config.json"] =
                Value::String("{\"lowercaseOutputName\":true}".to_string());
        }

        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": metadata,
            "data": data,
        })
    }

    /// Certificate Secret literal from provider-supplied material
    pub fn certs_secret(&self, material: &BTreeMap<String, String>) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": self.metadata(&self.names.certs_secret()),
            "type": "Opaque",
            "stringData": material,
        })
    }

    /// PodDisruptionBudget literal
    pub fn pod_disruption_budget(&self) -> Value {
        json!({
            "apiVersion": "policy/v1",
            "kind": "PodDisruptionBudget",
            "metadata": self.metadata(&self.names.pdb()),
            "spec": {
                "maxUnavailable": 1,
                "selector": { "matchLabels": self.selector_labels() },
            }
        })
    }

    /// Workload controller literal
    ///
    /// `image` is the winning image for this run (built or fixed); `revision`
    /// is stamped as an annotation for the next run's build-state recovery.
    /// `replicas` is passed explicitly: the pipeline renders `min(current,
    /// desired)` so scale-up stays an explicit post-update step.
    pub fn workload(&self, image: &str, revision: Option<&str>, replicas: i32) -> Value {
        let spec = &self.runtime.spec;
        let mut metadata = self.metadata(&self.names.workload());
        let mut annotations = serde_json::Map::new();
        if let Some(revision) = revision {
            annotations.insert(
                BUILD_REVISION_ANNOTATION.to_string(),
                Value::String(revision.to_string()),
            );
        }
        if let Some(template) = spec.template.as_ref().and_then(|t| t.workload.as_ref()) {
            for (k, v) in &template.annotations {
                annotations.insert(k.clone(), Value::String(v.clone()));
            }
        }
        if !annotations.is_empty() {
            metadata["annotations"] = Value::Object(annotations);
        }

        let mut env = vec![json!({
            "name": "DRIFT_BOOTSTRAP_SERVERS",
            "value": spec.bootstrap_servers,
        })];
        if let Some(opts) = java_opts(&self.runtime) {
            env.push(json!({ "name": "JAVA_OPTS", "value": opts }));
        }
        if let Some(template) = &spec.template {
            for var in &template.env {
                env.push(json!({ "name": var.name, "value": var.value }));
            }
        }

        let mut pod_labels = self.labels();
        let mut pod_annotations = serde_json::Map::new();
        // Rolls the pods when the logging-relevant configuration changes
        pod_annotations.insert(
            LOGGING_HASH_ANNOTATION.to_string(),
            Value::String(self.logging_hash.clone()),
        );
        if let Some(template) = spec.template.as_ref().and_then(|t| t.pod.as_ref()) {
            for (k, v) in &template.labels {
                pod_labels.insert(k.clone(), v.clone());
            }
            for (k, v) in &template.annotations {
                pod_annotations.insert(k.clone(), Value::String(v.clone()));
            }
        }

        let mut container = json!({
            "name": "runtime",
            "image": image,
            "ports": [{ "name": "rest-api", "containerPort": API_PORT, "protocol": "TCP" }],
            "env": env,
            "livenessProbe": {
                "httpGet": { "path": "/health", "port": API_PORT },
                "initialDelaySeconds": spec.liveness_probe.initial_delay_seconds,
                "timeoutSeconds": spec.liveness_probe.timeout_seconds,
            },
            "readinessProbe": {
                "httpGet": { "path": "/health", "port": API_PORT },
                "initialDelaySeconds": spec.readiness_probe.initial_delay_seconds,
                "timeoutSeconds": spec.readiness_probe.timeout_seconds,
            },
            "volumeMounts": [{
                "name": "runtime-config",
                "mountPath": "/opt/drift/config",
            }],
        });
        if let Some(resources) = &spec.resources {
            container["resources"] = json!({
                "requests": resources.requests,
                "limits": resources.limits,
            });
        }

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": metadata,
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": self.selector_labels() },
                "template": {
                    "metadata": {
                        "labels": pod_labels,
                        "annotations": pod_annotations,
                    },
                    "spec": {
                        "serviceAccountName": self.names.service_account(),
                        "containers": [container],
                        "volumes": [{
                            "name": "runtime-config",
                            "configMap": { "name": self.names.config() },
                        }],
                    }
                }
            }
        })
    }

    /// Per-connector ConfigMap literal, embedding the logging configuration
    /// computed for this run
    pub fn connector_config_map(&self, connector: &ConnectorSpec) -> Value {
        let mut config = serde_json::Map::new();
        config.insert("name".to_string(), Value::String(connector.name.clone()));
        config.insert(
            "connector.class".to_string(),
            Value::String(connector.class.clone()),
        );
        config.insert("tasks.max".to_string(), json!(connector.tasks_max));
        for (k, v) in &connector.config {
            config.insert(k.clone(), v.clone());
        }

        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": self.metadata(&self.names.connector_config(&connector.name)),
            "data": {
                "connector.json": serde_json::to_string_pretty(&Value::Object(config))
                    .unwrap_or_default(),
                "log4j.properties": self.logging_config,
            }
        })
    }

    /// Connectors declared on the runtime
    pub fn connectors(&self) -> &[ConnectorSpec] {
        &self.runtime.spec.connectors
    }

    /// Standard metadata block: name, namespace, labels, owner reference
    fn metadata(&self, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": self.names.namespace,
            "labels": self.labels(),
            "ownerReferences": [owner_reference(&self.runtime)],
        })
    }

    /// Full label set for generated objects
    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "drift".to_string(),
        );
        if let Some(version) = &self.runtime.spec.version {
            labels.insert("app.kubernetes.io/version".to_string(), version.clone());
        }
        labels
    }

    /// The immutable selector subset of the labels
    fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "app.kubernetes.io/name".to_string(),
                "drift-runtime".to_string(),
            ),
            (
                "app.kubernetes.io/instance".to_string(),
                self.names.runtime.clone(),
            ),
        ])
    }
}

/// Owner reference pointing at the runtime, so namespaced objects are
/// garbage-collected when the runtime is deleted
pub fn owner_reference(runtime: &DriftRuntime) -> Value {
    json!({
        "apiVersion": "drift.dev/v1alpha1",
        "kind": "DriftRuntime",
        "name": runtime.name_any(),
        "uid": runtime.metadata.uid.clone().unwrap_or_default(),
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

/// Render the logging properties file from the logging spec
///
/// Deterministic: loggers are emitted in name order, so the logging hash is
/// stable for a given spec.
pub fn render_logging(logging: &LoggingSpec) -> String {
    let mut out = format!("root.level={}\n", logging.root_level);
    for (logger, level) in &logging.loggers {
        out.push_str(&format!("logger.{}.level={}\n", logger, level));
    }
    out
}

/// Build the JAVA_OPTS value from the JVM options, when any are set
fn java_opts(runtime: &DriftRuntime) -> Option<String> {
    let opts = runtime.spec.jvm_options.as_ref()?;
    let mut parts = Vec::new();
    if let Some(xms) = &opts.xms {
        parts.push(format!("-Xms{}", xms));
    }
    if let Some(xmx) = &opts.xmx {
        parts.push(format!("-Xmx{}", xmx));
    }
    parts.extend(opts.extra.iter().cloned());
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub(crate) fn sample_runtime(name: &str) -> DriftRuntime {
        DriftRuntime {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("messaging".to_string()),
                uid: Some("uid-1234".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: serde_json::from_value(json!({
                "replicas": 3,
                "image": "registry.example/runtime:3.7.0",
                "bootstrapServers": "broker-0.messaging:9092",
            }))
            .unwrap(),
            status: None,
        }
    }

    #[test]
    fn test_derive_validates_first() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.image = None;
        let err = DesiredState::derive(&runtime).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_derive_rejects_oversized_names() {
        let mut runtime = sample_runtime(&"x".repeat(55));
        runtime.spec.connectors = vec![serde_json::from_value(json!({
            "name": "a-rather-long-connector-name",
            "class": "io.example.Sink",
        }))
        .unwrap()];
        let err = DesiredState::derive(&runtime).unwrap_err();
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn test_generated_names() {
        let names = RuntimeNames::new(&sample_runtime("my-runtime")).unwrap();
        assert_eq!(names.workload(), "my-runtime-runtime");
        assert_eq!(names.service(), "my-runtime-runtime-api");
        assert_eq!(
            names.cluster_role_binding(),
            "drift-messaging-my-runtime-runtime"
        );
        assert_eq!(
            names.connector_config("orders"),
            "my-runtime-runtime-connector-orders"
        );
        assert_eq!(
            names.service_url(),
            "http://my-runtime-runtime-api.messaging.svc:8083"
        );
    }

    #[test]
    fn test_objects_carry_owner_reference() {
        let desired = DesiredState::derive(&sample_runtime("my-runtime")).unwrap();
        for obj in [
            desired.service_account(),
            desired.network_policy(),
            desired.service(),
            desired.config_map(),
            desired.pod_disruption_budget(),
        ] {
            let owner = &obj["metadata"]["ownerReferences"][0];
            assert_eq!(owner["kind"], json!("DriftRuntime"));
            assert_eq!(owner["uid"], json!("uid-1234"));
        }
        // Cluster-scoped binding must NOT have an owner reference
        let binding = desired.cluster_role_binding();
        assert!(binding["metadata"]["ownerReferences"].is_null());
    }

    #[test]
    fn test_config_map_stamps_logging_hash() {
        let desired = DesiredState::derive(&sample_runtime("my-runtime")).unwrap();
        let cm = desired.config_map();
        assert_eq!(
            cm["metadata"]["annotations"][LOGGING_HASH_ANNOTATION],
            json!(desired.logging_hash)
        );
        assert!(cm["data"]["log4j.properties"]
            .as_str()
            .unwrap()
            .contains("root.level=INFO"));
    }

    #[test]
    fn test_logging_hash_tracks_logging_only() {
        let runtime = sample_runtime("my-runtime");
        let a = DesiredState::derive(&runtime).unwrap();

        let mut changed = runtime.clone();
        changed.spec.replicas = 5;
        let b = DesiredState::derive(&changed).unwrap();
        assert_eq!(a.logging_hash, b.logging_hash);

        let mut changed = runtime;
        changed.spec.logging.root_level = "DEBUG".to_string();
        let c = DesiredState::derive(&changed).unwrap();
        assert_ne!(a.logging_hash, c.logging_hash);
    }

    #[test]
    fn test_workload_stamps_build_revision() {
        let desired = DesiredState::derive(&sample_runtime("my-runtime")).unwrap();
        let workload = desired.workload("registry/example@sha256:abc", Some("deadbeef"), 3);
        assert_eq!(
            workload["metadata"]["annotations"][BUILD_REVISION_ANNOTATION],
            json!("deadbeef")
        );
        assert_eq!(
            workload["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("registry/example@sha256:abc")
        );
        assert_eq!(workload["spec"]["replicas"], json!(3));
    }

    #[test]
    fn test_workload_env_and_jvm_options() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.jvm_options = Some(serde_json::from_value(json!({
            "xms": "1G", "xmx": "2G", "extra": ["-XX:+UseG1GC"]
        })).unwrap());
        let desired = DesiredState::derive(&runtime).unwrap();
        let workload = desired.workload("img:1", None, 3);
        let env = workload["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap()
            .clone();
        assert!(env.iter().any(|e| e["name"] == json!("JAVA_OPTS")
            && e["value"] == json!("-Xms1G -Xmx2G -XX:+UseG1GC")));
        assert!(env
            .iter()
            .any(|e| e["name"] == json!("DRIFT_BOOTSTRAP_SERVERS")));
    }

    #[test]
    fn test_connector_config_map_embeds_logging() {
        let mut runtime = sample_runtime("my-runtime");
        runtime.spec.connectors = vec![serde_json::from_value(json!({
            "name": "orders-sink",
            "class": "io.example.JdbcSink",
            "tasksMax": 2,
            "config": { "topics": "orders" },
        }))
        .unwrap()];
        let desired = DesiredState::derive(&runtime).unwrap();
        let cm = desired.connector_config_map(&desired.connectors()[0].clone());
        let connector_json = cm["data"]["connector.json"].as_str().unwrap();
        assert!(connector_json.contains("io.example.JdbcSink"));
        assert!(connector_json.contains("orders"));
        assert!(cm["data"]["log4j.properties"]
            .as_str()
            .unwrap()
            .contains("root.level"));
    }
}
