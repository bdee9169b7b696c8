//! Cooperative readiness waiting
//!
//! Waits re-evaluate a predicate against the observed object at a fixed
//! cadence until it holds or the timeout elapses. Each poll is a short
//! non-blocking call followed by a timer sleep, so concurrent runs interleave
//! freely on the runtime.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use drift_common::Error;

use crate::resources::{InfraClient, ResourceKind};

/// Poll cadence and deadline for one wait
#[derive(Clone, Copy, Debug)]
pub struct WaitParams {
    /// Time between predicate evaluations
    pub interval: Duration,
    /// Total time before the wait fails
    pub timeout: Duration,
}

impl WaitParams {
    /// Create wait parameters
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for WaitParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Poll `kind/namespace/name` until `predicate` holds, returning the object
/// that satisfied it
///
/// A missing object evaluates the predicate as false. Timing out is fatal to
/// the awaiting step: the error propagates and nothing retries beyond the
/// configured timeout.
pub async fn wait_until<F>(
    infra: &dyn InfraClient,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
    params: WaitParams,
    what: &str,
    predicate: F,
) -> Result<Value, Error>
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    let start = Instant::now();
    loop {
        if let Some(obj) = infra.get(kind, namespace, name).await? {
            if predicate(&obj) {
                return Ok(obj);
            }
        }

        if start.elapsed() >= params.timeout {
            return Err(Error::timeout(
                what,
                format!(
                    "{} '{}/{}' did not satisfy '{}' within {:?}",
                    kind.as_str(),
                    namespace,
                    name,
                    what,
                    params.timeout
                ),
            ));
        }

        debug!(
            kind = kind.as_str(),
            name = %name,
            elapsed = ?start.elapsed(),
            "waiting for {}", what
        );
        tokio::time::sleep(params.interval).await;
    }
}

/// Wait until the object's reported generation catches up to `generation`
///
/// Guards against reading stale status right after a write: the controller
/// manager may not have observed the new spec yet.
pub async fn wait_for_observed_generation(
    infra: &dyn InfraClient,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
    generation: i64,
    params: WaitParams,
) -> Result<Value, Error> {
    wait_until(
        infra,
        kind,
        namespace,
        name,
        params,
        "observed generation",
        |obj| observed_generation(obj) >= generation,
    )
    .await
}

/// The object's `status.observedGeneration`, 0 when unreported
pub fn observed_generation(obj: &Value) -> i64 {
    obj.pointer("/status/observedGeneration")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Predicate: the deployment reports at least `desired` ready replicas
pub fn deployment_ready(desired: i32) -> impl Fn(&Value) -> bool {
    move |obj| {
        obj.pointer("/status/readyReplicas")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            >= desired as i64
    }
}

/// Predicate: the pod's primary container has reached a terminated state
pub fn pod_terminated(obj: &Value) -> bool {
    obj.pointer("/status/containerStatuses/0/state/terminated")
        .is_some()
}
