//! Generic converge-one-object primitive
//!
//! One function reconciles any infrastructure object toward a desired value:
//! absent desired deletes, missing current creates, differing current patches,
//! identical current is left untouched. Every other module builds on this.

use serde_json::Value;
use tracing::{debug, info, warn};

use drift_common::Error;

use crate::resources::{InfraClient, ResourceKind};

/// What reconciliation did to the object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The object did not exist and was created
    Created,
    /// The object existed and was patched
    Patched,
    /// The object existed and was deleted
    Deleted,
    /// The object already matched the desired value (or was already absent)
    Unchanged,
}

/// Result of reconciling one object: the action taken plus the previous and
/// resulting object snapshots, available to later steps for diffing decisions
#[derive(Clone, Debug)]
pub struct ReconcileOutcome {
    /// Action taken
    pub action: ReconcileAction,
    /// The object as observed before reconciliation, if it existed
    pub previous: Option<Value>,
    /// The object after reconciliation (None when deleted/absent)
    pub current: Option<Value>,
}

impl ReconcileOutcome {
    fn unchanged(previous: Option<Value>, current: Option<Value>) -> Self {
        Self {
            action: ReconcileAction::Unchanged,
            previous,
            current,
        }
    }
}

/// Converge one object to `desired`
///
/// - `desired` absent, object exists: delete it
/// - `desired` absent, no object: nothing to do
/// - `desired` present, no object: create it
/// - both present: patch only when the semantic diff is non-empty
///
/// Mutation uses server-side apply, so fields owned by the server or other
/// managers (resource identity, assigned cluster IPs, defaulted fields) are
/// preserved rather than fought over.
pub async fn reconcile(
    infra: &dyn InfraClient,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
    desired: Option<&Value>,
) -> Result<ReconcileOutcome, Error> {
    let previous = infra.get(kind, namespace, name).await?;

    match (desired, &previous) {
        (None, Some(_)) => {
            info!(kind = kind.as_str(), name = %name, "deleting resource");
            infra.delete(kind, namespace, name).await?;
            Ok(ReconcileOutcome {
                action: ReconcileAction::Deleted,
                previous,
                current: None,
            })
        }
        (None, None) => Ok(ReconcileOutcome::unchanged(None, None)),
        (Some(desired), None) => {
            info!(kind = kind.as_str(), name = %name, "creating resource");
            let current = infra.apply(kind, namespace, name, desired).await?;
            Ok(ReconcileOutcome {
                action: ReconcileAction::Created,
                previous,
                current: Some(current),
            })
        }
        (Some(desired), Some(current)) => {
            if is_subset(desired, current) {
                debug!(kind = kind.as_str(), name = %name, "resource unchanged");
                let current = current.clone();
                return Ok(ReconcileOutcome::unchanged(previous, Some(current)));
            }
            info!(kind = kind.as_str(), name = %name, "patching resource");
            let applied = infra.apply(kind, namespace, name, desired).await?;
            Ok(ReconcileOutcome {
                action: ReconcileAction::Patched,
                previous,
                current: Some(applied),
            })
        }
    }
}

/// Downgrade an authorization failure to a logged no-op
///
/// Used for cluster-scoped role bindings: an operator running with namespaced
/// permissions cannot manage them, and that must not fail the whole run.
pub fn tolerate_forbidden(
    result: Result<ReconcileOutcome, Error>,
    kind: ResourceKind,
    name: &str,
) -> Result<ReconcileOutcome, Error> {
    match result {
        Err(e) if e.is_forbidden() => {
            warn!(
                kind = kind.as_str(),
                name = %name,
                error = %e,
                "insufficient permission, skipping cluster-scoped resource"
            );
            Ok(ReconcileOutcome::unchanged(None, None))
        }
        other => other,
    }
}

/// Semantic diff: is every field of `desired` already present in `current`?
///
/// The desired literal carries only the fields the operator cares about, while
/// the observed object carries server-assigned and defaulted fields on top.
/// Comparing desired-into-current therefore ignores server additions without
/// a field-ownership bookkeeping pass. Arrays compare wholesale: element
/// order and length are meaningful for containers, ports, and volumes.
/// Metadata bookkeeping fields the server always rewrites are skipped.
fn is_subset(desired: &Value, current: &Value) -> bool {
    match (desired, current) {
        (Value::Object(d), Value::Object(c)) => d.iter().all(|(key, dv)| {
            if key == "resourceVersion" || key == "uid" || key == "creationTimestamp" {
                return true;
            }
            match c.get(key) {
                Some(cv) => is_subset(dv, cv),
                // Serialized `null` is equivalent to the field being absent
                None => dv.is_null(),
            }
        }),
        (Value::Array(d), Value::Array(c)) => {
            d.len() == c.len() && d.iter().zip(c.iter()).all(|(dv, cv)| is_subset(dv, cv))
        }
        (d, c) => d == c,
    }
}
