//! Error types for the drift operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries contextual information such as the runtime name, the build
//! phase that failed, or the wait that timed out.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for drift operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {runtime}: {message}")]
    Validation {
        /// Name of the runtime with invalid configuration
        runtime: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.build.plugins")
        field: Option<String>,
    },

    /// Container image build error
    #[error("build error for {runtime}: {message}")]
    Build {
        /// Name of the runtime being built
        runtime: String,
        /// Description of what failed (termination message, log snippet)
        message: String,
        /// Build phase that failed, when the backend reports one
        phase: Option<String>,
    },

    /// A readiness or completion wait ran out of time
    #[error("timeout [{context}]: {message}")]
    Timeout {
        /// What was being waited for (e.g., "builder pod", "deployment readiness")
        context: String,
        /// Description including the configured timeout
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "pipeline", "scheduler")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without runtime context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            runtime: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with runtime context
    pub fn validation_for(runtime: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            runtime: runtime.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with runtime context and field path
    pub fn validation_for_field(
        runtime: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            runtime: runtime.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a build error with the given message
    pub fn build(runtime: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Build {
            runtime: runtime.into(),
            message: msg.into(),
            phase: None,
        }
    }

    /// Create a build error with the reported build phase
    pub fn build_in_phase(
        runtime: impl Into<String>,
        phase: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Build {
            runtime: runtime.into(),
            message: msg.into(),
            phase: Some(phase.into()),
        }
    }

    /// Create a timeout error for the given wait
    pub fn timeout(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a spec
    /// fix). Builds and timeouts are retried by the next scheduled tick.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout).
                // Don't retry on 4xx errors (validation, not found, forbidden).
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Build { .. } => true,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the underlying cause is an authorization failure (HTTP 403)
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 403
        )
    }

    /// Get the runtime name if this error is associated with a specific runtime
    pub fn runtime(&self) -> Option<&str> {
        match self {
            Error::Validation { runtime, .. } => Some(runtime),
            Error::Build { runtime, .. } => Some(runtime),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Timeout { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
