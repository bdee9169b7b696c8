//! Shared types for the drift operator
//!
//! This crate holds everything both the operator binary and its tests need:
//! the structured error type, the `DriftRuntime` custom resource definition,
//! and the build specification model (validation, Containerfile rendering,
//! build revision hashing).

#![deny(missing_docs)]

/// DriftRuntime CRD and supporting types
pub mod crd;
/// Error types for drift operations
pub mod error;
/// Stable content hashing for annotation-persisted values
pub mod hash;

pub use error::Error;
