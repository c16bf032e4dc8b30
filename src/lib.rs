//! moduleops: a Kubernetes control plane for templated Modules
//!
//! Each Module names a versioned template (git, Helm repository or OCI) and
//! a values document. The operator resolves and caches the template,
//! renders it, and either applies the result to the cluster or commits it
//! to a GitOps repository, keeping a bounded history for rollback.

pub mod auth;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod gitops;
pub mod telemetry;
pub mod template;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
