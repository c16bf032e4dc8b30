//! Controller for Module reconciliation
//!
//! This module contains the control loop runtime, the per-Module reconciler
//! and the cluster-facing diff/apply machinery.

pub mod apply;
pub mod cluster;
pub mod conditions;
mod finalizers;
mod handle;
#[cfg(feature = "metrics")]
pub mod metrics;
mod queue;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod runtime;
pub mod store;

pub use cluster::{ClusterClient, KubeClusterClient, LiveObject};
pub use finalizers::MODULE_FINALIZER;
pub use handle::ControllerHandle;
pub use queue::WorkQueue;
pub use reconciler::{ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use runtime::{calculate_backoff, spawn_workers, ControllerRuntime, EventFilter, RuntimeConfig};
pub use store::{KubeModuleStore, ModuleStore};
