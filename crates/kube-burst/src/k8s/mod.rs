//! Kubernetes integration module.
//!
//! The agent follows two resource kinds through long-lived watch streams:
//! - [`NamespaceWatcher`]: keeps the [`PolicyTable`](crate::policy::PolicyTable) in sync
//!   with namespace burst annotations
//! - [`PodReconciler`]: applies the namespace policy to the cgroups of pods on this node
//!
//! Both are driven by a [`ResourceWatch`], which renews its stream whenever the
//! server ends it or the rotation deadline passes.

pub mod kube_client;
pub mod namespace_watcher;
pub mod pod_reconciler;
pub mod types;
pub mod watch;

pub use namespace_watcher::NamespaceWatcher;
pub use pod_reconciler::PodReconciler;
pub use types::KubernetesError;
pub use watch::EventSource;
pub use watch::KubeEventSource;
pub use watch::ResourceEvent;
pub use watch::ResourceWatch;
pub use watch::WatchState;
