use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cgroup::BurstUpdater;
use crate::cgroup::CgroupError;
use crate::cgroup::PodSummary;
use crate::k8s::types::KubernetesError;
use crate::k8s::watch::EventSource;
use crate::k8s::watch::ResourceEvent;
use crate::k8s::watch::ResourceWatch;
use crate::policy::PolicyTable;

/// Field selector restricting a pod watch to one node.
pub fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name}")
}

/// Applies namespace burst policies to the cgroups of pods on this node.
///
/// A new pod's `Added` event usually arrives before kubelet has created its
/// cgroup directories, so the first attempt finds nothing. The `Modified`
/// events that follow while the pod starts retry naturally.
pub struct PodReconciler {
    policies: Arc<PolicyTable>,
    updater: BurstUpdater,
}

impl PodReconciler {
    pub fn new(policies: Arc<PolicyTable>, updater: BurstUpdater) -> Self {
        Self { policies, updater }
    }

    /// Consume pod events until `cancellation_token` fires.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailed`] if the first watch stream cannot be opened
    #[tracing::instrument(skip_all, name = "pod_reconciler", fields(dry_run = self.updater.dry_run()))]
    pub async fn run<S>(
        &self,
        mut watch: ResourceWatch<S, Pod>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>>
    where
        S: EventSource<Pod>,
    {
        info!("Starting pod reconciler");
        loop {
            let event = select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Pod reconciler shutdown requested");
                    break;
                }
                event = watch.next_event() => event?,
            };
            self.handle_event(event);
        }
        Ok(())
    }

    pub(crate) fn handle_event(&self, event: ResourceEvent<Pod>) {
        match event {
            ResourceEvent::Added(pod) | ResourceEvent::Modified(pod) => {
                debug!(
                    pod = pod.metadata.name.as_deref().unwrap_or("unknown"),
                    namespace = pod.metadata.namespace.as_deref().unwrap_or("unknown"),
                    "Reading pod event"
                );
                if let Err(report) = self.reconcile(&pod) {
                    if report.current_context().is_not_found() {
                        debug!("Pod cgroup not present: {report}");
                    } else {
                        warn!("Failed to reconcile pod: {report:?}");
                    }
                }
            }
            ResourceEvent::Deleted(pod) => {
                debug!(
                    pod = pod.metadata.name.as_deref().unwrap_or("unknown"),
                    "pod deleted"
                );
            }
            ResourceEvent::Error(message) => error!("Pod watch error: {message}"),
            ResourceEvent::Expired => {}
        }
    }

    /// Apply the namespace burst percentage to every container of `pod`.
    ///
    /// Returns `None` when there is nothing to do: the namespace has no policy,
    /// or the pod lacks the metadata needed to locate its cgroup.
    ///
    /// # Errors
    ///
    /// - [`CgroupError::PodDirUnavailable`] if the pod cgroup cannot be listed
    /// - [`CgroupError::ReadBurst`] / [`CgroupError::WriteBurst`] for container failures
    pub fn reconcile(&self, pod: &Pod) -> Result<Option<PodSummary>, Report<CgroupError>> {
        let Some(namespace) = pod.metadata.namespace.as_deref() else {
            warn!("Skipping pod event without a namespace");
            return Ok(None);
        };

        let percent = self.policies.get(namespace);
        if percent == 0 {
            debug!(namespace, "burst percent is 0");
            return Ok(None);
        }

        let Some(uid) = pod.metadata.uid.as_deref() else {
            warn!(namespace, "Skipping pod event without a uid");
            return Ok(None);
        };
        debug!(namespace, uid, percent, "reconciling pod");

        let summary = self.updater.update_pod(uid, percent)?;
        if summary.updated > 0 {
            info!(
                pod = pod.metadata.name.as_deref().unwrap_or("unknown"),
                namespace,
                percent,
                updated = summary.updated,
                "pod burst reconciled"
            );
        }
        Ok(Some(summary))
    }
}
