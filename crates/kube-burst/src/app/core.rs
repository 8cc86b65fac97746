use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;

use crate::app::tasks::Tasks;
use crate::cgroup::BurstUpdater;
use crate::config::AgentConfig;
use crate::k8s::pod_reconciler::node_field_selector;
use crate::k8s::KubeEventSource;
use crate::k8s::NamespaceWatcher;
use crate::k8s::PodReconciler;
use crate::k8s::ResourceWatch;
use crate::policy::PolicyTable;

/// Application core structure with explicit dependencies
pub struct Application {
    config: AgentConfig,
    client: Client,
    policies: Arc<PolicyTable>,
}

impl Application {
    pub fn new(config: AgentConfig, client: Client) -> Self {
        let policies = Arc::new(PolicyTable::new(config.max_burst_percent));
        Self {
            config,
            client,
            policies,
        }
    }

    /// Run the namespace watcher in the background and the pod reconciler in
    /// the foreground until a shutdown signal arrives or the reconciler fails.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_signal_handler()?;

        let namespaces = ResourceWatch::new(
            "Namespace",
            KubeEventSource::<Namespace>::all(self.client.clone(), self.config.watch_timeout),
            self.config.watch_timeout,
        );
        tasks.spawn_namespace_watcher(NamespaceWatcher::new(self.policies.clone()), namespaces);

        let pods = ResourceWatch::new(
            "Pod",
            KubeEventSource::<Pod>::all(self.client.clone(), self.config.watch_timeout)
                .with_field_selector(node_field_selector(&self.config.node_name)),
            self.config.watch_timeout,
        );
        let reconciler = PodReconciler::new(
            self.policies.clone(),
            BurstUpdater::new(&self.config.cgroup_path, self.config.dry_run),
        );

        let result = reconciler.run(pods, tasks.cancellation_token()).await;

        tasks.shutdown().await;

        if let Err(report) = result {
            tracing::error!("Pod reconciler failed: {report:?}");
            anyhow::bail!("pod reconciler stopped: {report}");
        }

        tracing::info!("Application run completed");
        Ok(())
    }
}
