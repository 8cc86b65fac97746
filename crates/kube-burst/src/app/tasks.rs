use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::core::v1::Namespace;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::k8s::EventSource;
use crate::k8s::NamespaceWatcher;
use crate::k8s::ResourceWatch;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and stopping background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Cancel everything on SIGTERM or SIGINT.
    pub fn spawn_signal_handler(&mut self) -> Result<()> {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = self.cancellation_token.clone();

        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = token.cancelled() => return,
            }
            token.cancel();
        }));
        Ok(())
    }

    /// The watcher only ends on cancellation or when its first connect fails;
    /// in the latter case pods keep being watched with an empty policy table.
    pub fn spawn_namespace_watcher<S>(
        &mut self,
        watcher: NamespaceWatcher,
        watch: ResourceWatch<S, Namespace>,
    ) where
        S: EventSource<Namespace> + 'static,
    {
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting Kubernetes namespace watcher task");
            if let Err(e) = watcher.run(watch, token).await {
                tracing::error!("Kubernetes namespace watcher failed: {e:?}");
            } else {
                tracing::info!("Kubernetes namespace watcher completed");
            }
        }));
    }

    /// Cancel all tasks and wait for them, bounded by a timeout.
    pub async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}
