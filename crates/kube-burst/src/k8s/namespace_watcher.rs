use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Namespace;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::types::KubernetesError;
use crate::k8s::watch::EventSource;
use crate::k8s::watch::ResourceEvent;
use crate::k8s::watch::ResourceWatch;
use crate::policy::PolicyChange;
use crate::policy::PolicyTable;
use crate::policy::BURST_PERCENT_ANNOTATION;

/// Keeps the [`PolicyTable`] in sync with namespace burst annotations.
pub struct NamespaceWatcher {
    policies: Arc<PolicyTable>,
}

impl NamespaceWatcher {
    pub fn new(policies: Arc<PolicyTable>) -> Self {
        Self { policies }
    }

    /// Consume namespace events until `cancellation_token` fires.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailed`] if the first watch stream cannot be opened
    #[tracing::instrument(skip_all, name = "namespace_watcher")]
    pub async fn run<S>(
        &self,
        mut watch: ResourceWatch<S, Namespace>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>>
    where
        S: EventSource<Namespace>,
    {
        info!("Starting namespace watcher");
        loop {
            let event = select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Namespace watcher shutdown requested");
                    break;
                }
                event = watch.next_event() => event?,
            };
            self.handle_event(event);
        }
        Ok(())
    }

    pub(crate) fn handle_event(&self, event: ResourceEvent<Namespace>) {
        match event {
            ResourceEvent::Added(ns) | ResourceEvent::Modified(ns) => self.update(&ns),
            ResourceEvent::Deleted(ns) => {
                if let Some(name) = ns.metadata.name.as_deref() {
                    debug!(namespace = name, "namespace deleted");
                    self.policies.remove(name);
                }
            }
            ResourceEvent::Error(message) => error!("Namespace watch error: {message}"),
            ResourceEvent::Expired => {}
        }

        if !self.policies.is_empty() {
            debug!(policies = ?self.policies.snapshot(), "namespace burst policies");
        }
    }

    fn update(&self, ns: &Namespace) {
        let Some(name) = ns.metadata.name.as_deref() else {
            warn!("Skipping namespace event without a name");
            return;
        };
        let value = ns
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(BURST_PERCENT_ANNOTATION))
            .map(String::as_str);

        if let PolicyChange::Set(percent) = self.policies.apply_annotation(name, value) {
            info!(namespace = name, percent, "namespace burst policy");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashMap;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::k8s::watch::testing::Script;
    use crate::k8s::watch::testing::ScriptedSource;

    fn namespace(name: &str, burst: Option<&str>) -> Namespace {
        let annotations = burst.map(|value| {
            BTreeMap::from([(BURST_PERCENT_ANNOTATION.to_string(), value.to_string())])
        });
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn watcher() -> (NamespaceWatcher, Arc<PolicyTable>) {
        let policies = Arc::new(PolicyTable::new(200));
        (NamespaceWatcher::new(policies.clone()), policies)
    }

    #[test]
    fn added_and_modified_set_the_policy() {
        let (watcher, policies) = watcher();

        watcher.handle_event(ResourceEvent::Added(namespace("team-a", Some("50"))));
        assert_eq!(policies.get("team-a"), 50);

        watcher.handle_event(ResourceEvent::Modified(namespace("team-a", Some("120"))));
        assert_eq!(policies.get("team-a"), 120);
    }

    #[test]
    fn removing_the_annotation_clears_the_policy() {
        let (watcher, policies) = watcher();
        watcher.handle_event(ResourceEvent::Added(namespace("team-a", Some("50"))));

        watcher.handle_event(ResourceEvent::Modified(namespace("team-a", None)));
        assert_eq!(policies.get("team-a"), 0);
        assert!(policies.is_empty());
    }

    #[test_log::test]
    fn invalid_annotation_keeps_previous_policy() {
        let (watcher, policies) = watcher();
        watcher.handle_event(ResourceEvent::Added(namespace("team-a", Some("50"))));

        watcher.handle_event(ResourceEvent::Modified(namespace("team-a", Some("fifty"))));
        assert_eq!(policies.get("team-a"), 50);

        watcher.handle_event(ResourceEvent::Modified(namespace("team-a", Some("500"))));
        assert_eq!(policies.get("team-a"), 50);
    }

    #[test]
    fn delete_removes_regardless_of_annotation() {
        let (watcher, policies) = watcher();
        watcher.handle_event(ResourceEvent::Added(namespace("team-a", Some("50"))));

        watcher.handle_event(ResourceEvent::Deleted(namespace("team-a", Some("50"))));
        assert_eq!(policies.get("team-a"), 0);
    }

    #[test]
    fn error_events_change_nothing() {
        let (watcher, policies) = watcher();
        watcher.handle_event(ResourceEvent::Added(namespace("team-a", Some("50"))));

        watcher.handle_event(ResourceEvent::Error("Forbidden (403)".to_string()));
        assert_eq!(
            policies.snapshot(),
            HashMap::from([("team-a".to_string(), 50)])
        );
    }

    #[test_log::test(tokio::test)]
    async fn run_survives_stream_renewal_and_stops_on_cancel() {
        let (watcher, policies) = watcher();
        let source = ScriptedSource::new(vec![
            Script::Events(vec![ResourceEvent::Added(namespace("team-a", Some("25")))]),
            Script::Hang(vec![
                ResourceEvent::Added(namespace("team-a", Some("25"))),
                ResourceEvent::Added(namespace("team-b", Some("75"))),
            ]),
        ]);
        let watch = ResourceWatch::new("Namespace", source, Duration::from_secs(1800));
        let token = CancellationToken::new();

        let task = {
            let token = token.clone();
            tokio::spawn(async move { watcher.run(watch, token).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while policies.get("team-b") != 75 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("policies should be populated from both streams");
        assert_eq!(policies.get("team-a"), 25);

        token.cancel();
        let result = task.await.expect("task should not panic");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn run_returns_initial_connect_failure() {
        let (watcher, policies) = watcher();
        let source = ScriptedSource::new(vec![Script::Fail]);
        let watch = ResourceWatch::new("Namespace", source, Duration::from_secs(1800));

        let result = watcher.run(watch, CancellationToken::new()).await;

        assert!(result.is_err());
        assert!(policies.is_empty());
    }
}
