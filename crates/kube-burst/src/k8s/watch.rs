//! Self-renewing watch streams.
//!
//! A [`ResourceWatch`] cycles through
//! `Connecting -> Streaming -> (Expired | ErrorClosed) -> Connecting ...`
//! and hands its owner one [`ResourceEvent`] at a time. Streams are renewed when
//! the server closes them, when the server reports the resource version as gone,
//! and unconditionally once the rotation deadline passes. A stream that ended
//! right after an error event is reopened only after the retry delay.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::WatchEvent;
use kube::api::WatchParams;
use kube::Api;
use kube::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::k8s::types::KubernetesError;

/// Longest server-side timeout the client accepts for a single watch request.
const MAX_SERVER_TIMEOUT_SECS: u32 = 290;

/// Delay between attempts to reopen a stream that was open before.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Rotation deadline used when `rotate_after` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// HTTP status the API server uses when the requested resource version is too old.
const GONE: u16 = 410;

/// One decoded event of a watch stream.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Error status or undecodable payload; logged by the consumer, never fatal.
    Error(String),
    /// End-of-life marker, the stream has to be reopened.
    Expired,
}

pub type EventStream<K> = BoxStream<'static, ResourceEvent<K>>;

/// Something that can open a fresh stream of events for `K`.
#[async_trait]
pub trait EventSource<K: Send + 'static>: Send + Sync {
    async fn open(&self) -> Result<EventStream<K>, Report<KubernetesError>>;
}

/// [`EventSource`] backed by the Kubernetes watch API.
pub struct KubeEventSource<K: Resource> {
    api: Api<K>,
    field_selector: Option<String>,
    server_timeout_secs: u32,
}

impl<K> KubeEventSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Watch every object of kind `K` across namespaces.
    pub fn all(client: Client, rotate_after: Duration) -> Self {
        let server_timeout_secs =
            u32::try_from(rotate_after.as_secs()).map_or(MAX_SERVER_TIMEOUT_SECS, |secs| {
                secs.clamp(1, MAX_SERVER_TIMEOUT_SECS)
            });
        Self {
            api: Api::all(client),
            field_selector: None,
            server_timeout_secs,
        }
    }

    /// Restrict the watch with a server-side field selector, e.g. `spec.nodeName=node-a`.
    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }
}

#[async_trait]
impl<K> EventSource<K> for KubeEventSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn open(&self) -> Result<EventStream<K>, Report<KubernetesError>> {
        let mut params = WatchParams::default().timeout(self.server_timeout_secs);
        if let Some(selector) = &self.field_selector {
            params = params.fields(selector);
        }

        let stream = self
            .api
            .watch(&params, "0")
            .await
            .change_context_lazy(|| KubernetesError::WatchFailed {
                kind: K::kind(&K::DynamicType::default()).into_owned(),
                message: "failed to open watch stream".to_string(),
            })?;

        Ok(stream
            .filter_map(|item| future::ready(decode(item)))
            .boxed())
    }
}

/// Map the raw kube stream item onto [`ResourceEvent`]; bookmarks carry nothing for us.
fn decode<K>(item: kube::Result<WatchEvent<K>>) -> Option<ResourceEvent<K>> {
    match item {
        Ok(WatchEvent::Added(obj)) => Some(ResourceEvent::Added(obj)),
        Ok(WatchEvent::Modified(obj)) => Some(ResourceEvent::Modified(obj)),
        Ok(WatchEvent::Deleted(obj)) => Some(ResourceEvent::Deleted(obj)),
        Ok(WatchEvent::Bookmark(_)) => None,
        Ok(WatchEvent::Error(status)) if status.code == GONE => Some(ResourceEvent::Expired),
        Ok(WatchEvent::Error(status)) => Some(ResourceEvent::Error(format!(
            "{} ({}): {}",
            status.reason, status.code, status.message
        ))),
        Err(e) => Some(ResourceEvent::Error(format!("watch stream error: {e}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connecting,
    Streaming,
    /// Closed by the server, by a gone resource version, or by the rotation deadline.
    Expired,
    /// Closed right after reporting an error.
    ErrorClosed,
}

/// The open stream and the instant it has to be replaced.
struct WatchCursor<K> {
    stream: EventStream<K>,
    deadline: Instant,
    last_was_error: bool,
}

enum Polled<K> {
    Item(Option<ResourceEvent<K>>),
    Deadline,
}

pub struct ResourceWatch<S, K> {
    kind: &'static str,
    source: S,
    rotate_after: Duration,
    retry_delay: Duration,
    state: WatchState,
    cursor: Option<WatchCursor<K>>,
    connected: bool,
    reopen_at: Option<Instant>,
    renewals: u64,
}

impl<S, K> ResourceWatch<S, K>
where
    S: EventSource<K>,
    K: Send + 'static,
{
    pub fn new(kind: &'static str, source: S, rotate_after: Duration) -> Self {
        Self {
            kind,
            source,
            rotate_after,
            retry_delay: RETRY_DELAY,
            state: WatchState::Connecting,
            cursor: None,
            connected: false,
            reopen_at: None,
            renewals: 0,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Number of times the stream was reopened after the first connect.
    pub fn renewals(&self) -> u64 {
        self.renewals
    }

    /// Wait for the next event, renewing the stream as often as needed.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailed`] if the very first stream cannot be opened.
    ///   Later open failures are logged and retried.
    pub async fn next_event(&mut self) -> Result<ResourceEvent<K>, Report<KubernetesError>> {
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                if let Some(reopen_at) = self.reopen_at {
                    tokio::time::sleep_until(reopen_at).await;
                    self.reopen_at = None;
                }
                self.connect().await?;
                continue;
            };

            let deadline = cursor.deadline;
            let polled = tokio::select! {
                item = cursor.stream.next() => Polled::Item(item),
                () = tokio::time::sleep_until(deadline) => Polled::Deadline,
            };

            match polled {
                Polled::Item(Some(ResourceEvent::Expired)) => {
                    self.close(WatchState::Expired, "resource version expired");
                }
                Polled::Item(Some(event)) => {
                    cursor_mark(&mut self.cursor, matches!(event, ResourceEvent::Error(_)));
                    return Ok(event);
                }
                Polled::Item(None) => {
                    let errored = self.cursor.as_ref().is_some_and(|c| c.last_was_error);
                    if errored {
                        self.close(WatchState::ErrorClosed, "stream closed after an error");
                        self.reopen_at = Some(Instant::now() + self.retry_delay);
                    } else {
                        self.close(WatchState::Expired, "stream closed by server");
                    }
                }
                Polled::Deadline => {
                    self.close(WatchState::Expired, "rotation deadline reached");
                }
            }
        }
    }

    fn close(&mut self, state: WatchState, reason: &str) {
        debug!(kind = self.kind, reason, "closing watch stream");
        self.cursor = None;
        self.state = state;
    }

    async fn connect(&mut self) -> Result<(), Report<KubernetesError>> {
        self.state = WatchState::Connecting;
        loop {
            match self.source.open().await {
                Ok(stream) => {
                    self.cursor = Some(WatchCursor {
                        stream,
                        deadline: rotation_deadline(self.rotate_after),
                        last_was_error: false,
                    });
                    if self.connected {
                        self.renewals += 1;
                        debug!(kind = self.kind, renewals = self.renewals, "watch renewed");
                    } else {
                        info!(kind = self.kind, "watch opened");
                    }
                    self.connected = true;
                    self.state = WatchState::Streaming;
                    return Ok(());
                }
                Err(report) if !self.connected => return Err(report),
                Err(report) => {
                    error!(
                        kind = self.kind,
                        "Failed to reopen watch, retrying in {:?}: {report:?}", self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

fn rotation_deadline(rotate_after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(rotate_after).unwrap_or(now + FAR_FUTURE)
}

fn cursor_mark<K>(cursor: &mut Option<WatchCursor<K>>, is_error: bool) {
    if let Some(cursor) = cursor {
        cursor.last_was_error = is_error;
    }
}
