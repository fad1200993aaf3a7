//! Consumer of the `/1.0/events` websocket that resolves operations in an [`EventQueue`].

use std::{sync::Arc, time::Duration};

use event_queue::{EventQueue, OperationOutcome};
use futures::StreamExt;
use shared::{
    domain::OperationStatus,
    protocol::{OperationEvent, OperationMetadata, ServerEvent},
};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const STREAM_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect event stream {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("event stream receive failed: {0}")]
    Receive(#[source] tokio_tungstenite::tungstenite::Error),
}

/// Which projects' operations the stream delivers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventScope {
    #[default]
    DefaultProject,
    Project(String),
    AllProjects,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub scope: EventScope,
    pub reconnect_delay: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            scope: EventScope::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Operation(OperationEvent),
    Disconnected { reason: String },
}

/// Maps a terminal operation status to the outcome handed to the queue.
pub fn completion_outcome(metadata: &OperationMetadata) -> Option<OperationOutcome> {
    if !metadata.status.is_terminal() {
        return None;
    }
    let outcome = match metadata.status {
        OperationStatus::Success => OperationOutcome::Success,
        OperationStatus::Cancelled if metadata.err.is_empty() => {
            OperationOutcome::Failure("Cancelled".to_string())
        }
        _ => OperationOutcome::Failure(metadata.err.clone()),
    };
    Some(outcome)
}

pub fn events_url(server_url: &str, scope: &EventScope) -> Result<Url, ListenerError> {
    let invalid = |reason: String| ListenerError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let mut url = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch scheme to '{scheme}'")))?;

    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base_path}/1.0/events"));
    url.set_fragment(None);
    {
        let mut query = url.query_pairs_mut();
        query.clear().append_pair("type", "operation");
        match scope {
            EventScope::DefaultProject => {}
            EventScope::Project(project) => {
                query.append_pair("project", project);
            }
            EventScope::AllProjects => {
                query.append_pair("all-projects", "true");
            }
        }
    }
    Ok(url)
}

/// Keeps a websocket to the event stream open, reconnecting after `reconnect_delay`, and
/// resolves the queue whenever an operation reaches a terminal status.
pub struct EventStreamListener {
    queue: EventQueue,
    url: Url,
    settings: ListenerSettings,
    events: broadcast::Sender<StreamEvent>,
}

impl EventStreamListener {
    pub fn new(
        server_url: &str,
        queue: EventQueue,
        settings: ListenerSettings,
    ) -> Result<Arc<Self>, ListenerError> {
        let url = events_url(server_url, &settings.scope)?;
        let (events, _) = broadcast::channel(STREAM_EVENT_CAPACITY);
        Ok(Arc::new(Self {
            queue,
            url,
            settings,
            events,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let listener = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let reason = match listener.run_once().await {
                    Ok(()) => "event stream closed".to_string(),
                    Err(err) => err.to_string(),
                };
                warn!(
                    url = %listener.url,
                    %reason,
                    delay_ms = listener.settings.reconnect_delay.as_millis() as u64,
                    "event stream disconnected; reconnecting"
                );
                let _ = listener.events.send(StreamEvent::Disconnected { reason });
                tokio::time::sleep(listener.settings.reconnect_delay).await;
            }
        })
    }

    /// Runs one connection until the server closes it.
    pub async fn run_once(&self) -> Result<(), ListenerError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|source| ListenerError::Connect {
                url: self.url.to_string(),
                source,
            })?;
        info!(url = %self.url, "event stream connected");
        let _ = self.events.send(StreamEvent::Connected);

        let (_, mut ws_reader) = ws_stream.split();
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_frame(&text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => return Err(ListenerError::Receive(err)),
            }
        }
        Ok(())
    }

    pub fn handle_frame(&self, text: &str) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::Operation(event)) => event,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "skipping undecodable event frame");
                return;
            }
        };

        if let Some(outcome) = completion_outcome(&event.metadata) {
            let resolved = self.queue.resolve(&event.metadata.id, outcome);
            debug!(
                operation_id = %event.metadata.id,
                status = ?event.metadata.status,
                resolved,
                "operation reached terminal status"
            );
        }
        let _ = self.events.send(StreamEvent::Operation(event));
    }
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
