use event_queue::{
    BulkTracker, EventQueue, OperationCallbacks, OperationOutcome, RegistrationToken, Settled,
    WaitError,
};
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use shared::{
    error::ApiException,
    protocol::{OperationMetadata, ResponseEnvelope, ResponseKind},
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod events;

pub use reqwest::Method;

pub use events::{
    completion_outcome, EventScope, EventStreamListener, ListenerError, ListenerSettings,
    StreamEvent,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request {method} {url} failed: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server rejected {method} {path}: {error}")]
    Api {
        method: Method,
        path: String,
        error: ApiException,
    },
    #[error("expected an async operation from {method} {path}, got a {kind} response")]
    NotAsync {
        method: Method,
        path: String,
        kind: ResponseKind,
    },
    #[error("invalid response body from {method} {path}: {source}")]
    Decode {
        method: Method,
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid request body for {path}: {source}")]
    Body {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// A mutating API call that the server answers with an operation.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl OperationRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn project(self, project: impl Into<String>) -> Self {
        self.query("project", project)
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json<T: Serialize>(self, body: &T) -> Result<Self, ClientError> {
        let value = serde_json::to_value(body).map_err(|source| ClientError::Body {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.body(value))
    }
}

/// Issues mutating requests and parks their completion in an [`EventQueue`].
///
/// Completions only arrive while an [`EventStreamListener`] feeding the same queue is
/// running.
#[derive(Debug, Clone)]
pub struct OperationClient {
    http: Client,
    server_url: String,
    queue: EventQueue,
}

impl OperationClient {
    pub fn new(server_url: impl Into<String>, queue: EventQueue) -> Self {
        Self::with_http_client(Client::new(), server_url, queue)
    }

    pub fn with_http_client(
        http: Client,
        server_url: impl Into<String>,
        queue: EventQueue,
    ) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            server_url,
            queue,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Sends `request` and returns the operation the server created for it.
    pub async fn submit(
        &self,
        request: &OperationRequest,
    ) -> Result<OperationMetadata, ClientError> {
        let url = format!("{}{}", self.server_url, request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .query(&request.query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let transport_error = |source| ClientError::Transport {
            method: request.method.clone(),
            url: url.clone(),
            source,
        };
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport_error)?;

        if !status.is_success() {
            let error: ApiException = match serde_json::from_slice::<ResponseEnvelope>(&bytes) {
                Ok(envelope) => envelope.api_error(status.as_u16()).into(),
                Err(_) => {
                    ApiException::new(status.as_u16(), String::from_utf8_lossy(&bytes).trim())
                }
            };
            return Err(ClientError::Api {
                method: request.method.clone(),
                path: request.path.clone(),
                error,
            });
        }

        let decode_error = |source| ClientError::Decode {
            method: request.method.clone(),
            path: request.path.clone(),
            source,
        };
        let envelope: ResponseEnvelope = serde_json::from_slice(&bytes).map_err(decode_error)?;
        if envelope.kind != ResponseKind::Async {
            return Err(ClientError::NotAsync {
                method: request.method.clone(),
                path: request.path.clone(),
                kind: envelope.kind,
            });
        }
        let metadata: OperationMetadata =
            serde_json::from_value(envelope.metadata).map_err(decode_error)?;

        debug!(
            operation_id = %metadata.id,
            method = %request.method,
            path = %request.path,
            description = %metadata.description,
            "operation created"
        );
        Ok(metadata)
    }

    /// Sends `request` and registers `callbacks` for its operation. Request failures are
    /// returned before anything is registered.
    pub async fn submit_and_track(
        &self,
        request: &OperationRequest,
        callbacks: OperationCallbacks,
    ) -> Result<RegistrationToken, ClientError> {
        let metadata = self.submit(request).await?;
        Ok(self.queue.register_callbacks(metadata.id, callbacks))
    }

    /// Sends `request` and waits until the event stream reports its operation finished.
    pub async fn submit_and_wait(
        &self,
        request: &OperationRequest,
    ) -> Result<OperationOutcome, ClientError> {
        let metadata = self.submit(request).await?;
        let outcome = self.queue.wait_for(metadata.id).await?;
        Ok(outcome)
    }

    /// Sends every request concurrently and returns once each has either been rejected or
    /// seen its operation complete. Results are in settlement order.
    pub async fn submit_bulk(
        &self,
        requests: &[OperationRequest],
    ) -> Result<Vec<Settled>, ClientError> {
        let (tracker, completion) = BulkTracker::new(requests.len());

        join_all(requests.iter().map(|request| {
            let tracker = tracker.clone();
            async move {
                match self.submit(request).await {
                    Ok(metadata) => {
                        self.queue
                            .register_callbacks(metadata.id, tracker.callbacks());
                    }
                    Err(err) => {
                        warn!(path = %request.path, error = %err, "bulk request rejected");
                        tracker.push_failure(err.to_string());
                    }
                }
            }
        }))
        .await;
        drop(tracker);

        let results = completion.wait().await?;
        let counts = event_queue::settled_counts(&results);
        info!(
            fulfilled = counts.fulfilled,
            rejected = counts.rejected,
            "bulk action settled"
        );
        Ok(results)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
