use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{OperationClass, OperationId, OperationStatus},
    error::ApiError,
};

/// Server-side view of an operation, as carried by async responses and operation events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub id: OperationId,
    #[serde(default = "default_operation_class")]
    pub class: OperationClass,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub may_cancel: bool,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub location: String,
}

fn default_operation_class() -> OperationClass {
    OperationClass::Task
}

impl OperationMetadata {
    pub fn new(id: impl Into<OperationId>, status: OperationStatus) -> Self {
        Self {
            id: id.into(),
            class: OperationClass::Task,
            description: String::new(),
            created_at: None,
            updated_at: None,
            status,
            status_code: 0,
            resources: None,
            metadata: None,
            may_cancel: false,
            err: String::new(),
            location: String::new(),
        }
    }

    /// Resource URLs of the given kind, e.g. `instances` → `/1.0/instances/c1`.
    pub fn resource_urls(&self, kind: &str) -> &[String] {
        self.resources
            .as_ref()
            .and_then(|resources| resources.get(kind))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub metadata: OperationMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One frame of the `/1.0/events` websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Operation(OperationEvent),
    Logging(GenericEvent),
    Lifecycle(GenericEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Sync,
    Async,
    Error,
}

impl std::fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Top-level body of every REST response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ResponseEnvelope {
    pub fn operation_created(metadata: &OperationMetadata) -> serde_json::Result<Self> {
        Ok(Self {
            kind: ResponseKind::Async,
            status: "Operation created".to_string(),
            status_code: 100,
            operation: Some(format!("/1.0/operations/{}", metadata.id)),
            error: None,
            error_code: None,
            metadata: serde_json::to_value(metadata)?,
        })
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            status: String::new(),
            status_code: 0,
            operation: None,
            error: Some(message.into()),
            error_code: Some(status),
            metadata: serde_json::Value::Null,
        }
    }

    /// Converts an error body into [`ApiError`], falling back to the transport status.
    pub fn api_error(&self, http_status: u16) -> ApiError {
        let status = self.error_code.unwrap_or(http_status);
        let message = self
            .error
            .clone()
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| self.status.clone());
        ApiError::new(status, message)
    }
}
