//! Live output stream protocol between the task service and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceIdPayload, ResourceStatusPayload};

/// Sub-protocol tag sent ahead of the bearer token on connect.
pub const ACCESS_TOKEN_PROTOCOL: &str = "access_token";

/// Messages sent from server to client over the per-task stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Acknowledgment sent once the server has authenticated and subscribed
    /// the client. No data is surfaced before this arrives.
    Connected {
        #[serde(default)]
        task_id: Option<u64>,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// A stdout line from the infrastructure tool.
    Output(OutputLine),
    /// A stderr line from the infrastructure tool.
    Error(OutputLine),
    /// Begin/end of a named execution stage.
    StageMarker(StageMarker),
    /// The task finished; the server closes the stream afterwards.
    Completed {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Apply progress for one resource. Payload is JSON inside `line`.
    ResourceStatusUpdate(EncodedPayload),
    /// Cloud identifier discovered for one resource after apply.
    ResourceIdUpdate(EncodedPayload),
    /// A message type this client does not know about.
    #[serde(other)]
    Unknown,
}

impl StreamMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Connected { .. } => "connected",
            StreamMessage::Output(_) => "output",
            StreamMessage::Error(_) => "error",
            StreamMessage::StageMarker(_) => "stage_marker",
            StreamMessage::Completed { .. } => "completed",
            StreamMessage::ResourceStatusUpdate(_) => "resource_status_update",
            StreamMessage::ResourceIdUpdate(_) => "resource_id_update",
            StreamMessage::Unknown => "unknown",
        }
    }

    /// Server-assigned line number, used to drop replayed history.
    pub fn line_num(&self) -> Option<u64> {
        match self {
            StreamMessage::Output(line) | StreamMessage::Error(line) => line.line_num,
            StreamMessage::StageMarker(marker) => marker.line_num,
            _ => None,
        }
        .filter(|n| *n > 0)
    }
}

/// One line of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    #[serde(default)]
    pub line: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_num: Option<u64>,
}

/// Whether a stage marker opens or closes its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Begin,
    End,
}

/// Structured announcement of a stage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMarker {
    pub stage: String,
    pub status: MarkerStatus,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// The rendered `========== X BEGIN at ... ==========` line.
    #[serde(default)]
    pub line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_num: Option<u64>,
}

impl StageMarker {
    pub fn begin(stage: impl Into<String>) -> Self {
        Self::new(stage, MarkerStatus::Begin)
    }

    pub fn end(stage: impl Into<String>) -> Self {
        Self::new(stage, MarkerStatus::End)
    }

    fn new(stage: impl Into<String>, status: MarkerStatus) -> Self {
        Self {
            stage: stage.into(),
            status,
            timestamp: None,
            line: String::new(),
            line_num: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Lowercase stage name.
    pub fn stage_name(&self) -> String {
        self.stage.trim().to_lowercase()
    }
}

/// A message whose payload is a JSON document encoded in `line`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedPayload {
    pub line: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EncodedPayload {
    pub fn status_update(&self) -> serde_json::Result<ResourceStatusPayload> {
        serde_json::from_str(&self.line)
    }

    pub fn id_update(&self) -> serde_json::Result<ResourceIdPayload> {
        serde_json::from_str(&self.line)
    }
}

/// Transport-level status of a streaming connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connection bookkeeping owned by a streaming client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reconnect attempts since the last `connected` acknowledgment.
    pub reconnect_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
