//! Message types exchanged between the orchestrator and agents.
//!
//! A [`AgentMessage`] is routed by `receiver` (unicast) or by agent kind
//! (broadcast, `receiver` empty). The `correlation_id` is echoed on the
//! response so callers can pair replies with requests; cancel signals reuse
//! the correlation id of the dispatch they revoke.

use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::types::AgentId;

/// Milliseconds since process start, from a monotonic clock.
pub fn monotonic_ms() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// A typed message addressed to an agent (or to every agent of a kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub sender: AgentId,
    /// Unicast target; `None` for broadcasts.
    pub receiver: Option<AgentId>,
    /// Opaque tag used to route to a handler.
    pub message_type: String,
    pub payload: Vec<u8>,
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub correlation_id: String,
}

impl AgentMessage {
    /// Create a unicast message with a fresh correlation id.
    pub fn new(
        sender: impl Into<AgentId>,
        receiver: impl Into<AgentId>,
        message_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: Some(receiver.into()),
            message_type: message_type.into(),
            payload,
            timestamp_ms: monotonic_ms(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Create a broadcast message (no receiver; the bus resolves recipients).
    pub fn broadcast(
        sender: impl Into<AgentId>,
        message_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: None,
            message_type: message_type.into(),
            payload,
            timestamp_ms: monotonic_ms(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Reuse an existing correlation id (cancel signals, retried sends).
    #[must_use]
    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Serialize a JSON value as the payload.
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.payload = serde_json::to_vec(value).unwrap_or_default();
        self
    }

    /// Parse the payload as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Response returned by a message handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    pub data: Vec<u8>,
    pub error: Option<String>,
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Echoed from the request.
    pub correlation_id: String,
}

impl AgentResponse {
    /// Successful response to `request`.
    pub fn ok(request: &AgentMessage, data: Vec<u8>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            timestamp_ms: monotonic_ms(),
            correlation_id: request.correlation_id.clone(),
        }
    }

    /// Successful response carrying a JSON body.
    pub fn ok_json(request: &AgentMessage, value: &serde_json::Value) -> Self {
        Self::ok(request, serde_json::to_vec(value).unwrap_or_default())
    }

    /// Failure response to `request`.
    pub fn fail(request: &AgentMessage, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            error: Some(error.into()),
            timestamp_ms: monotonic_ms(),
            correlation_id: request.correlation_id.clone(),
        }
    }

    /// Parse the data as JSON.
    pub fn data_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}
