//! Bus error types.

use std::time::Duration;

use thiserror::Error;

use cohort_core::error::{EntityKind, OrchestratorError};

/// Errors from message delivery.
#[derive(Debug, Error)]
pub enum BusError {
    /// The message named a receiver with no registered endpoint.
    #[error("unknown receiver: {0}")]
    UnknownReceiver(String),

    /// A unicast `send` was given a broadcast message.
    #[error("message has no receiver")]
    MissingReceiver,

    /// No handler is installed for the message type on the receiving node.
    #[error("no handler registered for message type: {0}")]
    HandlerMissing(String),

    /// At most one handler per message type.
    #[error("handler already registered for message type: {0}")]
    HandlerExists(String),

    /// The round-trip exceeded its deadline. Never retried by the bus.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Could not reach or authenticate the remote endpoint.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Certificate or key material could not be loaded.
    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport-level failure reported by the remote side.
    #[error("transport error: {0}")]
    Transport(String),

    /// The bus server is not running.
    #[error("bus is not running")]
    NotRunning,
}

impl From<BusError> for OrchestratorError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::UnknownReceiver(id) => OrchestratorError::unknown(EntityKind::Agent, id),
            BusError::Timeout(d) => {
                OrchestratorError::Timeout(format!("bus round-trip exceeded {d:?}"))
            }
            other => OrchestratorError::TransportError(other.to_string()),
        }
    }
}
