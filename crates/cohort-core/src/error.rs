//! Orchestrator error taxonomy.
//!
//! Every recoverable failure is a distinct variant so callers can branch on
//! it; the workflow engine in particular needs [`OrchestratorError::Timeout`]
//! and [`OrchestratorError::TransportError`] to stay distinguishable.

use thiserror::Error;

use crate::lifecycle::{AgentEvent, AgentState};

/// The kind of entity a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Agent,
    Workflow,
    Execution,
    Allocation,
    Resource,
    Step,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Agent => "agent",
            EntityKind::Workflow => "workflow",
            EntityKind::Execution => "execution",
            EntityKind::Allocation => "allocation",
            EntityKind::Resource => "resource",
            EntityKind::Step => "step",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A referenced id (agent, workflow, execution, allocation) does not exist.
    #[error("unknown {kind}: {id}")]
    UnknownEntity { kind: EntityKind, id: String },

    /// The lifecycle FSM rejected the (state, event) pair.
    #[error("illegal transition: {state} does not accept {event}")]
    IllegalTransition { state: AgentState, event: AgentEvent },

    /// A request could not be satisfied from a bucket or quota.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A workflow contains a cycle, dangling dependency or duplicate id.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// No live agent of the required type is available.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// A deadline was exceeded on a step or a bus call.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller or by shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Bus-level authentication, connection or serialization failure.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The configuration file was unreadable or carried unrecognized options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The orchestrator has not been started (or was stopped).
    #[error("orchestrator is not running")]
    NotRunning,

    /// An assertion about the data model failed. Fatal: the orchestrator
    /// degrades and the affected execution aborts.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl OrchestratorError {
    pub fn unknown(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::UnknownEntity {
            kind,
            id: id.into(),
        }
    }

    /// Whether the containing execution may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted(_)
                | Self::Timeout(_)
                | Self::Cancelled(_)
                | Self::DispatchFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
