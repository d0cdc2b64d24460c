//! # cohort-core
//!
//! Core components for the cohort orchestrator.
//!
//! This crate provides:
//! - [`lifecycle::LifecycleManager`] - Per-agent finite-state machine with
//!   transition hooks and append-only history
//! - [`registry::AgentRegistry`] - Registered agents, capabilities and liveness
//! - [`resources::ResourceManager`] - Token-bucket admission control with
//!   per-agent quotas and allocation expiry
//! - [`workflow`] - Immutable workflow definitions and per-execution context
//! - [`protocol`] - Typed messages exchanged over the bus
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cohort_core::registry::AgentRegistry;
//! use cohort_core::types::{AgentDescriptor, AgentEndpoint, AgentKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = AgentRegistry::new(std::time::Duration::from_secs(5));
//!
//!     let parser = AgentDescriptor::new("tokenizer", AgentKind::new("parser"))
//!         .capability("language", "prompt-dsl")
//!         .endpoint(AgentEndpoint::Local);
//!     registry.register(parser).await?;
//!
//!     println!("registered agents: {}", registry.len().await);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod resources;
pub mod types;
pub mod workflow;

pub use error::{EntityKind, OrchestratorError};
pub use lifecycle::{AgentEvent, AgentState, LifecycleManager, TransitionRecord};
pub use protocol::{AgentMessage, AgentResponse};
pub use registry::{AgentRegistry, AgentSnapshot};
pub use resources::{
    Allocation, AllocationOutcome, BucketStats, DenialReason, ResourceConfig, ResourceManager,
    ResourceRequest,
};
pub use types::{
    AgentDescriptor, AgentEndpoint, AgentId, AgentKind, AgentMetrics, AllocationId, ExecutionId,
    StepId, WorkflowId,
};
pub use workflow::{
    ExecutionContext, ExecutionResult, ExecutionStatus, FailureKind, StepRecord, StepStatus,
    Workflow, WorkflowStep,
};
