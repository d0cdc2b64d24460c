//! # cohort-orchestrator
//!
//! The orchestrator core: a workflow engine executing dependency DAGs over
//! registered agents, composed with the lifecycle FSM, token-bucket resource
//! manager and authenticated message bus from the sibling crates.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use cohort_bus::handler_fn;
//! use cohort_core::protocol::AgentResponse;
//! use cohort_core::types::AgentDescriptor;
//! use cohort_core::workflow::{Workflow, WorkflowStep};
//! use cohort_orchestrator::{Orchestrator, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Arc::new(
//!         Orchestrator::from_config(OrchestratorConfig::default()).await?,
//!     );
//!     orchestrator.start().await?;
//!
//!     orchestrator
//!         .register_handler(
//!             "tokenize",
//!             handler_fn(|m| async move {
//!                 AgentResponse::ok_json(&m, &serde_json::json!({"tokens": "12"}))
//!             }),
//!         )
//!         .await?;
//!
//!     let parser = AgentDescriptor::new("tokenizer", "parser".into());
//!     let parser_id = parser.id.clone();
//!     orchestrator.register_agent(parser).await?;
//!     orchestrator.activate_agent(&parser_id)?;
//!
//!     let workflow = Workflow::new(
//!         "ingest",
//!         vec![WorkflowStep::new("s1", "parser", "tokenize")],
//!         HashMap::new(),
//!     )?;
//!     let workflow_id = orchestrator.define_workflow(workflow).await;
//!     let execution_id = orchestrator.execute(&workflow_id, HashMap::new(), None).await?;
//!     let result = orchestrator.wait(&execution_id).await?;
//!     println!("finished: {:?}", result.status);
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod schedule;

pub use config::{ConfigError, OrchestratorConfig, QuotaEntry, ResourceEntry, TlsConfig};
pub use engine::{
    CompletionCallback, EngineConfig, EngineStats, EngineStatsSnapshot, WorkflowEngine,
    CANCEL_MESSAGE_TYPE,
};
pub use orchestrator::{Health, Orchestrator, StatisticsSnapshot};
pub use schedule::{plan_region_batches, RegionSchedule};
