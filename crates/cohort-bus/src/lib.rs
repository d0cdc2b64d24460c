//! # cohort-bus
//!
//! Typed message delivery between the orchestrator and its agents.
//!
//! The bus routes by receiver id for unicast and by agent kind for
//! broadcast. In-process agents are dispatched straight to the node's
//! handler registry; out-of-process agents are reached over a gRPC channel
//! with mutual TLS (both peers present certificates signed by the
//! configured CA).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cohort_bus::{handler_fn, BusConfig, MessageBus};
//! use cohort_core::protocol::{AgentMessage, AgentResponse};
//! use cohort_core::types::{AgentEndpoint, AgentId, AgentKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(MessageBus::new(BusConfig::default()));
//!
//!     bus.register_handler(
//!         "tokenize",
//!         handler_fn(|m| async move { AgentResponse::ok(&m, b"[]".to_vec()) }),
//!     )
//!     .await?;
//!     bus.register_endpoint(
//!         AgentId::new("parser-1"),
//!         AgentKind::new("parser"),
//!         &AgentEndpoint::Local,
//!     )
//!     .await?;
//!
//!     let msg = AgentMessage::new("orchestrator", "parser-1", "tokenize", vec![]);
//!     let response = bus.send(&msg).await?;
//!     assert!(response.success);
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod error;
pub mod handler;
pub mod server;
pub mod transport;

/// Generated wire types for the bus protocol.
pub mod proto {
    tonic::include_proto!("cohort.bus.v1");
}

pub use bus::{BroadcastDelivery, BusConfig, MessageBus};
pub use error::BusError;
pub use handler::{handler_fn, HandlerRegistry, MessageHandler};
pub use server::BusServer;
pub use transport::{GrpcTransport, LocalTransport, TlsSettings, Transport};
