//! Message handlers and the per-node handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use cohort_core::protocol::{AgentMessage, AgentResponse};

use crate::error::BusError;

/// Handles messages of one type on the receiving node. Implementations must
/// be safe to invoke concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: AgentMessage) -> AgentResponse;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(AgentMessage) -> Fut + Send + Sync,
    Fut: Future<Output = AgentResponse> + Send,
{
    async fn handle(&self, message: AgentMessage) -> AgentResponse {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AgentResponse> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Type-routed handlers for one node. At most one handler per message type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler for `message_type`.
    pub async fn register(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let message_type = message_type.into();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&message_type) {
            return Err(BusError::HandlerExists(message_type));
        }
        debug!(message_type = %message_type, "handler registered");
        handlers.insert(message_type, handler);
        Ok(())
    }

    /// Route a message to its handler.
    pub async fn dispatch(&self, message: AgentMessage) -> Result<AgentResponse, BusError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&message.message_type)
            .cloned()
            .ok_or_else(|| BusError::HandlerMissing(message.message_type.clone()))?;
        Ok(handler.handle(message).await)
    }

    pub async fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.read().await.contains_key(message_type)
    }
}
