//! The message bus: endpoint routing, directed send, broadcast fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use cohort_core::protocol::{AgentMessage, AgentResponse};
use cohort_core::types::{AgentEndpoint, AgentId, AgentKind};

use crate::error::BusError;
use crate::handler::{HandlerRegistry, MessageHandler};
use crate::transport::{GrpcTransport, LocalTransport, TlsSettings, Transport};

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Deadline applied when the caller does not provide one.
    pub default_timeout: Duration,
    /// Client-side identity for remote endpoints. Required before any
    /// `Remote` endpoint can be registered.
    pub client_tls: Option<TlsSettings>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            client_tls: None,
        }
    }
}

struct Route {
    kind: AgentKind,
    transport: Arc<dyn Transport>,
}

/// Per-recipient outcome of a broadcast. Partial failures are reported here,
/// never collapsed into one error.
#[derive(Debug)]
pub struct BroadcastDelivery {
    pub agent_id: AgentId,
    pub result: Result<AgentResponse, BusError>,
}

/// Routes typed messages between the orchestrator and agents.
pub struct MessageBus {
    handlers: Arc<HandlerRegistry>,
    routes: RwLock<HashMap<AgentId, Route>>,
    config: BusConfig,
    messages_sent: AtomicU64,
    delivery_failures: AtomicU64,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            handlers: Arc::new(HandlerRegistry::new()),
            routes: RwLock::new(HashMap::new()),
            config,
            messages_sent: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// The node's handler registry, shared with the bus server.
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.handlers)
    }

    /// Install a handler for a message type on this node.
    pub async fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        self.handlers.register(message_type, handler).await
    }

    /// Make an agent reachable. Remote endpoints require client TLS.
    pub async fn register_endpoint(
        &self,
        id: AgentId,
        kind: AgentKind,
        endpoint: &AgentEndpoint,
    ) -> Result<(), BusError> {
        let transport: Arc<dyn Transport> = match endpoint {
            AgentEndpoint::Local => Arc::new(LocalTransport::new(self.handlers())),
            AgentEndpoint::Remote(uri) => {
                let tls = self.config.client_tls.clone().ok_or_else(|| {
                    BusError::Tls("client identity not configured for remote endpoints".into())
                })?;
                Arc::new(GrpcTransport::new(uri.clone(), tls))
            }
        };
        debug!(agent_id = %id, kind = %kind, "endpoint registered");
        self.routes.write().await.insert(id, Route { kind, transport });
        Ok(())
    }

    /// Remove an agent's route. Returns false if it was unknown.
    pub async fn unregister_endpoint(&self, id: &AgentId) -> bool {
        self.routes.write().await.remove(id).is_some()
    }

    /// Synchronous request/response with the default deadline.
    pub async fn send(&self, message: &AgentMessage) -> Result<AgentResponse, BusError> {
        self.send_with_timeout(message, self.config.default_timeout)
            .await
    }

    /// Synchronous request/response. The deadline bounds the round-trip;
    /// exceeding it is a timeout delivery-failure with no retry.
    #[instrument(skip(self, message), fields(message_type = %message.message_type))]
    pub async fn send_with_timeout(
        &self,
        message: &AgentMessage,
        timeout: Duration,
    ) -> Result<AgentResponse, BusError> {
        let receiver = message.receiver.clone().ok_or(BusError::MissingReceiver)?;
        let transport = {
            let routes = self.routes.read().await;
            let route = routes
                .get(&receiver)
                .ok_or_else(|| BusError::UnknownReceiver(receiver.as_str().to_string()))?;
            Arc::clone(&route.transport)
        };

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let result = transport.deliver(message, timeout).await;
        if result.is_err() {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Fire-and-forget send. The callback runs exactly once with either the
    /// response or the delivery failure.
    pub fn send_async<F>(self: &Arc<Self>, message: AgentMessage, callback: F)
    where
        F: FnOnce(Result<AgentResponse, BusError>) + Send + 'static,
    {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let result = bus.send(&message).await;
            callback(result);
        });
    }

    /// Deliver `message` to every agent of `kind`, as repeated unicast.
    /// Results are reported per recipient.
    pub async fn broadcast(
        &self,
        kind: &AgentKind,
        message: &AgentMessage,
    ) -> Vec<BroadcastDelivery> {
        let recipients: Vec<(AgentId, Arc<dyn Transport>)> = {
            let routes = self.routes.read().await;
            routes
                .iter()
                .filter(|(_, route)| route.kind == *kind)
                .map(|(id, route)| (id.clone(), Arc::clone(&route.transport)))
                .collect()
        };

        if recipients.is_empty() {
            warn!(kind = %kind, "broadcast matched no agents");
        }

        let timeout = self.config.default_timeout;
        let deliveries = recipients.into_iter().map(|(id, transport)| {
            let mut unicast = message.clone();
            unicast.receiver = Some(id.clone());
            async move {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                let result = transport.deliver(&unicast, timeout).await;
                if result.is_err() {
                    self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                }
                BroadcastDelivery {
                    agent_id: id,
                    result,
                }
            }
        });
        join_all(deliveries).await
    }

    /// Agents currently routable for `kind`.
    pub async fn recipients_of(&self, kind: &AgentKind) -> Vec<AgentId> {
        self.routes
            .read()
            .await
            .iter()
            .filter(|(_, route)| route.kind == *kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }
}
