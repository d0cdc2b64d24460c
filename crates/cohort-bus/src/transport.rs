//! Delivery transports.
//!
//! Agents registered in this process use [`LocalTransport`], which hands the
//! message straight to the node's handler registry. Out-of-process agents
//! use [`GrpcTransport`], which speaks the wire protocol over a channel with
//! mutual TLS: the client presents its own identity and pins the configured
//! CA, mirroring the server side in [`crate::server::BusServer`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::{debug, warn};

use cohort_core::protocol::{AgentMessage, AgentResponse};

use crate::error::BusError;
use crate::handler::HandlerRegistry;
use crate::proto;
use crate::proto::agent_bus_client::AgentBusClient;

/// Certificate material for one side of the mutually-authenticated channel.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
    /// Domain name the client expects in the server certificate; defaults
    /// to the endpoint host.
    pub domain: Option<String>,
}

impl TlsSettings {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>, ca: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            ca: ca.into(),
            domain: None,
        }
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Load this side's identity (certificate + private key).
    pub async fn load_identity(&self) -> Result<Identity, BusError> {
        let cert = read(&self.cert).await?;
        let key = read(&self.key).await?;
        Ok(Identity::from_pem(cert, key))
    }

    /// Load the CA certificate peers must be signed by.
    pub async fn load_ca(&self) -> Result<Certificate, BusError> {
        Ok(Certificate::from_pem(read(&self.ca).await?))
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, BusError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| BusError::Tls(format!("cannot read {}: {e}", path.display())))
}

/// Delivers one message within `timeout` and returns the handler's response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        message: &AgentMessage,
        timeout: Duration,
    ) -> Result<AgentResponse, BusError>;
}

/// In-process delivery to the local handler registry.
pub struct LocalTransport {
    handlers: Arc<HandlerRegistry>,
}

impl LocalTransport {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn deliver(
        &self,
        message: &AgentMessage,
        timeout: Duration,
    ) -> Result<AgentResponse, BusError> {
        match tokio::time::timeout(timeout, self.handlers.dispatch(message.clone())).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

/// Authenticated delivery to a remote node.
pub struct GrpcTransport {
    uri: String,
    tls: TlsSettings,
    client: tokio::sync::Mutex<Option<AgentBusClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new(uri: impl Into<String>, tls: TlsSettings) -> Self {
        Self {
            uri: uri.into(),
            tls,
            client: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect lazily and cache the channel.
    async fn client(&self) -> Result<AgentBusClient<Channel>, BusError> {
        let mut cached = self.client.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }

        let identity = self.tls.load_identity().await?;
        let ca = self.tls.load_ca().await?;
        let mut tls = ClientTlsConfig::new().identity(identity).ca_certificate(ca);
        if let Some(domain) = &self.tls.domain {
            tls = tls.domain_name(domain.clone());
        }

        let channel = Channel::from_shared(self.uri.clone())
            .map_err(|e| BusError::ConnectionFailed(format!("bad uri {}: {e}", self.uri)))?
            .tls_config(tls)
            .map_err(|e| BusError::Tls(e.to_string()))?
            .connect()
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        debug!(uri = %self.uri, "bus channel connected");
        let client = AgentBusClient::new(channel);
        *cached = Some(client.clone());
        Ok(client)
    }

    async fn drop_client(&self) {
        *self.client.lock().await = None;
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn deliver(
        &self,
        message: &AgentMessage,
        timeout: Duration,
    ) -> Result<AgentResponse, BusError> {
        let mut client = self.client().await?;

        let mut request = tonic::Request::new(proto::Envelope::from(message));
        // Carries the deadline to the handler via the grpc-timeout header.
        request.set_timeout(timeout);

        match tokio::time::timeout(timeout, client.deliver(request)).await {
            Ok(Ok(reply)) => Ok(AgentResponse::from(reply.into_inner())),
            Ok(Err(status)) if status.code() == tonic::Code::DeadlineExceeded => {
                Err(BusError::Timeout(timeout))
            }
            Ok(Err(status)) => {
                warn!(uri = %self.uri, code = ?status.code(), "bus call failed");
                self.drop_client().await;
                Err(BusError::Transport(status.to_string()))
            }
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

impl From<&AgentMessage> for proto::Envelope {
    fn from(message: &AgentMessage) -> Self {
        Self {
            sender_id: message.sender.as_str().to_string(),
            receiver_id: message
                .receiver
                .as_ref()
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            message_type: message.message_type.clone(),
            payload: message.payload.clone(),
            timestamp_ms: message.timestamp_ms,
            correlation_id: message.correlation_id.clone(),
        }
    }
}

impl From<proto::Envelope> for AgentMessage {
    fn from(envelope: proto::Envelope) -> Self {
        let receiver = if envelope.receiver_id.is_empty() {
            None
        } else {
            Some(envelope.receiver_id.into())
        };
        Self {
            sender: envelope.sender_id.into(),
            receiver,
            message_type: envelope.message_type,
            payload: envelope.payload,
            timestamp_ms: envelope.timestamp_ms,
            correlation_id: envelope.correlation_id,
        }
    }
}

impl From<proto::Reply> for AgentResponse {
    fn from(reply: proto::Reply) -> Self {
        let error = if reply.error.is_empty() {
            None
        } else {
            Some(reply.error)
        };
        Self {
            success: reply.success,
            data: reply.data,
            error,
            timestamp_ms: reply.timestamp_ms,
            correlation_id: reply.correlation_id,
        }
    }
}

impl From<&AgentResponse> for proto::Reply {
    fn from(response: &AgentResponse) -> Self {
        Self {
            success: response.success,
            data: response.data.clone(),
            error: response.error.clone().unwrap_or_default(),
            timestamp_ms: response.timestamp_ms,
            correlation_id: response.correlation_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    #[tokio::test]
    async fn test_local_transport_roundtrip() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers
            .register(
                "echo",
                handler_fn(|m| async move {
                    let payload = m.payload.clone();
                    AgentResponse::ok(&m, payload)
                }),
            )
            .await
            .unwrap();

        let transport = LocalTransport::new(handlers);
        let msg = AgentMessage::new("a", "b", "echo", b"hi".to_vec());
        let response = transport
            .deliver(&msg, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.data, b"hi");
        assert_eq!(response.correlation_id, msg.correlation_id);
    }

    #[tokio::test]
    async fn test_local_transport_times_out() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers
            .register(
                "slow",
                handler_fn(|m| async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    AgentResponse::ok(&m, vec![])
                }),
            )
            .await
            .unwrap();

        let transport = LocalTransport::new(handlers);
        let msg = AgentMessage::new("a", "b", "slow", vec![]);
        let err = transport
            .deliver(&msg, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }

    #[test]
    fn test_envelope_conversion_roundtrip() {
        let msg = AgentMessage::new("sender", "receiver", "analyze", b"body".to_vec());
        let envelope = proto::Envelope::from(&msg);
        let back = AgentMessage::from(envelope);
        assert_eq!(back.sender, msg.sender);
        assert_eq!(back.receiver, msg.receiver);
        assert_eq!(back.correlation_id, msg.correlation_id);
        assert_eq!(back.payload, msg.payload);
    }
}
