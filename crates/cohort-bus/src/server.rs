//! The bus server: accepts authenticated deliveries and dispatches them to
//! the local handler registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{error, info};

use cohort_core::protocol::{AgentMessage, AgentResponse};

use crate::error::BusError;
use crate::handler::HandlerRegistry;
use crate::proto;
use crate::proto::agent_bus_server::{AgentBus, AgentBusServer};
use crate::transport::TlsSettings;

struct BusService {
    handlers: Arc<HandlerRegistry>,
    in_flight: Arc<AtomicI64>,
}

#[tonic::async_trait]
impl AgentBus for BusService {
    async fn deliver(
        &self,
        request: Request<proto::Envelope>,
    ) -> Result<Response<proto::Reply>, Status> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let message = AgentMessage::from(request.into_inner());

        let reply = match self.handlers.dispatch(message.clone()).await {
            Ok(response) => proto::Reply::from(&response),
            // Delivery reached the node but nothing handles the type; report
            // it in-protocol so the sender sees a failed response, not a
            // transport error.
            Err(err) => proto::Reply::from(&AgentResponse::fail(&message, err.to_string())),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Response::new(reply))
    }
}

/// Listens on the configured address with mutual TLS.
pub struct BusServer {
    addr: SocketAddr,
    tls: TlsSettings,
    handlers: Arc<HandlerRegistry>,
    in_flight: Arc<AtomicI64>,
    shutdown: tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BusServer {
    pub fn new(addr: SocketAddr, tls: TlsSettings, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            addr,
            tls,
            handlers,
            in_flight: Arc::new(AtomicI64::new(0)),
            shutdown: tokio::sync::Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Start serving. Both peers must present certificates signed by the
    /// configured CA.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let identity = self.tls.load_identity().await?;
        let ca = self.tls.load_ca().await?;
        let tls = ServerTlsConfig::new().identity(identity).client_ca_root(ca);

        let service = BusService {
            handlers: Arc::clone(&self.handlers),
            in_flight: Arc::clone(&self.in_flight),
        };

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let router = Server::builder()
            .tls_config(tls)
            .map_err(|e| BusError::Tls(e.to_string()))?
            .add_service(AgentBusServer::new(service));

        let addr = self.addr;
        let handle = tokio::spawn(async move {
            let served = router
                .serve_with_shutdown(addr, async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(%addr, error = %e, "bus server exited with error");
            }
        });

        info!(%addr, "bus server listening");
        *self.shutdown.lock().await = Some(tx);
        *task = Some(handle);
        Ok(())
    }

    /// Stop serving and wait for the listener to wind down.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
            info!(addr = %self.addr, "bus server stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Deliveries currently being handled.
    pub fn active_deliveries(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}
