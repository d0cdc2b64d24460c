//! The orchestrator facade: composes the registry, lifecycle manager,
//! resource manager, bus and workflow engine behind one entry point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use cohort_bus::{
    BroadcastDelivery, BusConfig, BusServer, MessageBus, MessageHandler, TlsSettings,
};
use cohort_core::error::{OrchestratorError, Result};
use cohort_core::lifecycle::{
    AgentEvent, AgentState, LifecycleHook, LifecycleManager, TransitionRecord,
};
use cohort_core::protocol::{AgentMessage, AgentResponse};
use cohort_core::registry::{AgentRegistry, AgentSnapshot};
use cohort_core::resources::{
    AllocationOutcome, BucketStats, ResourceConfig, ResourceManager, ResourceRequest,
};
use cohort_core::types::{AgentDescriptor, AgentId, AgentKind, AllocationId, ExecutionId, WorkflowId};
use cohort_core::workflow::{ExecutionResult, ExecutionStatus, Workflow};
use cohort_geometric::Point;

use crate::config::OrchestratorConfig;
use crate::engine::{CompletionCallback, EngineConfig, EngineStatsSnapshot, WorkflowEngine};
use crate::schedule::{plan_region_batches, RegionSchedule};

/// Operator-facing condition of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Stopped,
    Running,
    /// An internal invariant was violated; state is readable but no new
    /// work should be trusted until the process is restarted.
    Degraded,
}

/// Aggregate statistics across every component.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub agents: usize,
    pub workflows: usize,
    pub active_executions: usize,
    pub engine: EngineStatsSnapshot,
    pub messages_sent: u64,
    pub delivery_failures: u64,
    pub resources: HashMap<String, BucketStats>,
}

/// Single-process authority over agents, workflows and resources.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    lifecycle: Arc<LifecycleManager>,
    resources: Arc<ResourceManager>,
    bus: Arc<MessageBus>,
    engine: Arc<WorkflowEngine>,
    server: Mutex<Option<BusServer>>,
    running: AtomicBool,
}

impl Orchestrator {
    /// Load configuration from `config_path` and build the orchestrator.
    /// Buckets and quotas from the file are registered; nothing runs until
    /// [`Orchestrator::start`].
    pub async fn initialize(config_path: impl AsRef<Path>) -> Result<Self> {
        let config = OrchestratorConfig::from_path(config_path)
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        Self::from_config(config).await
    }

    /// Build from an already-parsed configuration.
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let registry = Arc::new(AgentRegistry::new(config.heartbeat_interval()));
        let lifecycle = Arc::new(LifecycleManager::new());
        let resources = Arc::new(ResourceManager::with_sweep_interval(
            config.expiration_sweep_interval(),
        ));
        resources.initialize(config.resource_configs()).await?;

        let client_tls = config
            .tls
            .as_ref()
            .map(|tls| TlsSettings::new(&tls.cert, &tls.key, &tls.ca));
        let bus = Arc::new(MessageBus::new(BusConfig {
            default_timeout: config.default_step_timeout(),
            client_tls,
        }));

        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            Arc::clone(&resources),
            Arc::clone(&bus),
            EngineConfig {
                default_step_timeout: config.default_step_timeout(),
                ..EngineConfig::default()
            },
        ));

        Ok(Self {
            config,
            registry,
            lifecycle,
            resources,
            bus,
            engine,
            server: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    // ========== LIFECYCLE OF THE ORCHESTRATOR ITSELF ==========

    /// Start background processing and, when configured, the bus listener.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.resources.start().await;

        if let Some(bind) = &self.config.bind_address {
            let started = self.start_server(bind).await;
            if let Err(err) = started {
                self.resources.stop().await;
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }

        info!("orchestrator started");
        Ok(())
    }

    async fn start_server(&self, bind: &str) -> Result<()> {
        let addr: SocketAddr = bind.parse().map_err(|e| {
            OrchestratorError::Configuration(format!("bad bind_address '{bind}': {e}"))
        })?;
        let tls = self
            .config
            .tls
            .as_ref()
            .ok_or_else(|| OrchestratorError::Configuration("bind_address requires tls".into()))?;
        let server = BusServer::new(
            addr,
            TlsSettings::new(&tls.cert, &tls.key, &tls.ca),
            self.bus.handlers(),
        );
        server.start().await.map_err(OrchestratorError::from)?;
        *self.server.lock().await = Some(server);
        Ok(())
    }

    /// Stop everything: cancel in-flight executions, terminate every agent
    /// lifecycle, then stop the bus, the bucket manager and the engine, in
    /// that order. Returns once every execution is terminal and all
    /// counters are final.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("orchestrator stopping");

        self.engine.cancel_all().await;

        for agent_id in self.lifecycle.all_agent_ids() {
            match self.lifecycle.trigger(&agent_id, AgentEvent::Terminate, None) {
                Ok(_) => {}
                Err(OrchestratorError::IllegalTransition { .. }) => {}
                Err(err) => warn!(agent_id = %agent_id, error = %err, "terminate failed"),
            }
        }

        if let Some(server) = self.server.lock().await.take() {
            server.stop().await;
        }
        self.resources.stop().await;
        self.engine.stop().await;

        info!("orchestrator stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> Health {
        if self.engine.is_degraded() || self.lifecycle.is_degraded() {
            Health::Degraded
        } else if self.is_running() {
            Health::Running
        } else {
            Health::Stopped
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(OrchestratorError::NotRunning)
        }
    }

    // ========== AGENTS ==========

    /// Register an agent and start tracking its lifecycle.
    pub async fn register_agent(&self, descriptor: AgentDescriptor) -> Result<()> {
        self.ensure_running()?;

        let id = descriptor.id.clone();
        let kind = descriptor.kind.clone();
        let endpoint = descriptor.endpoint.clone();

        self.registry.register(descriptor).await?;
        if let Err(err) = self.lifecycle.create(id.clone()) {
            let _ = self.registry.unregister(&id).await;
            return Err(err);
        }
        if let Err(err) = self
            .bus
            .register_endpoint(id.clone(), kind.clone(), &endpoint)
            .await
        {
            self.lifecycle.remove(&id);
            let _ = self.registry.unregister(&id).await;
            return Err(err.into());
        }

        for quota in &self.config.quotas {
            if quota.agent_type == kind.as_str() {
                self.resources
                    .set_agent_quota(id.clone(), quota.resource_type.clone(), quota.max)
                    .await;
            }
        }
        Ok(())
    }

    /// Terminate and remove an agent.
    pub async fn unregister_agent(&self, id: &AgentId) -> Result<()> {
        match self.lifecycle.trigger(id, AgentEvent::Terminate, None) {
            Ok(_) | Err(OrchestratorError::IllegalTransition { .. }) => {}
            Err(err) => return Err(err),
        }
        self.bus.unregister_endpoint(id).await;
        self.lifecycle.remove(id);
        self.registry.unregister(id).await?;
        Ok(())
    }

    /// Drive a lifecycle event for an agent.
    pub fn trigger_agent_event(
        &self,
        id: &AgentId,
        event: AgentEvent,
        data: Option<String>,
    ) -> Result<AgentState> {
        self.lifecycle.trigger(id, event, data)
    }

    /// Convenience: Initialize followed by InitializationComplete, leaving
    /// the agent Ready for dispatch.
    pub fn activate_agent(&self, id: &AgentId) -> Result<AgentState> {
        self.lifecycle.trigger(id, AgentEvent::Initialize, None)?;
        self.lifecycle
            .trigger(id, AgentEvent::InitializationComplete, None)
    }

    pub fn agent_state(&self, id: &AgentId) -> Result<AgentState> {
        self.lifecycle.state(id)
    }

    pub fn agent_history(&self, id: &AgentId) -> Result<Vec<TransitionRecord>> {
        self.lifecycle.history(id)
    }

    pub fn agents_in_state(&self, state: AgentState) -> Vec<AgentId> {
        self.lifecycle.agents_in_state(state)
    }

    pub async fn agent(&self, id: &AgentId) -> Option<AgentSnapshot> {
        self.registry.get(id).await
    }

    pub async fn heartbeat(&self, id: &AgentId) -> Result<()> {
        self.registry.heartbeat(id).await
    }

    /// Record a cpu/memory usage sample reported by an agent.
    pub async fn record_usage_sample(&self, id: &AgentId, cpu: f64, memory: f64) -> Result<()> {
        self.registry.sample_usage(id, cpu, memory).await
    }

    /// Install a lifecycle hook. See [`LifecycleManager`] for ordering.
    pub fn set_transition_hook(&self, from: AgentState, event: AgentEvent, hook: LifecycleHook) {
        self.lifecycle.set_transition_hook(from, event, hook);
    }

    pub fn set_entry_hook(&self, state: AgentState, hook: LifecycleHook) {
        self.lifecycle.set_entry_hook(state, hook);
    }

    pub fn set_exit_hook(&self, state: AgentState, hook: LifecycleHook) {
        self.lifecycle.set_exit_hook(state, hook);
    }

    // ========== WORKFLOWS ==========

    /// Store a validated workflow definition.
    pub async fn define_workflow(&self, workflow: Workflow) -> WorkflowId {
        self.engine.define_workflow(workflow).await
    }

    /// Start executing a defined workflow.
    pub async fn execute(
        &self,
        workflow_id: &WorkflowId,
        initial: HashMap<String, String>,
        callback: Option<CompletionCallback>,
    ) -> Result<ExecutionId> {
        self.ensure_running()?;
        self.engine.execute(workflow_id, initial, callback).await
    }

    /// Request cancellation of an execution. Idempotent.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        self.engine.cancel(execution_id).await
    }

    pub async fn status(&self, execution_id: &ExecutionId) -> Result<ExecutionStatus> {
        self.engine.status(execution_id).await
    }

    /// Final result, or `None` while still running.
    pub async fn results(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionResult>> {
        self.engine.result(execution_id).await
    }

    /// Block until the execution terminates.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<ExecutionResult> {
        self.engine.wait(execution_id).await
    }

    // ========== MESSAGING ==========

    /// Install a handler for a message type on this node.
    pub async fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.bus
            .register_handler(message_type, handler)
            .await
            .map_err(OrchestratorError::from)
    }

    /// Directed request/response to one agent.
    pub async fn send_message(&self, message: &AgentMessage) -> Result<AgentResponse> {
        self.bus.send(message).await.map_err(OrchestratorError::from)
    }

    /// Deliver to every agent of `kind`; per-recipient results.
    pub async fn broadcast_message(
        &self,
        kind: &AgentKind,
        message: &AgentMessage,
    ) -> Vec<BroadcastDelivery> {
        self.bus.broadcast(kind, message).await
    }

    // ========== RESOURCES ==========

    /// Register a bucket outside the configuration file.
    pub async fn register_resource(&self, config: ResourceConfig) -> Result<()> {
        self.resources.register_resource(config).await
    }

    /// Request tokens on behalf of an agent.
    pub async fn allocate_resources(&self, request: ResourceRequest) -> AllocationOutcome {
        self.resources.request(request).await
    }

    /// Release a previous grant. Idempotent; false for unknown ids.
    pub async fn release_resources(&self, allocation_id: &AllocationId) -> bool {
        self.resources.release(allocation_id).await
    }

    pub async fn available_tokens(&self, resource_type: &str) -> u32 {
        self.resources.available(resource_type).await
    }

    pub async fn resource_stats(&self, resource_type: &str) -> Option<BucketStats> {
        self.resources.stats(resource_type).await
    }

    pub async fn set_agent_quota(
        &self,
        agent_id: AgentId,
        resource_type: impl Into<String>,
        max: u32,
    ) {
        self.resources
            .set_agent_quota(agent_id, resource_type, max)
            .await;
    }

    pub async fn agent_allocation(&self, agent_id: &AgentId, resource_type: &str) -> u32 {
        self.resources.agent_allocation(agent_id, resource_type).await
    }

    // ========== REGION SCHEDULING ==========

    /// Partition task points and produce conflict-free parallel batches
    /// (or a serial fallback when no coloring exists).
    pub fn plan_region_batches(
        &self,
        points: Vec<Point>,
        dimensions: usize,
        max_depth: usize,
    ) -> Result<RegionSchedule> {
        plan_region_batches(points, dimensions, max_depth)
    }

    // ========== OBSERVABILITY ==========

    /// Counters across every component, readable up to the last operation.
    pub async fn statistics(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            agents: self.registry.len().await,
            workflows: self.engine.workflow_count().await,
            active_executions: self.engine.active_executions().await,
            engine: self.engine.stats().snapshot(),
            messages_sent: self.bus.messages_sent(),
            delivery_failures: self.bus.delivery_failures(),
            resources: self.resources.all_stats().await,
        }
    }
}
