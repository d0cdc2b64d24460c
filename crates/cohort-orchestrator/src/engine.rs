//! The workflow engine: runs defined workflows as concurrent DAGs over the
//! registered agents.
//!
//! Each execution gets its own driver task. The driver owns every mutation
//! of the execution context; step round-trips run in spawned tasks that
//! report back over a channel, so per-step status changes are serialized
//! per execution without a global lock.
//!
//! Dispatch of a ready step:
//! 1. pick a live agent of the step's kind in lifecycle state Ready or
//!    Running, preferring fewest operations in flight, then earliest
//!    registration;
//! 2. request tokens (default one `compute` token). An unknown resource
//!    fails the step immediately; a denial leaves it Ready for the next
//!    scheduling tick;
//! 3. send the step's action over the bus with the step parameters merged
//!    over the context variables, bounded by the step timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use cohort_bus::{BusError, MessageBus};
use cohort_core::error::{EntityKind, OrchestratorError, Result};
use cohort_core::lifecycle::{AgentState, LifecycleManager};
use cohort_core::protocol::{AgentMessage, AgentResponse};
use cohort_core::registry::AgentRegistry;
use cohort_core::resources::{AllocationOutcome, DenialReason, ResourceManager, ResourceRequest};
use cohort_core::types::{AgentId, AllocationId, ExecutionId, StepId, WorkflowId};
use cohort_core::workflow::{
    ExecutionContext, ExecutionResult, ExecutionStatus, FailureKind, StepStatus, Workflow,
};

/// Message type used to signal cancellation to a running step's agent.
pub const CANCEL_MESSAGE_TYPE: &str = "cancel";

/// Extra lease time on a step's allocation beyond its timeout, so the
/// expiration sweep only reclaims tokens the engine failed to release.
const ALLOCATION_GRACE: Duration = Duration::from_secs(5);

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for steps that do not declare one.
    pub default_step_timeout: Duration,
    /// Resource consulted when a step does not declare one.
    pub default_resource: String,
    /// Scheduling tick used to retry token-starved ready steps.
    pub tick_interval: Duration,
    /// Sender id stamped on dispatched messages.
    pub sender: AgentId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(30),
            default_resource: "compute".to_string(),
            tick_interval: Duration::from_millis(25),
            sender: AgentId::new("orchestrator"),
        }
    }
}

/// Counters kept with atomic updates, no locking.
#[derive(Default)]
pub struct EngineStats {
    pub executions_started: AtomicU64,
    pub executions_succeeded: AtomicU64,
    pub executions_failed: AtomicU64,
    pub executions_cancelled: AtomicU64,
    pub steps_dispatched: AtomicU64,
    pub steps_succeeded: AtomicU64,
    pub steps_failed: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub resource_denials: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub executions_started: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub executions_cancelled: u64,
    pub steps_dispatched: u64,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub dispatch_failures: u64,
    pub resource_denials: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            executions_started: self.executions_started.load(Ordering::Relaxed),
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_cancelled: self.executions_cancelled.load(Ordering::Relaxed),
            steps_dispatched: self.steps_dispatched.load(Ordering::Relaxed),
            steps_succeeded: self.steps_succeeded.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            resource_denials: self.resource_denials.load(Ordering::Relaxed),
        }
    }
}

/// Invoked once when an execution reaches a terminal state.
pub type CompletionCallback = Box<dyn FnOnce(&ExecutionResult) + Send + 'static>;

/// Outcome of one step round-trip, reported to the driver.
enum StepOutcome {
    Response {
        step_id: StepId,
        response: AgentResponse,
    },
    Failed {
        step_id: StepId,
        kind: FailureKind,
        error: String,
    },
}

struct InflightStep {
    agent_id: AgentId,
    correlation_id: String,
    allocation_id: AllocationId,
    task: JoinHandle<()>,
}

struct ExecutionState {
    execution_id: ExecutionId,
    workflow: Arc<Workflow>,
    context: Mutex<ExecutionContext>,
    inflight: Mutex<HashMap<StepId, InflightStep>>,
    cancel_requested: AtomicBool,
    cancel_notify: tokio::sync::Notify,
    done: watch::Sender<bool>,
}

/// Executes workflows against the registry, lifecycle, resource manager
/// and bus it is composed with.
pub struct WorkflowEngine {
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
    executions: RwLock<HashMap<ExecutionId, Arc<ExecutionState>>>,
    results: RwLock<HashMap<ExecutionId, ExecutionResult>>,
    registry: Arc<AgentRegistry>,
    lifecycle: Arc<LifecycleManager>,
    resources: Arc<ResourceManager>,
    bus: Arc<MessageBus>,
    config: EngineConfig,
    stats: Arc<EngineStats>,
    degraded: Arc<AtomicBool>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        lifecycle: Arc<LifecycleManager>,
        resources: Arc<ResourceManager>,
        bus: Arc<MessageBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            registry,
            lifecycle,
            resources,
            bus,
            config,
            stats: Arc::new(EngineStats::default()),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Whether an internal invariant violation has been observed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Store a validated workflow definition.
    pub async fn define_workflow(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id.clone();
        info!(workflow_id = %id, name = %workflow.name, steps = workflow.steps.len(), "workflow defined");
        self.workflows.write().await.insert(id.clone(), Arc::new(workflow));
        id
    }

    pub async fn workflow(&self, id: &WorkflowId) -> Option<Arc<Workflow>> {
        self.workflows.read().await.get(id).cloned()
    }

    pub async fn workflow_count(&self) -> usize {
        self.workflows.read().await.len()
    }

    pub async fn active_executions(&self) -> usize {
        self.executions.read().await.len()
    }

    /// Start an execution. Returns immediately with the execution id;
    /// progress happens on a driver task.
    #[instrument(skip(self, initial, callback), fields(workflow_id = %workflow_id))]
    pub async fn execute(
        self: &Arc<Self>,
        workflow_id: &WorkflowId,
        initial: HashMap<String, String>,
        callback: Option<CompletionCallback>,
    ) -> Result<ExecutionId> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| OrchestratorError::unknown(EntityKind::Workflow, workflow_id.as_str()))?;

        let context = ExecutionContext::new(&workflow, initial);
        let execution_id = context.execution_id.clone();
        let (done, _) = watch::channel(false);
        let state = Arc::new(ExecutionState {
            execution_id: execution_id.clone(),
            workflow,
            context: Mutex::new(context),
            inflight: Mutex::new(HashMap::new()),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: tokio::sync::Notify::new(),
            done,
        });

        self.executions
            .write()
            .await
            .insert(execution_id.clone(), Arc::clone(&state));
        self.stats.executions_started.fetch_add(1, Ordering::Relaxed);
        info!(execution_id = %execution_id, "execution started");

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_execution(state, callback).await;
        });

        Ok(execution_id)
    }

    /// Request cancellation. Idempotent: repeat calls and calls on already
    /// finished executions are no-ops.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        let state = self.executions.read().await.get(execution_id).cloned();
        match state {
            Some(state) => {
                if !state.cancel_requested.swap(true, Ordering::SeqCst) {
                    info!(execution_id = %execution_id, "cancellation requested");
                    state.context.lock().await.cancelled = true;
                }
                state.cancel_notify.notify_one();
                Ok(())
            }
            None if self.results.read().await.contains_key(execution_id) => Ok(()),
            None => Err(OrchestratorError::unknown(
                EntityKind::Execution,
                execution_id.as_str(),
            )),
        }
    }

    /// Cancel every active execution and wait for each to reach a terminal
    /// state.
    pub async fn cancel_all(&self) {
        let states: Vec<Arc<ExecutionState>> =
            self.executions.read().await.values().cloned().collect();
        for state in &states {
            if !state.cancel_requested.swap(true, Ordering::SeqCst) {
                state.context.lock().await.cancelled = true;
            }
            state.cancel_notify.notify_one();
        }
        for state in states {
            let mut done = state.done.subscribe();
            if !*done.borrow() {
                let _ = done.changed().await;
            }
        }
    }

    /// Stop the engine. In-flight executions are expected to have been
    /// cancelled already; any driver still winding down is joined here so
    /// no execution outlives the engine. The engine runs no background
    /// tasks of its own beyond per-execution drivers, so once those are
    /// terminal this returns immediately.
    pub async fn stop(&self) {
        self.cancel_all().await;
        info!("workflow engine stopped");
    }

    /// Overall status of an execution, running or finished.
    pub async fn status(&self, execution_id: &ExecutionId) -> Result<ExecutionStatus> {
        if self.executions.read().await.contains_key(execution_id) {
            return Ok(ExecutionStatus::Running);
        }
        self.results
            .read()
            .await
            .get(execution_id)
            .map(|r| r.status)
            .ok_or_else(|| {
                OrchestratorError::unknown(EntityKind::Execution, execution_id.as_str())
            })
    }

    /// Final result, or `None` while the execution is still running.
    pub async fn result(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionResult>> {
        if let Some(result) = self.results.read().await.get(execution_id) {
            return Ok(Some(result.clone()));
        }
        if self.executions.read().await.contains_key(execution_id) {
            return Ok(None);
        }
        Err(OrchestratorError::unknown(
            EntityKind::Execution,
            execution_id.as_str(),
        ))
    }

    /// Block until the execution terminates and return its result.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<ExecutionResult> {
        let state = self.executions.read().await.get(execution_id).cloned();
        if let Some(state) = state {
            let mut done = state.done.subscribe();
            if !*done.borrow() {
                let _ = done.changed().await;
            }
        }
        self.result(execution_id).await?.ok_or_else(|| {
            OrchestratorError::InternalInvariant(format!(
                "execution {execution_id} signalled done without a result"
            ))
        })
    }

    // ========== DRIVER ==========

    async fn run_execution(
        self: Arc<Self>,
        state: Arc<ExecutionState>,
        callback: Option<CompletionCallback>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StepOutcome>();
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cancel_applied = false;

        loop {
            if state.cancel_requested.load(Ordering::SeqCst) && !cancel_applied {
                self.apply_cancel(&state).await;
                cancel_applied = true;
            }
            if !cancel_applied {
                self.dispatch_ready(&state, &tx).await;
            }
            if state.context.lock().await.is_quiescent() {
                break;
            }

            tokio::select! {
                Some(outcome) = rx.recv() => {
                    self.apply_outcome(&state, outcome).await;
                    while let Ok(outcome) = rx.try_recv() {
                        self.apply_outcome(&state, outcome).await;
                    }
                }
                _ = tick.tick() => {}
                _ = state.cancel_notify.notified() => {}
            }
        }

        let result = {
            let mut context = state.context.lock().await;
            context.finished_at = Some(chrono::Utc::now());
            ExecutionResult::from_context(&context)
        };

        match result.status {
            ExecutionStatus::Succeeded => {
                self.stats.executions_succeeded.fetch_add(1, Ordering::Relaxed)
            }
            ExecutionStatus::Cancelled => {
                self.stats.executions_cancelled.fetch_add(1, Ordering::Relaxed)
            }
            _ => self.stats.executions_failed.fetch_add(1, Ordering::Relaxed),
        };
        info!(
            execution_id = %state.execution_id,
            status = ?result.status,
            "execution finished"
        );

        self.results
            .write()
            .await
            .insert(state.execution_id.clone(), result.clone());
        self.executions.write().await.remove(&state.execution_id);
        // send_replace: the flag must flip even with no subscriber yet.
        state.done.send_replace(true);

        if let Some(callback) = callback {
            callback(&result);
        }
    }

    /// Try to dispatch every ready step once.
    async fn dispatch_ready(
        self: &Arc<Self>,
        state: &Arc<ExecutionState>,
        tx: &mpsc::UnboundedSender<StepOutcome>,
    ) {
        let ready = state.context.lock().await.ready_steps();
        for step_id in ready {
            if let Err(err) = self.dispatch_step(state, &step_id, tx).await {
                if let OrchestratorError::InternalInvariant(_) = err {
                    self.degraded.store(true, Ordering::SeqCst);
                    warn!(step_id = %step_id, error = %err, "invariant violation; execution degraded");
                    let mut context = state.context.lock().await;
                    let _ = context.fail(&step_id, FailureKind::Error, err.to_string());
                }
            }
        }
    }

    /// One dispatch attempt for one ready step.
    async fn dispatch_step(
        self: &Arc<Self>,
        state: &Arc<ExecutionState>,
        step_id: &StepId,
        tx: &mpsc::UnboundedSender<StepOutcome>,
    ) -> Result<()> {
        let Some(step) = state.workflow.step(step_id).cloned() else {
            return Err(OrchestratorError::InternalInvariant(format!(
                "ready step {step_id} missing from workflow"
            )));
        };

        // Agent pick: live, kind match, lifecycle Ready or Running;
        // tie-break by fewest in-flight, then earliest registration.
        let mut candidates = self.registry.candidates(&step.agent_kind).await;
        candidates.retain(|c| {
            matches!(
                self.lifecycle.state(&c.id),
                Ok(AgentState::Ready) | Ok(AgentState::Running)
            )
        });
        candidates.sort_by_key(|c| (c.in_flight, c.sequence));
        let Some(agent) = candidates.first() else {
            self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            debug!(step_id = %step_id, kind = %step.agent_kind, "no dispatchable agent; will retry");
            return Ok(());
        };
        let agent_id = agent.id.clone();

        // Resource admission.
        let step_timeout = step.timeout.unwrap_or(self.config.default_step_timeout);
        let resource_type = step
            .resource_type
            .clone()
            .unwrap_or_else(|| self.config.default_resource.clone());
        let outcome = self
            .resources
            .request(
                ResourceRequest::new(agent_id.clone(), resource_type.clone())
                    .tokens(step.tokens)
                    .timeout(step_timeout + ALLOCATION_GRACE),
            )
            .await;
        let allocation = match outcome {
            AllocationOutcome::Granted(allocation) => allocation,
            AllocationOutcome::Denied(DenialReason::UnknownResource { resource_type }) => {
                warn!(step_id = %step_id, resource_type = %resource_type, "step declares unknown resource");
                let mut context = state.context.lock().await;
                context.fail(
                    step_id,
                    FailureKind::Error,
                    format!("unknown resource: {resource_type}"),
                )?;
                return Ok(());
            }
            AllocationOutcome::Denied(reason) => {
                self.stats.resource_denials.fetch_add(1, Ordering::Relaxed);
                debug!(step_id = %step_id, %reason, "tokens denied; step stays ready");
                return Ok(());
            }
        };

        if let Err(err) = state.context.lock().await.mark_running(step_id) {
            self.resources.release(&allocation.id).await;
            return Err(err);
        }
        self.registry.begin_operation(&agent_id).await;
        self.stats.steps_dispatched.fetch_add(1, Ordering::Relaxed);

        let payload = {
            let context = state.context.lock().await;
            let mut merged = context.variables.clone();
            merged.extend(step.parameters.clone());
            serde_json::to_vec(&merged).unwrap_or_default()
        };
        let message = AgentMessage::new(
            self.config.sender.clone(),
            agent_id.clone(),
            step.action.clone(),
            payload,
        );
        let correlation_id = message.correlation_id.clone();
        debug!(
            step_id = %step_id,
            agent_id = %agent_id,
            action = %step.action,
            correlation_id = %correlation_id,
            "step dispatched"
        );

        let bus = Arc::clone(&self.bus);
        let outcome_tx = tx.clone();
        let task_step_id = step_id.clone();
        let timeout = step_timeout;
        let task = tokio::spawn(async move {
            let outcome = match bus.send_with_timeout(&message, timeout).await {
                Ok(response) => StepOutcome::Response {
                    step_id: task_step_id,
                    response,
                },
                Err(BusError::Timeout(_)) => StepOutcome::Failed {
                    step_id: task_step_id,
                    kind: FailureKind::Timeout,
                    error: format!("step exceeded {timeout:?}"),
                },
                Err(err) => StepOutcome::Failed {
                    step_id: task_step_id,
                    kind: FailureKind::Error,
                    error: OrchestratorError::from(err).to_string(),
                },
            };
            let _ = outcome_tx.send(outcome);
        });

        state.inflight.lock().await.insert(
            step_id.clone(),
            InflightStep {
                agent_id,
                correlation_id,
                allocation_id: allocation.id,
                task,
            },
        );
        Ok(())
    }

    /// Apply one step outcome. Outcomes for steps that already left Running
    /// (cancelled underneath the round-trip) are dropped.
    async fn apply_outcome(&self, state: &Arc<ExecutionState>, outcome: StepOutcome) {
        let (step_id, result) = match outcome {
            StepOutcome::Response { step_id, response } => (step_id, Ok(response)),
            StepOutcome::Failed {
                step_id,
                kind,
                error,
            } => (step_id, Err((kind, error))),
        };

        let Some(inflight) = state.inflight.lock().await.remove(&step_id) else {
            debug!(step_id = %step_id, "outcome for a step no longer in flight; dropped");
            return;
        };
        self.resources.release(&inflight.allocation_id).await;

        let mut context = state.context.lock().await;
        if context.status_of(&step_id) != Some(StepStatus::Running) {
            self.registry.end_operation(&inflight.agent_id, false).await;
            return;
        }

        let applied = match result {
            Ok(response) if response.success => {
                self.registry.end_operation(&inflight.agent_id, true).await;
                self.stats.steps_succeeded.fetch_add(1, Ordering::Relaxed);
                let output = response
                    .data_json()
                    .unwrap_or(serde_json::Value::Null);
                context.complete(&step_id, output).map(|()| {
                    for promoted in context.promote_dependents(&state.workflow, &step_id) {
                        debug!(step_id = %promoted, "step ready");
                    }
                })
            }
            Ok(response) => {
                self.registry.end_operation(&inflight.agent_id, false).await;
                self.stats.steps_failed.fetch_add(1, Ordering::Relaxed);
                let error = response
                    .error
                    .unwrap_or_else(|| "handler reported failure".to_string());
                context.fail(&step_id, FailureKind::Error, error)
            }
            Err((kind, error)) => {
                self.registry.end_operation(&inflight.agent_id, false).await;
                self.stats.steps_failed.fetch_add(1, Ordering::Relaxed);
                context.fail(&step_id, kind, error)
            }
        };

        if let Err(err) = applied {
            self.degraded.store(true, Ordering::SeqCst);
            warn!(step_id = %step_id, error = %err, "invariant violation applying outcome");
        }
    }

    /// Apply a cancellation request: signal running steps over the bus with
    /// the correlation id of their dispatch, fail them as cancelled, and
    /// cancel everything that never started.
    async fn apply_cancel(&self, state: &Arc<ExecutionState>) {
        info!(execution_id = %state.execution_id, "cancelling execution");

        let inflight: Vec<(StepId, InflightStep)> =
            state.inflight.lock().await.drain().collect();
        for (step_id, entry) in inflight {
            let cancel = AgentMessage::new(
                self.config.sender.clone(),
                entry.agent_id.clone(),
                CANCEL_MESSAGE_TYPE,
                Vec::new(),
            )
            .correlated(entry.correlation_id.clone());
            if let Err(err) = self
                .bus
                .send_with_timeout(&cancel, self.config.tick_interval * 4)
                .await
            {
                debug!(step_id = %step_id, error = %err, "cancel signal not delivered");
            }

            entry.task.abort();
            self.resources.release(&entry.allocation_id).await;
            self.registry.end_operation(&entry.agent_id, false).await;

            let mut context = state.context.lock().await;
            if context.status_of(&step_id) == Some(StepStatus::Running) {
                self.stats.steps_failed.fetch_add(1, Ordering::Relaxed);
                let _ = context.fail(&step_id, FailureKind::Cancelled, "execution cancelled");
            }
        }

        let mut context = state.context.lock().await;
        let waiting: Vec<StepId> = context
            .steps
            .iter()
            .filter(|(_, record)| {
                matches!(record.status, StepStatus::Pending | StepStatus::Ready)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for step_id in waiting {
            let _ = context.cancel_step(&step_id);
        }
    }
}
