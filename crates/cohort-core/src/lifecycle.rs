//! Per-agent lifecycle finite-state machine.
//!
//! Each agent walks the seven-state machine below; any (state, event) pair
//! not in the table is rejected without a state change. `Terminated` is
//! absorbing.
//!
//! ```text
//! Uninitialized --Initialize--> Initializing --InitializationComplete--> Ready
//!                               Initializing --InitializationFailed----> Error
//! Ready --Start--> Running --Stop--> Ready
//! Running --Pause--> Paused --Resume--> Running
//!                    Paused --Stop----> Ready
//! Running --ErrorOccurred--> Error --RecoveryComplete--> Ready
//! any (except Terminated) --Terminate--> Terminated
//! ```
//!
//! Hooks fire in a fixed order on a legal event: exit(old), then the
//! transition hook, then the state update, then entry(new). Hooks run inside
//! the per-agent critical section, so a hook that triggers another event on
//! the same agent is rejected rather than deadlocked.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::ThreadId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EntityKind, OrchestratorError, Result};
use crate::types::AgentId;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Paused,
    Error,
    Terminated,
}

impl AgentState {
    /// `Terminated` is absorbing: no event leaves it.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Terminated)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Error => "error",
            AgentState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Event driving a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Initialize,
    InitializationComplete,
    InitializationFailed,
    Start,
    Stop,
    Pause,
    Resume,
    ErrorOccurred,
    RecoveryComplete,
    Terminate,
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentEvent::Initialize => "initialize",
            AgentEvent::InitializationComplete => "initialization_complete",
            AgentEvent::InitializationFailed => "initialization_failed",
            AgentEvent::Start => "start",
            AgentEvent::Stop => "stop",
            AgentEvent::Pause => "pause",
            AgentEvent::Resume => "resume",
            AgentEvent::ErrorOccurred => "error_occurred",
            AgentEvent::RecoveryComplete => "recovery_complete",
            AgentEvent::Terminate => "terminate",
        };
        write!(f, "{s}")
    }
}

/// The allowed transition table. Pairs absent from this table are illegal.
fn transition_target(state: AgentState, event: AgentEvent) -> Option<AgentState> {
    use AgentEvent as E;
    use AgentState as S;

    match (state, event) {
        (S::Uninitialized, E::Initialize) => Some(S::Initializing),
        (S::Initializing, E::InitializationComplete) => Some(S::Ready),
        (S::Initializing, E::InitializationFailed) => Some(S::Error),
        (S::Ready, E::Start) => Some(S::Running),
        (S::Running, E::Stop) => Some(S::Ready),
        (S::Running, E::Pause) => Some(S::Paused),
        (S::Paused, E::Resume) => Some(S::Running),
        (S::Paused, E::Stop) => Some(S::Ready),
        (S::Running, E::ErrorOccurred) => Some(S::Error),
        (S::Error, E::RecoveryComplete) => Some(S::Ready),
        (s, E::Terminate) if !s.is_terminal() => Some(S::Terminated),
        _ => None,
    }
}

/// One entry in an agent's append-only transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub to: AgentState,
    pub event: AgentEvent,
    pub at: DateTime<Utc>,
    pub data: Option<String>,
}

/// Context handed to hooks during a transition.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub agent_id: AgentId,
    pub from: AgentState,
    pub to: AgentState,
    pub event: AgentEvent,
    pub data: Option<String>,
}

/// Hook invoked on a specific transition or on state entry/exit.
pub type LifecycleHook = Arc<dyn Fn(&HookContext) + Send + Sync>;

struct AgentCell {
    /// Thread currently running a transition, for re-entrance detection.
    owner: Mutex<Option<ThreadId>>,
    inner: Mutex<CellInner>,
}

struct CellInner {
    state: AgentState,
    previous: AgentState,
    history: Vec<TransitionRecord>,
}

/// Tracks lifecycle state for every agent and fires registered hooks.
pub struct LifecycleManager {
    agents: RwLock<HashMap<AgentId, Arc<AgentCell>>>,
    transition_hooks: RwLock<HashMap<(AgentState, AgentEvent), LifecycleHook>>,
    entry_hooks: RwLock<HashMap<AgentState, LifecycleHook>>,
    exit_hooks: RwLock<HashMap<AgentState, LifecycleHook>>,
    degraded: AtomicBool,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            transition_hooks: RwLock::new(HashMap::new()),
            entry_hooks: RwLock::new(HashMap::new()),
            exit_hooks: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Track a new agent, starting in `Uninitialized`.
    pub fn create(&self, id: AgentId) -> Result<()> {
        let mut agents = self.agents.write().expect("lock poisoned");
        if agents.contains_key(&id) {
            self.degraded.store(true, Ordering::SeqCst);
            return Err(OrchestratorError::InternalInvariant(format!(
                "lifecycle cell for {id} already exists"
            )));
        }
        agents.insert(
            id,
            Arc::new(AgentCell {
                owner: Mutex::new(None),
                inner: Mutex::new(CellInner {
                    state: AgentState::Uninitialized,
                    previous: AgentState::Uninitialized,
                    history: Vec::new(),
                }),
            }),
        );
        Ok(())
    }

    /// Stop tracking an agent. Returns false if it was not tracked.
    pub fn remove(&self, id: &AgentId) -> bool {
        self.agents
            .write()
            .expect("lock poisoned")
            .remove(id)
            .is_some()
    }

    fn cell(&self, id: &AgentId) -> Result<Arc<AgentCell>> {
        self.agents
            .read()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::unknown(EntityKind::Agent, id.as_str()))
    }

    /// Drive `event` through the FSM for `id`.
    ///
    /// On a legal transition the hooks fire as exit(old), transition, entry(new)
    /// and the new state is returned. Illegal pairs are rejected without any
    /// hook running. A hook that triggers another event on the same agent gets
    /// an [`OrchestratorError::IllegalTransition`] back.
    pub fn trigger(&self, id: &AgentId, event: AgentEvent, data: Option<String>) -> Result<AgentState> {
        let cell = self.cell(id)?;

        let me = std::thread::current().id();
        {
            let owner = cell.owner.lock().expect("lock poisoned");
            if *owner == Some(me) {
                let state = cell.inner.lock().expect("lock poisoned").state;
                debug!(agent_id = %id, %event, "re-entrant lifecycle event rejected");
                return Err(OrchestratorError::IllegalTransition { state, event });
            }
        }

        let mut inner = cell.inner.lock().expect("lock poisoned");
        *cell.owner.lock().expect("lock poisoned") = Some(me);
        let result = self.run_transition(id, &mut inner, event, data);
        *cell.owner.lock().expect("lock poisoned") = None;
        result
    }

    fn run_transition(
        &self,
        id: &AgentId,
        inner: &mut CellInner,
        event: AgentEvent,
        data: Option<String>,
    ) -> Result<AgentState> {
        let from = inner.state;
        let Some(to) = transition_target(from, event) else {
            debug!(agent_id = %id, state = %from, %event, "transition rejected");
            return Err(OrchestratorError::IllegalTransition { state: from, event });
        };

        let ctx = HookContext {
            agent_id: id.clone(),
            from,
            to,
            event,
            data: data.clone(),
        };

        if let Some(hook) = self
            .exit_hooks
            .read()
            .expect("lock poisoned")
            .get(&from)
            .cloned()
        {
            hook(&ctx);
        }
        if let Some(hook) = self
            .transition_hooks
            .read()
            .expect("lock poisoned")
            .get(&(from, event))
            .cloned()
        {
            hook(&ctx);
        }

        inner.previous = from;
        inner.state = to;
        inner.history.push(TransitionRecord {
            from,
            to,
            event,
            at: Utc::now(),
            data,
        });

        if let Some(hook) = self
            .entry_hooks
            .read()
            .expect("lock poisoned")
            .get(&to)
            .cloned()
        {
            hook(&ctx);
        }

        debug!(agent_id = %id, from = %from, to = %to, %event, "lifecycle transition");
        Ok(to)
    }

    /// Current state of an agent.
    pub fn state(&self, id: &AgentId) -> Result<AgentState> {
        Ok(self.cell(id)?.inner.lock().expect("lock poisoned").state)
    }

    /// State the agent was in before its last transition.
    pub fn previous_state(&self, id: &AgentId) -> Result<AgentState> {
        Ok(self
            .cell(id)?
            .inner
            .lock()
            .expect("lock poisoned")
            .previous)
    }

    /// Snapshot of the append-only transition history.
    pub fn history(&self, id: &AgentId) -> Result<Vec<TransitionRecord>> {
        Ok(self
            .cell(id)?
            .inner
            .lock()
            .expect("lock poisoned")
            .history
            .clone())
    }

    /// Ids of every tracked agent.
    pub fn all_agent_ids(&self) -> Vec<AgentId> {
        self.agents
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Ids of agents currently in `state`.
    pub fn agents_in_state(&self, state: AgentState) -> Vec<AgentId> {
        self.agents
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|(_, cell)| {
                cell.inner.lock().expect("lock poisoned").state == state
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Install a hook for a specific (from, event) transition.
    pub fn set_transition_hook(&self, from: AgentState, event: AgentEvent, hook: LifecycleHook) {
        self.transition_hooks
            .write()
            .expect("lock poisoned")
            .insert((from, event), hook);
    }

    /// Install a hook fired when any agent enters `state`.
    pub fn set_entry_hook(&self, state: AgentState, hook: LifecycleHook) {
        self.entry_hooks
            .write()
            .expect("lock poisoned")
            .insert(state, hook);
    }

    /// Install a hook fired when any agent leaves `state`.
    pub fn set_exit_hook(&self, state: AgentState, hook: LifecycleHook) {
        self.exit_hooks
            .write()
            .expect("lock poisoned")
            .insert(state, hook);
    }

    /// Whether an invariant violation was observed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn manager_with_agent(id: &str) -> (LifecycleManager, AgentId) {
        let manager = LifecycleManager::new();
        let agent = AgentId::new(id);
        manager.create(agent.clone()).unwrap();
        (manager, agent)
    }

    fn drive_to_ready(manager: &LifecycleManager, id: &AgentId) {
        manager.trigger(id, AgentEvent::Initialize, None).unwrap();
        manager
            .trigger(id, AgentEvent::InitializationComplete, None)
            .unwrap();
    }

    #[test]
    fn test_full_walk_through_table() {
        let (manager, id) = manager_with_agent("a1");
        drive_to_ready(&manager, &id);
        assert_eq!(manager.state(&id).unwrap(), AgentState::Ready);

        manager.trigger(&id, AgentEvent::Start, None).unwrap();
        manager.trigger(&id, AgentEvent::Pause, None).unwrap();
        manager.trigger(&id, AgentEvent::Resume, None).unwrap();
        manager.trigger(&id, AgentEvent::Stop, None).unwrap();
        assert_eq!(manager.state(&id).unwrap(), AgentState::Ready);
        assert_eq!(manager.previous_state(&id).unwrap(), AgentState::Running);
    }

    #[test]
    fn test_illegal_pair_rejected_without_change() {
        let (manager, id) = manager_with_agent("a1");
        drive_to_ready(&manager, &id);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        manager.set_exit_hook(
            AgentState::Ready,
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Ready does not accept Pause.
        let err = manager.trigger(&id, AgentEvent::Pause, None).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::IllegalTransition {
                state: AgentState::Ready,
                event: AgentEvent::Pause
            }
        ));
        assert_eq!(manager.state(&id).unwrap(), AgentState::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no hooks on rejection");
    }

    #[test]
    fn test_terminated_is_absorbing() {
        let (manager, id) = manager_with_agent("a1");
        manager.trigger(&id, AgentEvent::Terminate, None).unwrap();
        assert_eq!(manager.state(&id).unwrap(), AgentState::Terminated);

        for event in [
            AgentEvent::Initialize,
            AgentEvent::Start,
            AgentEvent::Terminate,
        ] {
            assert!(manager.trigger(&id, event, None).is_err());
        }
        assert_eq!(manager.state(&id).unwrap(), AgentState::Terminated);
    }

    #[test]
    fn test_terminate_from_every_live_state() {
        for (events, expected_origin) in [
            (vec![], AgentState::Uninitialized),
            (vec![AgentEvent::Initialize], AgentState::Initializing),
            (
                vec![AgentEvent::Initialize, AgentEvent::InitializationFailed],
                AgentState::Error,
            ),
        ] {
            let (manager, id) = manager_with_agent("a1");
            for event in events {
                manager.trigger(&id, event, None).unwrap();
            }
            assert_eq!(manager.state(&id).unwrap(), expected_origin);
            manager.trigger(&id, AgentEvent::Terminate, None).unwrap();
            assert_eq!(manager.state(&id).unwrap(), AgentState::Terminated);
        }
    }

    #[test]
    fn test_hook_ordering_exit_transition_entry() {
        let (manager, id) = manager_with_agent("a1");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        manager.set_exit_hook(
            AgentState::Uninitialized,
            Arc::new(move |_| o.lock().unwrap().push("exit")),
        );
        let o = order.clone();
        manager.set_transition_hook(
            AgentState::Uninitialized,
            AgentEvent::Initialize,
            Arc::new(move |ctx| {
                assert_eq!(ctx.data.as_deref(), Some("boot"));
                o.lock().unwrap().push("transition");
            }),
        );
        let o = order.clone();
        manager.set_entry_hook(
            AgentState::Initializing,
            Arc::new(move |_| o.lock().unwrap().push("entry")),
        );

        manager
            .trigger(&id, AgentEvent::Initialize, Some("boot".into()))
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["exit", "transition", "entry"]);
    }

    #[test]
    fn test_reentrant_event_from_hook_rejected() {
        let manager = Arc::new(LifecycleManager::new());
        let id = AgentId::new("a1");
        manager.create(id.clone()).unwrap();

        let inner = manager.clone();
        let target = id.clone();
        let observed = Arc::new(Mutex::new(None));
        let slot = observed.clone();
        manager.set_entry_hook(
            AgentState::Initializing,
            Arc::new(move |_| {
                let result = inner.trigger(&target, AgentEvent::InitializationComplete, None);
                *slot.lock().unwrap() = Some(result.is_err());
            }),
        );

        manager.trigger(&id, AgentEvent::Initialize, None).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(true));
        // The outer transition still landed.
        assert_eq!(manager.state(&id).unwrap(), AgentState::Initializing);
    }

    #[test]
    fn test_history_is_a_valid_walk() {
        let (manager, id) = manager_with_agent("a1");
        drive_to_ready(&manager, &id);
        manager.trigger(&id, AgentEvent::Start, None).unwrap();
        manager.trigger(&id, AgentEvent::ErrorOccurred, None).unwrap();
        manager.trigger(&id, AgentEvent::RecoveryComplete, None).unwrap();

        let history = manager.history(&id).unwrap();
        assert_eq!(history.len(), 5);
        for record in &history {
            assert_eq!(transition_target(record.from, record.event), Some(record.to));
        }
        for pair in history.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
    }

    #[test]
    fn test_unknown_agent() {
        let manager = LifecycleManager::new();
        let err = manager
            .trigger(&AgentId::new("ghost"), AgentEvent::Initialize, None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownEntity { .. }));
    }

    #[test]
    fn test_agents_in_state() {
        let manager = LifecycleManager::new();
        for name in ["a1", "a2", "a3"] {
            manager.create(AgentId::new(name)).unwrap();
        }
        manager
            .trigger(&AgentId::new("a3"), AgentEvent::Initialize, None)
            .unwrap();

        assert_eq!(manager.agents_in_state(AgentState::Uninitialized).len(), 2);
        assert_eq!(manager.agents_in_state(AgentState::Initializing).len(), 1);
        assert_eq!(manager.all_agent_ids().len(), 3);
    }
}
