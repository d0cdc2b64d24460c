//! Agent registry: who is registered, what they can do, and whether they
//! are still alive.
//!
//! The registry is read-heavy; mutation takes the write lock, everything
//! else reads. Liveness is heartbeat-based: an agent is live while
//! `now - last_heartbeat <= 2 x heartbeat_interval`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{EntityKind, OrchestratorError, Result};
use crate::types::{AgentDescriptor, AgentId, AgentKind, AgentMetrics};

const LIVENESS_GRACE: u32 = 2;

struct AgentRecord {
    descriptor: AgentDescriptor,
    registered_at: DateTime<Utc>,
    /// Monotonic registration order, used as a dispatch tie-break.
    sequence: u64,
    last_heartbeat: Instant,
    metrics: AgentMetrics,
    /// Operations currently dispatched to this agent.
    in_flight: u64,
}

impl AgentRecord {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat)
            <= self.descriptor.heartbeat_interval * LIVENESS_GRACE
    }
}

/// Read view of a registered agent.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub descriptor: AgentDescriptor,
    pub registered_at: DateTime<Utc>,
    pub sequence: u64,
    pub live: bool,
    pub metrics: AgentMetrics,
    pub in_flight: u64,
}

/// Candidate for step dispatch, pre-sorted inputs for the engine tie-break.
#[derive(Debug, Clone)]
pub struct DispatchCandidate {
    pub id: AgentId,
    pub in_flight: u64,
    pub sequence: u64,
}

/// Tracks every registered agent.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    default_heartbeat_interval: Duration,
    next_sequence: std::sync::atomic::AtomicU64,
}

impl AgentRegistry {
    pub fn new(default_heartbeat_interval: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            default_heartbeat_interval,
            next_sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Register an agent.
    ///
    /// Fails without altering the existing record if the id is already
    /// taken. A zero heartbeat interval falls back to the registry default.
    pub async fn register(&self, mut descriptor: AgentDescriptor) -> Result<()> {
        if descriptor.heartbeat_interval.is_zero() {
            descriptor.heartbeat_interval = self.default_heartbeat_interval;
        }

        let mut agents = self.agents.write().await;
        if agents.contains_key(&descriptor.id) {
            return Err(OrchestratorError::InvalidDefinition(format!(
                "agent id already registered: {}",
                descriptor.id
            )));
        }

        let sequence = self
            .next_sequence
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        info!(agent_id = %descriptor.id, name = %descriptor.name, kind = %descriptor.kind, "agent registered");
        agents.insert(
            descriptor.id.clone(),
            AgentRecord {
                descriptor,
                registered_at: Utc::now(),
                sequence,
                last_heartbeat: Instant::now(),
                metrics: AgentMetrics::default(),
                in_flight: 0,
            },
        );
        Ok(())
    }

    /// Remove an agent, returning its descriptor.
    pub async fn unregister(&self, id: &AgentId) -> Result<AgentDescriptor> {
        let record = self
            .agents
            .write()
            .await
            .remove(id)
            .ok_or_else(|| OrchestratorError::unknown(EntityKind::Agent, id.as_str()))?;
        info!(agent_id = %id, "agent unregistered");
        Ok(record.descriptor)
    }

    /// Record a heartbeat from an agent.
    pub async fn heartbeat(&self, id: &AgentId) -> Result<()> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::unknown(EntityKind::Agent, id.as_str()))?;
        record.last_heartbeat = Instant::now();
        Ok(())
    }

    pub async fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Snapshot of one agent.
    pub async fn get(&self, id: &AgentId) -> Option<AgentSnapshot> {
        let now = Instant::now();
        self.agents.read().await.get(id).map(|record| AgentSnapshot {
            descriptor: record.descriptor.clone(),
            registered_at: record.registered_at,
            sequence: record.sequence,
            live: record.is_live(now),
            metrics: record.metrics.clone(),
            in_flight: record.in_flight,
        })
    }

    pub async fn all_ids(&self) -> Vec<AgentId> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// Live agents of `kind`, with the fields the engine tie-breaks on.
    pub async fn candidates(&self, kind: &AgentKind) -> Vec<DispatchCandidate> {
        let now = Instant::now();
        self.agents
            .read()
            .await
            .values()
            .filter(|r| r.descriptor.kind == *kind && r.is_live(now))
            .map(|r| DispatchCandidate {
                id: r.descriptor.id.clone(),
                in_flight: r.in_flight,
                sequence: r.sequence,
            })
            .collect()
    }

    /// Ids of live agents of `kind` (broadcast audience).
    pub async fn agents_of_kind(&self, kind: &AgentKind) -> Vec<AgentId> {
        let now = Instant::now();
        self.agents
            .read()
            .await
            .values()
            .filter(|r| r.descriptor.kind == *kind && r.is_live(now))
            .map(|r| r.descriptor.id.clone())
            .collect()
    }

    /// Mark one more operation in flight on `id`.
    pub async fn begin_operation(&self, id: &AgentId) {
        if let Some(record) = self.agents.write().await.get_mut(id) {
            record.in_flight += 1;
        }
    }

    /// Mark an operation finished, updating the agent's counters.
    pub async fn end_operation(&self, id: &AgentId, success: bool) {
        if let Some(record) = self.agents.write().await.get_mut(id) {
            record.in_flight = record.in_flight.saturating_sub(1);
            if success {
                record.metrics.operations_completed += 1;
            } else {
                record.metrics.operations_failed += 1;
            }
        } else {
            debug!(agent_id = %id, "operation finished for unregistered agent");
        }
    }

    /// Record a cpu/memory usage sample reported by the agent.
    pub async fn sample_usage(&self, id: &AgentId, cpu: f64, memory: f64) -> Result<()> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::unknown(EntityKind::Agent, id.as_str()))?;
        record.metrics.cpu_usage = cpu;
        record.metrics.memory_usage = memory;
        Ok(())
    }
}
