//! The resource manager: buckets, quotas, allocations and the background
//! refill/expiration loops.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::types::{AgentId, AllocationId};

use super::bucket::{BucketStats, ResourceConfig, TokenBucket};

/// How often the background task refills every bucket.
const REFILL_TICK: Duration = Duration::from_millis(100);

/// Default sweep interval for expired allocations.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A request for tokens from one bucket.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub agent_id: AgentId,
    pub resource_type: String,
    pub tokens: u32,
    /// Advisory only; the bucket serves requests in arrival order.
    pub priority: i32,
    /// Lease duration: the allocation expires this long after the grant.
    pub timeout: Duration,
}

impl ResourceRequest {
    pub fn new(agent_id: impl Into<AgentId>, resource_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            resource_type: resource_type.into(),
            tokens: 1,
            priority: 0,
            timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A live grant of tokens to an agent.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: AllocationId,
    pub agent_id: AgentId,
    pub resource_type: String,
    pub tokens: u32,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    deadline: Instant,
}

impl Allocation {
    fn new(request: &ResourceRequest) -> Self {
        let now = Utc::now();
        Self {
            id: AllocationId::generate(),
            agent_id: request.agent_id.clone(),
            resource_type: request.resource_type.clone(),
            tokens: request.tokens,
            granted_at: now,
            expires_at: now
                + chrono::Duration::from_std(request.timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            deadline: Instant::now() + request.timeout,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    UnknownResource {
        resource_type: String,
    },
    QuotaExceeded {
        quota: u32,
        held: u32,
        requested: u32,
    },
    InsufficientTokens {
        requested: u32,
        available: u32,
    },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::UnknownResource { resource_type } => {
                write!(f, "resource type not found: {resource_type}")
            }
            DenialReason::QuotaExceeded {
                quota,
                held,
                requested,
            } => write!(
                f,
                "agent quota exceeded: quota {quota}, holding {held}, requested {requested}"
            ),
            DenialReason::InsufficientTokens {
                requested,
                available,
            } => write!(
                f,
                "insufficient tokens: requested {requested}, available {available}"
            ),
        }
    }
}

/// Result of a resource request. Denial is a value, not an error.
#[derive(Debug, Clone)]
pub enum AllocationOutcome {
    Granted(Allocation),
    Denied(DenialReason),
}

impl AllocationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AllocationOutcome::Granted(_))
    }

    pub fn granted(self) -> Option<Allocation> {
        match self {
            AllocationOutcome::Granted(allocation) => Some(allocation),
            AllocationOutcome::Denied(_) => None,
        }
    }
}

/// Allocation table plus per-agent holdings, guarded by a single lock that
/// is only ever taken after a bucket lock.
#[derive(Default)]
struct Ledger {
    allocations: HashMap<AllocationId, Allocation>,
    held: HashMap<AgentId, HashMap<String, u32>>,
}

impl Ledger {
    fn held_by(&self, agent_id: &AgentId, resource_type: &str) -> u32 {
        self.held
            .get(agent_id)
            .and_then(|per_resource| per_resource.get(resource_type))
            .copied()
            .unwrap_or(0)
    }

    fn insert(&mut self, allocation: Allocation) {
        *self
            .held
            .entry(allocation.agent_id.clone())
            .or_default()
            .entry(allocation.resource_type.clone())
            .or_default() += allocation.tokens;
        self.allocations.insert(allocation.id.clone(), allocation);
    }

    fn remove(&mut self, id: &AllocationId) -> Option<Allocation> {
        let allocation = self.allocations.remove(id)?;
        if let Some(per_resource) = self.held.get_mut(&allocation.agent_id) {
            if let Some(count) = per_resource.get_mut(&allocation.resource_type) {
                *count = count.saturating_sub(allocation.tokens);
                if *count == 0 {
                    per_resource.remove(&allocation.resource_type);
                }
            }
            if per_resource.is_empty() {
                self.held.remove(&allocation.agent_id);
            }
        }
        Some(allocation)
    }
}

/// The single authority on resource availability.
pub struct ResourceManager {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    ledger: Mutex<Ledger>,
    quotas: RwLock<HashMap<AgentId, HashMap<String, u32>>>,
    sweep_interval: Duration,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            buckets: RwLock::new(HashMap::new()),
            ledger: Mutex::new(Ledger::default()),
            quotas: RwLock::new(HashMap::new()),
            sweep_interval,
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Create a bucket. Fails if the resource type already exists.
    pub async fn register_resource(&self, config: ResourceConfig) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(&config.resource_type) {
            return Err(OrchestratorError::InvalidDefinition(format!(
                "resource type already registered: {}",
                config.resource_type
            )));
        }
        info!(
            resource_type = %config.resource_type,
            max_tokens = config.max_tokens,
            refill_rate = config.refill_rate,
            "resource registered"
        );
        buckets.insert(
            config.resource_type.clone(),
            Arc::new(Mutex::new(TokenBucket::new(config))),
        );
        Ok(())
    }

    /// Replace all buckets with `configs`. Outstanding allocations are
    /// forgotten, so this is for startup only.
    pub async fn initialize(&self, configs: Vec<ResourceConfig>) -> Result<()> {
        {
            let mut buckets = self.buckets.write().await;
            buckets.clear();
        }
        *self.ledger.lock().await = Ledger::default();
        for config in configs {
            self.register_resource(config).await?;
        }
        Ok(())
    }

    /// Request tokens. Never blocks waiting for tokens: the outcome is
    /// either a grant or a denial the caller may retry later.
    pub async fn request(&self, request: ResourceRequest) -> AllocationOutcome {
        let Some(bucket) = self.bucket(&request.resource_type).await else {
            return AllocationOutcome::Denied(DenialReason::UnknownResource {
                resource_type: request.resource_type.clone(),
            });
        };

        let quota = self
            .quotas
            .read()
            .await
            .get(&request.agent_id)
            .and_then(|per_resource| per_resource.get(&request.resource_type))
            .copied();

        // Bucket lock first, ledger second. Nothing below awaits a callback.
        let mut bucket = bucket.lock().await;
        let now = Instant::now();

        let mut ledger = self.ledger.lock().await;
        if let Some(quota) = quota {
            let held = ledger.held_by(&request.agent_id, &request.resource_type);
            if held + request.tokens > quota {
                bucket.count_denied_request();
                debug!(
                    agent_id = %request.agent_id,
                    resource_type = %request.resource_type,
                    quota, held, requested = request.tokens,
                    "request denied by quota"
                );
                return AllocationOutcome::Denied(DenialReason::QuotaExceeded {
                    quota,
                    held,
                    requested: request.tokens,
                });
            }
        }

        if !bucket.try_take(request.tokens, now) {
            return AllocationOutcome::Denied(DenialReason::InsufficientTokens {
                requested: request.tokens,
                available: bucket.current(),
            });
        }

        let allocation = Allocation::new(&request);
        ledger.insert(allocation.clone());
        debug!(
            allocation_id = %allocation.id,
            agent_id = %request.agent_id,
            resource_type = %request.resource_type,
            tokens = request.tokens,
            "tokens granted"
        );
        AllocationOutcome::Granted(allocation)
    }

    /// Release an allocation, returning its tokens to the bucket.
    ///
    /// Idempotent: unknown (or already released) ids return false.
    pub async fn release(&self, id: &AllocationId) -> bool {
        // Peek at the resource type so the bucket lock can be taken first.
        let resource_type = {
            let ledger = self.ledger.lock().await;
            match ledger.allocations.get(id) {
                Some(allocation) => allocation.resource_type.clone(),
                None => return false,
            }
        };

        let bucket = self.bucket(&resource_type).await;
        match bucket {
            Some(bucket) => {
                let mut bucket = bucket.lock().await;
                let mut ledger = self.ledger.lock().await;
                // A racing release may have beaten us here.
                let Some(allocation) = ledger.remove(id) else {
                    return false;
                };
                bucket.give_back(allocation.tokens);
                debug!(allocation_id = %id, tokens = allocation.tokens, "allocation released");
                true
            }
            None => {
                // Bucket vanished under an initialize(); just drop the record.
                self.ledger.lock().await.remove(id).is_some()
            }
        }
    }

    /// Current token count for a resource type (0 for unknown types).
    pub async fn available(&self, resource_type: &str) -> u32 {
        match self.bucket(resource_type).await {
            Some(bucket) => {
                let mut bucket = bucket.lock().await;
                bucket.refill(Instant::now());
                bucket.current()
            }
            None => 0,
        }
    }

    /// Usage statistics for a resource type.
    pub async fn stats(&self, resource_type: &str) -> Option<BucketStats> {
        let bucket = self.bucket(resource_type).await?;
        let mut bucket = bucket.lock().await;
        bucket.refill(Instant::now());
        Some(bucket.stats())
    }

    /// Statistics for every bucket.
    pub async fn all_stats(&self) -> HashMap<String, BucketStats> {
        let buckets: Vec<(String, Arc<Mutex<TokenBucket>>)> = {
            let map = self.buckets.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut stats = HashMap::new();
        for (resource_type, bucket) in buckets {
            let mut bucket = bucket.lock().await;
            bucket.refill(Instant::now());
            stats.insert(resource_type, bucket.stats());
        }
        stats
    }

    /// Cap the tokens `agent_id` may hold of `resource_type` at once.
    pub async fn set_agent_quota(&self, agent_id: AgentId, resource_type: impl Into<String>, max: u32) {
        self.quotas
            .write()
            .await
            .entry(agent_id)
            .or_default()
            .insert(resource_type.into(), max);
    }

    /// Tokens currently held by an agent for a resource type.
    pub async fn agent_allocation(&self, agent_id: &AgentId, resource_type: &str) -> u32 {
        self.ledger.lock().await.held_by(agent_id, resource_type)
    }

    /// Sum of outstanding allocations against a resource type.
    pub async fn outstanding(&self, resource_type: &str) -> u32 {
        self.ledger
            .lock()
            .await
            .allocations
            .values()
            .filter(|a| a.resource_type == resource_type)
            .map(|a| a.tokens)
            .sum()
    }

    /// Release every allocation whose lease has expired. Returns the ids
    /// that were swept.
    pub async fn sweep_expired(&self) -> Vec<AllocationId> {
        let now = Instant::now();
        let expired: Vec<AllocationId> = {
            let ledger = self.ledger.lock().await;
            ledger
                .allocations
                .values()
                .filter(|a| a.is_expired(now))
                .map(|a| a.id.clone())
                .collect()
        };

        let mut swept = Vec::new();
        for id in expired {
            if self.release(&id).await {
                warn!(allocation_id = %id, "expired allocation swept");
                swept.push(id);
            }
        }
        swept
    }

    /// Start the background refill and expiration loops.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(false);

        let mut tasks = self.tasks.lock().await;

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(REFILL_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let buckets: Vec<Arc<Mutex<TokenBucket>>> = {
                            let map = manager.buckets.read().await;
                            map.values().cloned().collect()
                        };
                        let now = Instant::now();
                        for bucket in buckets {
                            bucket.lock().await.refill(now);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let sweep_interval = self.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        manager.sweep_expired().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        info!("resource manager started");
    }

    /// Stop the background loops. Counters stay readable afterwards.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("resource manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn bucket(&self, resource_type: &str) -> Option<Arc<Mutex<TokenBucket>>> {
        self.buckets.read().await.get(resource_type).cloned()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
