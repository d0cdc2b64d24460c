//! Identifiers and shared value types.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a registered agent.
    AgentId,
    "agent"
);
id_type!(
    /// Unique identifier for a workflow definition.
    WorkflowId,
    "wf"
);
id_type!(
    /// Unique identifier for one running instance of a workflow.
    ExecutionId,
    "exec"
);
id_type!(
    /// Identifier for a step within a workflow.
    StepId,
    "step"
);
id_type!(
    /// Identifier for a resource grant.
    AllocationId,
    "alloc"
);

/// Worker role tag used to match steps to agents.
///
/// The conventional roles are `parser`, `decomposer`, `pattern-matcher` and
/// `simulator`; matching is by exact tag so deployments can carve finer
/// roles (`parse`, `build`, ...) without touching the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentKind(String);

impl AgentKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Transport address of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEndpoint {
    /// Agent lives in this process; delivery goes straight to the local
    /// handler registry.
    Local,
    /// Agent is reachable over the authenticated transport at this URI.
    Remote(String),
}

/// Everything the orchestrator needs to know about an agent at
/// registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    /// Opaque capability tags advertised by the agent.
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    pub endpoint: AgentEndpoint,
    /// Expected interval between heartbeats.
    #[serde(with = "duration_ms", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

impl AgentDescriptor {
    /// Create a descriptor with a generated id and a local endpoint.
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            id: AgentId::generate(),
            name: name.into(),
            kind,
            capabilities: HashMap::new(),
            endpoint: AgentEndpoint::Local,
            heartbeat_interval: default_heartbeat_interval(),
        }
    }

    /// Use a fixed id instead of a generated one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = id.into();
        self
    }

    /// Advertise a capability.
    #[must_use]
    pub fn capability(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(name.into(), value.into());
        self
    }

    /// Set the transport endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: AgentEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Runtime metrics tracked per agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub operations_completed: u64,
    pub operations_failed: u64,
    /// Most recent CPU usage sample (0.0-1.0).
    pub cpu_usage: f64,
    /// Most recent memory usage sample in bytes.
    pub memory_usage: f64,
}

/// Serde helper: durations as integral milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serde helper: optional durations as integral milliseconds.
pub(crate) mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}
