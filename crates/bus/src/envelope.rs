//! Dispatch envelopes exchanged between the table and its agents.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Default wait before a dispatch is abandoned
pub const DEFAULT_TIMEOUT_S: u64 = 30;

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TIMEOUT_S)
}

/// Durations cross the wire as fractional seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            ));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// A request for one agent to perform one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Correlation id
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Target agent
    pub agent_id: String,
    /// Requested action
    pub action: String,
    /// Action payload
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Upper bound on the caller's wait
    #[serde(
        rename = "timeout_seconds",
        with = "duration_secs",
        default = "default_timeout"
    )]
    pub timeout: Duration,
}

impl DispatchRequest {
    /// Create a new request with the default timeout
    pub fn new(agent_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            action: action.into(),
            data: HashMap::new(),
            timeout: default_timeout(),
        }
    }

    /// Attach a payload field
    pub fn with_data(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.into(), value);
        }
        self
    }

    /// Bound the wait
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Operation label used by the monitor
    pub fn operation(&self) -> String {
        format!("{}:{}", self.agent_id, self.action)
    }
}

/// What the caller gets back, one per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub success: bool,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when produced by the recovery path rather than the agent
    #[serde(default)]
    pub degraded: bool,
    #[serde(rename = "elapsed_seconds", with = "duration_secs", default)]
    pub elapsed: Duration,
}

impl DispatchResponse {
    /// A successful response from the primary path
    pub fn ok(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            degraded: false,
            elapsed: Duration::ZERO,
        }
    }

    /// A usable result produced by recovery, flagged as degraded
    pub fn recovered(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            degraded: true,
            ..Self::ok(data)
        }
    }

    /// A structured failure
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: HashMap::new(),
            error: Some(error.into()),
            degraded: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Stamp the measured latency
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// System-wide notification, fire-and-forget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    /// Topic agents subscribe to
    pub topic: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Local>,
}

impl Broadcast {
    /// Create a new broadcast
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: HashMap::new(),
            timestamp: Local::now(),
        }
    }

    /// Attach a payload field
    pub fn with_data(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.into(), value);
        }
        self
    }
}

/// What an agent declares about itself at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    /// Actions the agent answers to
    pub capabilities: HashSet<String>,
    /// Opt-in to concurrent in-flight dispatches; default is one at a time
    #[serde(default)]
    pub parallel: bool,
    /// Broadcast topics delivered to this agent ("*" matches all)
    #[serde(default)]
    pub subscriptions: HashSet<String>,
}

impl AgentDescriptor {
    /// Describe an agent and the actions it answers to
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            parallel: false,
            subscriptions: HashSet::new(),
        }
    }

    /// Declare the agent safe for concurrent dispatches
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Subscribe to a broadcast topic
    pub fn subscribe(mut self, topic: impl Into<String>) -> Self {
        self.subscriptions.insert(topic.into());
        self
    }

    pub fn supports(&self, action: &str) -> bool {
        self.capabilities.contains(action)
    }

    pub fn subscribed_to(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic) || self.subscriptions.contains("*")
    }
}
