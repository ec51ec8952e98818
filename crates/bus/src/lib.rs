//! TABLETALK: the table's dispatch bus.
//!
//! Routes typed requests to registered agents, bounds every wait with the
//! request timeout, and fans independent sub-dispatches out under a shared
//! deadline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace, warn};

pub mod envelope;

pub use envelope::{
    AgentDescriptor, Broadcast, DispatchRequest, DispatchResponse, DEFAULT_TIMEOUT_S,
};

/// Failure raised by an agent itself while handling an action
#[derive(Error, Debug, Clone)]
pub enum AgentFault {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("communication breakdown: {0}")]
    Communication(String),

    #[error("{0}")]
    Other(String),
}

/// Dispatch errors
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("no agent at the table named '{0}'")]
    UnknownAgent(String),

    #[error("agent '{agent}' does not answer to '{action}'")]
    UnsupportedAction { agent: String, action: String },

    #[error("agent '{agent}' gave no answer within {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    #[error("agent '{agent}' failed: {fault}")]
    AgentFailure { agent: String, fault: AgentFault },
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// An independently addressable worker handling its declared actions.
///
/// One `handle` call runs at a time unless the descriptor opts into
/// parallel dispatch; agent-local state may assume exclusive access by
/// default.
#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> AgentDescriptor;

    async fn handle(
        &self,
        action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> std::result::Result<HashMap<String, serde_json::Value>, AgentFault>;

    /// Fire-and-forget notification; default is to ignore it
    async fn notify(&self, _broadcast: &Broadcast) {}
}

/// Join semantics for fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Every sub-dispatch must succeed
    All,
    /// Proceed with whatever returned before the deadline
    Partial,
}

struct Registered {
    agent: Arc<dyn Agent>,
    descriptor: AgentDescriptor,
    /// Serializes in-flight dispatches for agents that did not opt into
    /// parallel handling; tokio's Mutex wakes waiters in FIFO order, which
    /// is what gives sequential callers per-agent request ordering.
    gate: Arc<Mutex<()>>,
}

/// TABLETALK dispatch bus
#[derive(Clone)]
pub struct MessageBus {
    registry: Arc<RwLock<HashMap<String, Registered>>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// An empty table
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Seat an agent at the table. Registration happens at startup; the
    /// registry is read-mostly afterwards.
    pub async fn register(&self, agent: Arc<dyn Agent>) {
        let descriptor = agent.descriptor();
        let id = descriptor.id.clone();

        let mut registry = self.registry.write().await;
        if registry.contains_key(&id) {
            warn!("agent '{}' re-registered, replacing previous seat", id);
        }
        debug!(
            "seated agent '{}' (actions: {:?}, parallel: {})",
            id, descriptor.capabilities, descriptor.parallel
        );
        registry.insert(
            id,
            Registered {
                agent,
                descriptor,
                gate: Arc::new(Mutex::new(())),
            },
        );
    }

    /// Route one request to its agent and wait for the answer.
    ///
    /// The timeout bounds the whole wait, gate included; on expiry the
    /// invocation is dropped and the caller released.
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchResponse> {
        let (agent, descriptor, gate) = {
            let registry = self.registry.read().await;
            let seat = registry
                .get(&req.agent_id)
                .ok_or_else(|| DispatchError::UnknownAgent(req.agent_id.clone()))?;
            (
                seat.agent.clone(),
                seat.descriptor.clone(),
                seat.gate.clone(),
            )
        };

        if !descriptor.supports(&req.action) {
            return Err(DispatchError::UnsupportedAction {
                agent: req.agent_id.clone(),
                action: req.action.clone(),
            });
        }

        trace!("dispatch {} -> {}", req.id, req.operation());

        let started = std::time::Instant::now();
        let serialized = !descriptor.parallel;
        let call = async {
            let _turn = if serialized {
                Some(gate.lock().await)
            } else {
                None
            };
            agent.handle(&req.action, &req.data).await
        };

        match tokio::time::timeout(req.timeout, call).await {
            Ok(Ok(data)) => Ok(DispatchResponse::ok(data).with_elapsed(started.elapsed())),
            Ok(Err(fault)) => Err(DispatchError::AgentFailure {
                agent: req.agent_id,
                fault,
            }),
            Err(_) => Err(DispatchError::Timeout {
                agent: req.agent_id,
                timeout: req.timeout,
            }),
        }
    }

    /// Issue independent sub-dispatches concurrently and join them under a
    /// shared deadline. Slots come back in request order; sub-dispatches
    /// still pending at the deadline become `Timeout` slots. Under
    /// `JoinPolicy::All` the first failed slot fails the whole join.
    pub async fn fan_out(
        &self,
        requests: Vec<DispatchRequest>,
        deadline: Duration,
        policy: JoinPolicy,
    ) -> Result<Vec<Result<DispatchResponse>>> {
        let targets: Vec<String> = requests.iter().map(|r| r.agent_id.clone()).collect();
        let total = requests.len();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for (idx, req) in requests.into_iter().enumerate() {
            let bus = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = bus.dispatch(req).await;
                let _ = tx.send((idx, result));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<Result<DispatchResponse>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut received = 0;

        let overall = tokio::time::sleep(deadline);
        tokio::pin!(overall);

        while received < total {
            tokio::select! {
                _ = &mut overall => {
                    debug!("fan-out deadline reached with {}/{} answers", received, total);
                    break;
                }
                next = rx.recv() => match next {
                    Some((idx, result)) => {
                        slots[idx] = Some(result);
                        received += 1;
                    }
                    None => break,
                },
            }
        }

        let results: Vec<Result<DispatchResponse>> = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    Err(DispatchError::Timeout {
                        agent: targets[idx].clone(),
                        timeout: deadline,
                    })
                })
            })
            .collect();

        if policy == JoinPolicy::All {
            if let Some(err) = results.iter().find_map(|r| r.as_ref().err()) {
                return Err(err.clone());
            }
        }

        Ok(results)
    }

    /// Deliver a notification to every subscribed agent. Delivery is
    /// isolated per agent; one agent's trouble never blocks the rest.
    /// Returns the number of agents addressed.
    pub async fn broadcast(&self, broadcast: Broadcast) -> usize {
        let targets: Vec<Arc<dyn Agent>> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .filter(|seat| seat.descriptor.subscribed_to(&broadcast.topic))
                .map(|seat| seat.agent.clone())
                .collect()
        };

        trace!("broadcast '{}' -> {} agents", broadcast.topic, targets.len());

        let delivered = targets.len();
        for agent in targets {
            let b = broadcast.clone();
            tokio::spawn(async move {
                agent.notify(&b).await;
            });
        }
        delivered
    }

    /// Descriptors of everyone at the table
    pub async fn agents(&self) -> Vec<AgentDescriptor> {
        let registry = self.registry.read().await;
        let mut all: Vec<AgentDescriptor> =
            registry.values().map(|s| s.descriptor.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Descriptor for one agent, if seated
    pub async fn descriptor(&self, agent_id: &str) -> Option<AgentDescriptor> {
        let registry = self.registry.read().await;
        registry.get(agent_id).map(|s| s.descriptor.clone())
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.registry.read().await.contains_key(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn descriptor(&self) -> AgentDescriptor {
            AgentDescriptor::new("echo", ["say"]).parallel()
        }

        async fn handle(
            &self,
            _action: &str,
            data: &HashMap<String, serde_json::Value>,
        ) -> std::result::Result<HashMap<String, serde_json::Value>, AgentFault> {
            Ok(data.clone())
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let bus = MessageBus::new();
        bus.register(Arc::new(EchoAgent)).await;

        assert!(bus.contains("echo").await);
        assert!(!bus.contains("ghost").await);

        let desc = bus.descriptor("echo").await.expect("should be seated");
        assert!(desc.supports("say"));
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let bus = MessageBus::new();
        bus.register(Arc::new(EchoAgent)).await;

        let req = DispatchRequest::new("echo", "say").with_data("line", "well met");
        let resp = bus.dispatch(req).await.expect("should dispatch");

        assert!(resp.success);
        assert!(!resp.degraded);
        assert_eq!(resp.data.get("line").unwrap(), &json!("well met"));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let bus = MessageBus::new();
        let err = bus
            .dispatch(DispatchRequest::new("ghost", "haunt"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownAgent(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_unsupported_action() {
        let bus = MessageBus::new();
        bus.register(Arc::new(EchoAgent)).await;

        let err = bus
            .dispatch(DispatchRequest::new("echo", "sing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedAction { .. }));
    }

    #[tokio::test]
    async fn test_agents_sorted() {
        let bus = MessageBus::new();
        bus.register(Arc::new(EchoAgent)).await;
        let all = bus.agents().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "echo");
    }
}
