//! Campaign memory

use async_trait::async_trait;
use loremaster_bus::{Agent, AgentDescriptor, AgentFault, Broadcast};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Keeps the table's running state: named notes plus a turn counter
/// advanced by `turn` broadcasts. Stateful, so dispatches stay
/// serialized.
pub struct CampaignAgent {
    notes: Mutex<HashMap<String, String>>,
    turn: AtomicU64,
}

impl CampaignAgent {
    pub fn new() -> Self {
        Self {
            notes: Mutex::new(HashMap::new()),
            turn: AtomicU64::new(0),
        }
    }

    pub fn current_turn(&self) -> u64 {
        self.turn.load(Ordering::SeqCst)
    }
}

impl Default for CampaignAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for CampaignAgent {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new("campaign", ["record", "recall", "describe"]).subscribe("turn")
    }

    async fn handle(
        &self,
        action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>, AgentFault> {
        match action {
            "record" => {
                let key = data
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AgentFault::Other("record needs a 'key' string".to_string()))?;
                let note = data
                    .get("note")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AgentFault::Other("record needs a 'note' string".to_string()))?;

                self.notes
                    .lock()
                    .await
                    .insert(key.to_string(), note.to_string());
                debug!("recorded campaign note '{}'", key);

                let mut out = HashMap::new();
                out.insert("stored".to_string(), json!(true));
                out.insert("key".to_string(), json!(key));
                Ok(out)
            }
            "recall" => {
                let key = data
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AgentFault::Other("recall needs a 'key' string".to_string()))?;

                match self.notes.lock().await.get(key) {
                    Some(note) => {
                        let mut out = HashMap::new();
                        out.insert("key".to_string(), json!(key));
                        out.insert("note".to_string(), json!(note));
                        Ok(out)
                    }
                    None => Err(AgentFault::Generation(format!(
                        "nothing recorded under '{}'",
                        key
                    ))),
                }
            }
            "describe" => {
                let notes = self.notes.lock().await;
                let mut keys: Vec<&str> = notes.keys().map(|k| k.as_str()).collect();
                keys.sort_unstable();

                let mut out = HashMap::new();
                out.insert("turn".to_string(), json!(self.current_turn()));
                out.insert("notes".to_string(), json!(notes.len()));
                out.insert("keys".to_string(), json!(keys));
                Ok(out)
            }
            other => Err(AgentFault::Other(format!("unhandled action '{}'", other))),
        }
    }

    async fn notify(&self, broadcast: &Broadcast) {
        if broadcast.topic == "turn" {
            let turn = self.turn.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("campaign advanced to turn {}", turn);
        }
    }
}
