//! Scene narration

use async_trait::async_trait;
use loremaster_bus::{Agent, AgentDescriptor, AgentFault, Broadcast};
use rand::seq::SliceRandom;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

const OPENINGS: &[&str] = &[
    "Lantern light gutters as the party steps into",
    "A cold wind follows the party toward",
    "The map ends here, but the road goes on into",
    "Somewhere ahead a bell tolls, and before the party lies",
];

const TURNS: &[&str] = &[
    "The quiet breaks: something moves at the edge of the light.",
    "A voice calls out from the dark, using a name nobody offered.",
    "The floor shifts underfoot, and the way back is no longer there.",
    "Whatever was following has stopped pretending not to.",
];

/// Narrates scenes from canned fragments. Keeps the last scene for
/// `continue`, so dispatches stay serialized. An injected delay stands
/// in for slow generation in demos and tests.
pub struct NarratorAgent {
    delay: Option<Duration>,
    last_scene: Mutex<Option<String>>,
}

impl NarratorAgent {
    pub fn new() -> Self {
        Self {
            delay: None,
            last_scene: Mutex::new(None),
        }
    }

    /// Take this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn compose(&self, prompt: &str) -> String {
        let mut rng = rand::thread_rng();
        let opening = OPENINGS
            .choose(&mut rng)
            .copied()
            .unwrap_or(OPENINGS[0]);
        format!("{} {}.", opening, prompt.trim_end_matches('.'))
    }
}

impl Default for NarratorAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for NarratorAgent {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new("narrator", ["generate", "continue"]).subscribe("turn")
    }

    async fn handle(
        &self,
        action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>, AgentFault> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scene = match action {
            "generate" => {
                let prompt = data
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AgentFault::Other("generate needs a 'prompt' string".to_string())
                    })?;
                self.compose(prompt)
            }
            "continue" => {
                let previous = self.last_scene.lock().await.clone().ok_or_else(|| {
                    AgentFault::Generation("no scene to continue yet".to_string())
                })?;
                let turn = {
                    let mut rng = rand::thread_rng();
                    TURNS.choose(&mut rng).copied().unwrap_or(TURNS[0])
                };
                format!("{} {}", previous, turn)
            }
            other => return Err(AgentFault::Other(format!("unhandled action '{}'", other))),
        };

        *self.last_scene.lock().await = Some(scene.clone());

        let mut out = HashMap::new();
        out.insert("scene".to_string(), json!(scene));
        Ok(out)
    }

    async fn notify(&self, broadcast: &Broadcast) {
        // A new turn resets the running scene
        if broadcast.topic == "turn" {
            *self.last_scene.lock().await = None;
        }
    }
}
