//! Dice roller

use async_trait::async_trait;
use loremaster_bus::{Agent, AgentDescriptor, AgentFault, Broadcast};
use rand::Rng;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

const MAX_COUNT: i64 = 100;
const MAX_SIDES: i64 = 1000;

/// Rolls standard `XdY+Z` notation. Stateless, so it dispatches in
/// parallel.
pub struct DiceAgent {
    notation: Regex,
}

/// One parsed roll request
#[derive(Debug, PartialEq, Eq)]
struct Notation {
    count: i64,
    sides: i64,
    modifier: i64,
}

impl DiceAgent {
    pub fn new() -> Self {
        Self {
            notation: Regex::new(r"^\s*(\d*)\s*d\s*(\d+)\s*(?:([+-])\s*(\d+))?\s*$")
                .expect("dice notation pattern must compile"),
        }
    }

    fn parse(&self, expr: &str) -> Result<Notation, AgentFault> {
        let caps = self
            .notation
            .captures(expr)
            .ok_or_else(|| AgentFault::Other(format!("unreadable dice notation: '{}'", expr)))?;

        let count: i64 = match caps.get(1).map(|m| m.as_str()).unwrap_or("") {
            "" => 1,
            digits => digits
                .parse()
                .map_err(|_| AgentFault::Other(format!("too many dice in '{}'", expr)))?,
        };
        let sides: i64 = caps[2]
            .parse()
            .map_err(|_| AgentFault::Other(format!("die too large in '{}'", expr)))?;
        let modifier: i64 = match (caps.get(3), caps.get(4)) {
            (Some(sign), Some(digits)) => {
                let value: i64 = digits
                    .as_str()
                    .parse()
                    .map_err(|_| AgentFault::Other(format!("modifier too large in '{}'", expr)))?;
                if sign.as_str() == "-" {
                    -value
                } else {
                    value
                }
            }
            _ => 0,
        };

        if count < 1 || count > MAX_COUNT {
            return Err(AgentFault::Other(format!(
                "dice count must be 1..={}, got {}",
                MAX_COUNT, count
            )));
        }
        if sides < 2 || sides > MAX_SIDES {
            return Err(AgentFault::Other(format!(
                "die must have 2..={} sides, got {}",
                MAX_SIDES, sides
            )));
        }

        Ok(Notation {
            count,
            sides,
            modifier,
        })
    }
}

impl Default for DiceAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for DiceAgent {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new("dice", ["roll"]).parallel()
    }

    async fn handle(
        &self,
        _action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>, AgentFault> {
        let expr = data
            .get("expr")
            .and_then(|v| v.as_str())
            .unwrap_or("1d20");
        let notation = self.parse(expr)?;

        let mut rng = rand::thread_rng();
        let rolls: Vec<i64> = (0..notation.count)
            .map(|_| rng.gen_range(1..=notation.sides))
            .collect();
        let total: i64 = rolls.iter().sum::<i64>() + notation.modifier;

        debug!("rolled {} -> {} ({:?})", expr, total, rolls);

        let mut out = HashMap::new();
        out.insert("expr".to_string(), json!(expr));
        out.insert("rolls".to_string(), json!(rolls));
        out.insert("modifier".to_string(), json!(notation.modifier));
        out.insert("total".to_string(), json!(total));
        Ok(out)
    }

    async fn notify(&self, _broadcast: &Broadcast) {}
}
