//! Rules reference

use async_trait::async_trait;
use loremaster_bus::{Agent, AgentDescriptor, AgentFault};
use serde_json::json;
use std::collections::HashMap;

/// Answers rules lookups from a built-in reference table. Read-only, so
/// it dispatches in parallel.
pub struct RulesAgent {
    entries: Vec<(&'static str, &'static str)>,
}

impl RulesAgent {
    pub fn new() -> Self {
        Self {
            entries: vec![
                (
                    "grapple",
                    "Grappling: contest your Athletics against the target's \
                     Athletics or Acrobatics. On a win the target's speed drops to 0.",
                ),
                (
                    "opportunity attack",
                    "Opportunity attacks: leaving a hostile creature's reach \
                     without Disengaging provokes one melee attack as a reaction.",
                ),
                (
                    "advantage",
                    "Advantage and disadvantage: roll two d20s, take the higher \
                     with advantage and the lower with disadvantage. They never stack.",
                ),
                (
                    "concentration",
                    "Concentration: taking damage forces a Constitution save, DC 10 \
                     or half the damage, whichever is higher. Failure ends the spell.",
                ),
                (
                    "cover",
                    "Cover: half cover grants +2 to AC and Dexterity saves, \
                     three-quarters cover grants +5, and total cover cannot be targeted.",
                ),
                (
                    "sneak attack",
                    "Sneak attack: once per turn, add the extra dice when attacking \
                     with advantage or when an ally is within 5 feet of the target.",
                ),
            ],
        }
    }
}

impl Default for RulesAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for RulesAgent {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new("rules", ["lookup"]).parallel()
    }

    async fn handle(
        &self,
        _action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>, AgentFault> {
        let query = data
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentFault::Other("lookup needs a 'query' string".to_string()))?;
        let needle = query.to_lowercase();

        let hit = self
            .entries
            .iter()
            .find(|(topic, _)| needle.contains(topic) || topic.contains(needle.as_str()));

        match hit {
            Some((topic, text)) => {
                let mut out = HashMap::new();
                out.insert("topic".to_string(), json!(topic));
                out.insert("ruling".to_string(), json!(text));
                Ok(out)
            }
            None => Err(AgentFault::Generation(format!(
                "no ruling found for '{}'",
                query
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(text: &str) -> HashMap<String, serde_json::Value> {
        let mut data = HashMap::new();
        data.insert("query".to_string(), json!(text));
        data
    }

    #[tokio::test]
    async fn test_lookup_by_topic() {
        let agent = RulesAgent::new();
        let out = agent
            .handle("lookup", &query("how does Grappling work"))
            .await
            .expect("should find");
        assert_eq!(out["topic"], json!("grapple"));
    }

    #[tokio::test]
    async fn test_unknown_topic_is_a_generation_fault() {
        let agent = RulesAgent::new();
        let err = agent
            .handle("lookup", &query("underwater basket weaving"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentFault::Generation(_)));
    }

    #[tokio::test]
    async fn test_missing_query_is_rejected() {
        let agent = RulesAgent::new();
        let err = agent.handle("lookup", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, AgentFault::Other(_)));
    }
}
