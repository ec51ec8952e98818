//! SAGE: query classification.
//!
//! Maps a request's agent, action, and text content to a query class.
//! Classes drive caching and routing policy only; they never change what a
//! dispatch returns.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Routing and caching label derived from a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryClass {
    ScenarioGeneration,
    RuleQuery,
    DiceRoll,
    CampaignInfo,
    General,
}

impl QueryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::ScenarioGeneration => "scenario-generation",
            QueryClass::RuleQuery => "rule-query",
            QueryClass::DiceRoll => "dice-roll",
            QueryClass::CampaignInfo => "campaign-info",
            QueryClass::General => "general",
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One predicate in the ordered table
struct ClassRule {
    pattern: Regex,
    class: QueryClass,
}

/// Ordered predicate table; first match wins, `General` when nothing does.
///
/// Classification is pure: same input, same class, no side effects.
pub struct QueryClassifier {
    rules: Vec<ClassRule>,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        // table order is the tie-break, keep scenario patterns first
        Self::with_rules(vec![
            (
                r"generate|scenario|story|continue|narrat",
                QueryClass::ScenarioGeneration,
            ),
            (r"\broll|\bdice|\b\d*d\d+\b", QueryClass::DiceRoll),
            (r"\brule|how does|mechanic", QueryClass::RuleQuery),
            (
                r"campaign|setting|location|\bnpc",
                QueryClass::CampaignInfo,
            ),
        ])
        .expect("default classification table must compile")
    }
}

impl QueryClassifier {
    /// Build a classifier from an ordered `(pattern, class)` table
    pub fn with_rules(
        table: Vec<(&str, QueryClass)>,
    ) -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(table.len());
        for (pattern, class) in table {
            rules.push(ClassRule {
                pattern: Regex::new(pattern)?,
                class,
            });
        }
        Ok(Self { rules })
    }

    /// Label a request. Matches against the lowercased agent id, action,
    /// and every top-level string in the payload, in table order.
    pub fn classify(
        &self,
        agent_id: &str,
        action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> QueryClass {
        let haystack = Self::haystack(agent_id, action, data);

        for rule in &self.rules {
            if rule.pattern.is_match(&haystack) {
                return rule.class;
            }
        }
        QueryClass::General
    }

    fn haystack(
        agent_id: &str,
        action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> String {
        let mut haystack = String::new();
        haystack.push_str(agent_id);
        haystack.push(' ');
        haystack.push_str(action);
        // sorted-key order so phrases split across values concatenate the
        // same way on every call
        let mut keys: Vec<&String> = data.keys().collect();
        keys.sort();
        for key in keys {
            if let Some(text) = data[key].as_str() {
                haystack.push(' ');
                haystack.push_str(text);
            }
        }
        haystack.to_lowercase()
    }
}
