//! Per-class cache policy: how long an answer keeps, and how reluctantly
//! it is evicted.

use loremaster_classifier::QueryClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Eviction reluctance. Lower priorities leave the cache first; `Never`
/// marks a class whose results are never stored at all.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    Medium,
    High,
    Never,
}

/// Policy for one query class
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassPolicy {
    pub ttl_seconds: u64,
    pub priority: CachePriority,
}

impl ClassPolicy {
    pub fn new(ttl_seconds: u64, priority: CachePriority) -> Self {
        Self {
            ttl_seconds,
            priority,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn cacheable(&self) -> bool {
        self.priority != CachePriority::Never
    }
}

/// QueryClass -> policy mapping, usually loaded from config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    classes: HashMap<QueryClass, ClassPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert(
            QueryClass::ScenarioGeneration,
            ClassPolicy::new(60 * 60, CachePriority::Low),
        );
        classes.insert(
            QueryClass::RuleQuery,
            ClassPolicy::new(24 * 60 * 60, CachePriority::High),
        );
        // dice are nondeterministic, never served from cache
        classes.insert(QueryClass::DiceRoll, ClassPolicy::new(0, CachePriority::Never));
        classes.insert(
            QueryClass::CampaignInfo,
            ClassPolicy::new(12 * 60 * 60, CachePriority::Medium),
        );
        classes.insert(
            QueryClass::General,
            ClassPolicy::new(5 * 60, CachePriority::Low),
        );
        Self { classes }
    }
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    pub fn set(&mut self, class: QueryClass, policy: ClassPolicy) {
        self.classes.insert(class, policy);
    }

    /// Policy for a class; classes without an entry are not cacheable
    pub fn policy_for(&self, class: QueryClass) -> ClassPolicy {
        self.classes
            .get(&class)
            .copied()
            .unwrap_or(ClassPolicy::new(0, CachePriority::Never))
    }

    pub fn is_cacheable(&self, class: QueryClass) -> bool {
        self.policy_for(class).cacheable()
    }
}
