//! GRIMOIRE: remembered answers.
//!
//! Keyed store from request fingerprint to a previously dispatched result,
//! with per-class time-to-live and eviction priority. Consulted before
//! dispatch, written after a successful cacheable one.

use chrono::{DateTime, Local};
use loremaster_classifier::QueryClass;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub mod policy;

pub use policy::{CachePriority, ClassPolicy, PolicyTable};

/// Default bound on resident entries
pub const DEFAULT_CAPACITY: usize = 256;

/// Stable, canonical identity of a cacheable request.
///
/// Two requests with the same agent, action, and payload content produce
/// the same fingerprint regardless of payload key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(
        agent_id: &str,
        action: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut canonical = String::new();
        canonical.push_str(agent_id);
        canonical.push('|');
        canonical.push_str(action);
        canonical.push('|');

        let mut keys: Vec<&String> = data.keys().collect();
        keys.sort();
        for key in keys {
            write_key(key, &mut canonical);
            canonical.push('=');
            write_canonical(&data[key], &mut canonical);
            canonical.push(';');
        }
        Self(canonical)
    }
}

/// Keys render as JSON strings; a separator character inside a key stays
/// inside its quotes instead of splitting the canonical form
fn write_key(key: &str, out: &mut String) {
    out.push_str(&serde_json::Value::from(key).to_string());
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-order-independent rendering of a JSON value
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for key in keys {
                write_key(key, out);
                out.push(':');
                write_canonical(&map[key], out);
                out.push(',');
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for item in items {
                write_canonical(item, out);
                out.push(',');
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// One remembered answer
#[derive(Debug, Clone)]
struct CacheEntry {
    value: HashMap<String, serde_json::Value>,
    class: QueryClass,
    priority: CachePriority,
    created_at: Instant,
    stored_at: DateTime<Local>,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }

    /// A stored entry with nothing in it is treated as corrupt: forced
    /// miss, never surfaced to the caller.
    fn malformed(&self) -> bool {
        self.value.is_empty()
    }
}

/// Metadata about a resident entry, for inspection
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub class: QueryClass,
    pub priority: CachePriority,
    pub stored_at: DateTime<Local>,
    pub expired: bool,
}

/// The grimoire itself. Cheap to clone; all clones share the same pages.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<Fingerprint, CacheEntry>>>,
    policy: Arc<PolicyTable>,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(policy: PolicyTable, capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            policy: Arc::new(policy),
            capacity: capacity.max(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PolicyTable::default(), DEFAULT_CAPACITY)
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// A fresh answer, if one is resident and still within its TTL.
    /// Expired entries miss but stay resident for the stale-serve path;
    /// the sweeper tears them out. Malformed entries are dropped on sight.
    pub async fn lookup(
        &self,
        fingerprint: &Fingerprint,
    ) -> Option<HashMap<String, serde_json::Value>> {
        let mut entries = self.entries.lock().await;
        match entries.get(fingerprint) {
            Some(entry) if entry.malformed() => {
                debug!("dropping malformed cache entry for {}", fingerprint);
                entries.remove(fingerprint);
                None
            }
            Some(entry) if entry.expired() => {
                trace!("entry for {} is past its TTL", fingerprint);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// An answer even past its TTL; the stale-serve path for recovery.
    pub async fn lookup_stale(
        &self,
        fingerprint: &Fingerprint,
    ) -> Option<HashMap<String, serde_json::Value>> {
        let entries = self.entries.lock().await;
        entries
            .get(fingerprint)
            .filter(|entry| !entry.malformed())
            .map(|entry| entry.value.clone())
    }

    /// Remember an answer under the class policy. Returns false when the
    /// class is not cacheable. Under capacity pressure the lowest-priority
    /// entry goes first, oldest within the tier.
    pub async fn store(
        &self,
        fingerprint: Fingerprint,
        value: HashMap<String, serde_json::Value>,
        class: QueryClass,
    ) -> bool {
        let policy = self.policy.policy_for(class);
        if !policy.cacheable() {
            trace!("class {} is not cacheable, skipping store", class);
            return false;
        }

        let entry = CacheEntry {
            value,
            class,
            priority: policy.priority,
            created_at: Instant::now(),
            stored_at: Local::now(),
            ttl: policy.ttl(),
        };

        let mut entries = self.entries.lock().await;
        // a store overwrites whatever a racing purge left behind; the lock
        // makes the store the later of the two
        if !entries.contains_key(&fingerprint) {
            while entries.len() >= self.capacity {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, e)| (e.priority, e.created_at))
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(key) => {
                        debug!("evicting {} under capacity pressure", key);
                        entries.remove(&key);
                    }
                    None => break,
                }
            }
        }
        entries.insert(fingerprint, entry);
        true
    }

    /// Eagerly purge expired entries; returns how many pages were torn out
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired() && !entry.malformed());
        let removed = before - entries.len();
        if removed > 0 {
            debug!("sweep purged {} expired entries", removed);
        }
        removed
    }

    /// Periodic sweep on its own task
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // first tick completes immediately
            loop {
                interval.tick().await;
                cache.sweep().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Forget everything; used on session restore
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Metadata for a resident entry, if any
    pub async fn inspect(&self, fingerprint: &Fingerprint) -> Option<EntryInfo> {
        let entries = self.entries.lock().await;
        entries.get(fingerprint).map(|entry| EntryInfo {
            class: entry.class,
            priority: entry.priority,
            stored_at: entry.stored_at,
            expired: entry.expired(),
        })
    }
}
