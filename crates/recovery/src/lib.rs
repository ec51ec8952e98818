//! SECOND WIND: adaptive failure recovery.
//!
//! Classifies a failed dispatch, picks a fallback strategy weighted by how
//! often each one has worked for that kind of failure, and keeps the books
//! so future picks get better. Strategy execution itself happens in the
//! orchestrator; this crate owns classification, selection, and history.

use chrono::{DateTime, Local};
use loremaster_bus::{AgentFault, DispatchError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Minimum share of picks spent trying non-favorite strategies, so an
/// early lucky streak cannot lock selection in forever
pub const DEFAULT_EXPLORATION_RATE: f64 = 0.10;

/// Raw records kept for inspection; aggregates are never reset
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// What went wrong, as recovery sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Timeout,
    GenerationFailure,
    ContextOverflow,
    AgentCommunication,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::GenerationFailure => "generation-failure",
            ErrorKind::ContextOverflow => "context-overflow",
            ErrorKind::AgentCommunication => "agent-communication",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Map a dispatch failure to a recoverable kind. `None` means the failure
/// is a configuration error (unknown agent, unsupported action) and must
/// surface immediately, never be retried.
pub fn classify_failure(err: &DispatchError) -> Option<ErrorKind> {
    match err {
        DispatchError::UnknownAgent(_) | DispatchError::UnsupportedAction { .. } => None,
        DispatchError::Timeout { .. } => Some(ErrorKind::Timeout),
        DispatchError::AgentFailure { fault, .. } => Some(match fault {
            AgentFault::Generation(_) => ErrorKind::GenerationFailure,
            AgentFault::ContextOverflow(_) => ErrorKind::ContextOverflow,
            AgentFault::Communication(_) => ErrorKind::AgentCommunication,
            AgentFault::Other(_) => ErrorKind::Unknown,
        }),
    }
}

/// The fallback moves recovery knows how to make
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Re-dispatch the request as-is
    Retry,
    /// Re-dispatch with oversized context trimmed out of the payload
    RetryTrimmedContext,
    /// Serve a cached answer even past its TTL
    ServeStale,
    /// Synthesize a safe default response
    Fallback,
}

impl Strategy {
    pub fn id(&self) -> &'static str {
        match self {
            Strategy::Retry => "retry",
            Strategy::RetryTrimmedContext => "retry-trimmed-context",
            Strategy::ServeStale => "serve-stale",
            Strategy::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// One recovery attempt, appended on every execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub error_kind: ErrorKind,
    pub strategy: Strategy,
    pub attempted_at: DateTime<Local>,
    pub succeeded: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct StrategyStats {
    attempts: u64,
    successes: u64,
}

impl StrategyStats {
    /// Laplace-smoothed success ratio; unseen strategies start at 0.5 so
    /// they are worth a look without dominating proven ones
    fn ratio(&self) -> f64 {
        (self.successes + 1) as f64 / (self.attempts + 2) as f64
    }
}

#[derive(Default)]
struct Ledger {
    stats: HashMap<(ErrorKind, Strategy), StrategyStats>,
    history: VecDeque<RecoveryRecord>,
}

/// Per-error-kind candidate lists plus the running score book.
/// Cheap to clone; clones share the ledger.
#[derive(Clone)]
pub struct StrategyBook {
    candidates: Arc<HashMap<ErrorKind, Vec<Strategy>>>,
    exploration_rate: f64,
    history_limit: usize,
    ledger: Arc<Mutex<Ledger>>,
}

impl Default for StrategyBook {
    fn default() -> Self {
        Self::new(DEFAULT_EXPLORATION_RATE, DEFAULT_HISTORY_LIMIT)
    }
}

impl StrategyBook {
    pub fn new(exploration_rate: f64, history_limit: usize) -> Self {
        Self::with_candidates(default_candidates(), exploration_rate, history_limit)
    }

    pub fn with_candidates(
        candidates: HashMap<ErrorKind, Vec<Strategy>>,
        exploration_rate: f64,
        history_limit: usize,
    ) -> Self {
        Self {
            candidates: Arc::new(candidates),
            exploration_rate: exploration_rate.clamp(0.0, 1.0),
            history_limit: history_limit.max(1),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    pub fn exploration_rate(&self) -> f64 {
        self.exploration_rate
    }

    pub fn candidates_for(&self, kind: ErrorKind) -> &[Strategy] {
        self.candidates.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pick a strategy for this kind of failure
    pub async fn select(&self, kind: ErrorKind) -> Option<Strategy> {
        let (roll, pick) = {
            let mut rng = rand::thread_rng();
            (rng.gen::<f64>(), rng.gen::<usize>())
        };
        self.select_seeded(kind, roll, pick).await
    }

    /// Deterministic core of selection: explore with probability
    /// `exploration_rate`, otherwise take the candidate with the best
    /// smoothed success ratio, table order breaking ties.
    pub async fn select_seeded(
        &self,
        kind: ErrorKind,
        explore_roll: f64,
        explore_pick: usize,
    ) -> Option<Strategy> {
        let candidates = self.candidates.get(&kind)?;
        if candidates.is_empty() {
            return None;
        }

        if explore_roll < self.exploration_rate {
            let choice = candidates[explore_pick % candidates.len()];
            trace!("exploring {} for {}", choice, kind);
            return Some(choice);
        }

        let ledger = self.ledger.lock().await;
        let mut best = candidates[0];
        let mut best_ratio = f64::NEG_INFINITY;
        for &strategy in candidates {
            let ratio = ledger
                .stats
                .get(&(kind, strategy))
                .copied()
                .unwrap_or_default()
                .ratio();
            if ratio > best_ratio {
                best = strategy;
                best_ratio = ratio;
            }
        }
        trace!("exploiting {} for {} (ratio {:.2})", best, kind, best_ratio);
        Some(best)
    }

    /// Record the outcome of an executed strategy
    pub async fn record(&self, kind: ErrorKind, strategy: Strategy, succeeded: bool) {
        let mut ledger = self.ledger.lock().await;
        let stats = ledger.stats.entry((kind, strategy)).or_default();
        stats.attempts += 1;
        if succeeded {
            stats.successes += 1;
        }
        debug!(
            "recovery {} via {}: {} ({}/{} so far)",
            kind,
            strategy,
            if succeeded { "worked" } else { "failed" },
            stats.successes,
            stats.attempts
        );

        ledger.history.push_back(RecoveryRecord {
            error_kind: kind,
            strategy,
            attempted_at: Local::now(),
            succeeded,
        });
        while ledger.history.len() > self.history_limit {
            ledger.history.pop_front();
        }
    }

    /// Recent raw attempts, oldest first
    pub async fn recent(&self) -> Vec<RecoveryRecord> {
        self.ledger.lock().await.history.iter().cloned().collect()
    }

    /// Smoothed success ratio for one pairing
    pub async fn success_ratio(&self, kind: ErrorKind, strategy: Strategy) -> f64 {
        self.ledger
            .lock()
            .await
            .stats
            .get(&(kind, strategy))
            .copied()
            .unwrap_or_default()
            .ratio()
    }

    pub async fn attempts(&self, kind: ErrorKind, strategy: Strategy) -> u64 {
        self.ledger
            .lock()
            .await
            .stats
            .get(&(kind, strategy))
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    /// Forget everything; used on session restore
    pub async fn reset(&self) {
        let mut ledger = self.ledger.lock().await;
        ledger.stats.clear();
        ledger.history.clear();
    }
}

fn default_candidates() -> HashMap<ErrorKind, Vec<Strategy>> {
    let mut map = HashMap::new();
    map.insert(
        ErrorKind::Timeout,
        vec![
            Strategy::RetryTrimmedContext,
            Strategy::ServeStale,
            Strategy::Fallback,
        ],
    );
    map.insert(
        ErrorKind::GenerationFailure,
        vec![Strategy::Retry, Strategy::ServeStale, Strategy::Fallback],
    );
    map.insert(
        ErrorKind::ContextOverflow,
        vec![Strategy::RetryTrimmedContext, Strategy::Fallback],
    );
    map.insert(
        ErrorKind::AgentCommunication,
        vec![Strategy::Retry, Strategy::Fallback],
    );
    map.insert(ErrorKind::Unknown, vec![Strategy::Fallback]);
    map
}
