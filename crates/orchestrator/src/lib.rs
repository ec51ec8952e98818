//! The loremaster's chair: dispatch, memory, and recovery in one seat
//!
//! Ties the bus, the query classifier, the response cache, the recovery
//! book, and the performance monitor into a single dispatch pipeline.
//! Every request goes: classify, consult the cache, dispatch on a miss,
//! and on a recoverable failure work through the strategy book before
//! giving up.

use loremaster_bus::{
    Broadcast, DispatchError, DispatchRequest, DispatchResponse, JoinPolicy, MessageBus,
};
use loremaster_cache::{Fingerprint, ResponseCache};
use loremaster_classifier::{QueryClass, QueryClassifier};
use loremaster_config::Config;
use loremaster_monitor::{AlertReceiver, HealthReport, Outcome, PerformanceMonitor};
use loremaster_recovery::{classify_failure, ErrorKind, RecoveryRecord, Strategy, StrategyBook};
use loremaster_session::SessionSnapshot;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Strings in a retried payload are cut to this many characters
const TRIM_STRING_LIMIT: usize = 512;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Failures the book does not cover, surfaced as-is
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Every candidate strategy for this failure was tried and lost
    #[error("recovery exhausted for {kind} failure: {original}")]
    Unrecovered {
        kind: ErrorKind,
        original: DispatchError,
    },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The table's orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    bus: MessageBus,
    classifier: Arc<QueryClassifier>,
    cache: ResponseCache,
    recovery: StrategyBook,
    monitor: PerformanceMonitor,
    max_redispatch: u32,
}

impl Orchestrator {
    /// Assemble a table from explicit parts
    pub fn with_parts(
        bus: MessageBus,
        classifier: QueryClassifier,
        cache: ResponseCache,
        recovery: StrategyBook,
        monitor: PerformanceMonitor,
        max_redispatch: u32,
    ) -> Self {
        Self {
            bus,
            classifier: Arc::new(classifier),
            cache,
            recovery,
            monitor,
            max_redispatch,
        }
    }

    /// Assemble a table from config, with an empty bus and a running
    /// cache sweeper. The receiver carries threshold alerts.
    pub fn from_config(config: &Config) -> (Self, AlertReceiver) {
        let (monitor, alerts) =
            PerformanceMonitor::channel(config.monitor.thresholds, config.monitor.window);
        let cache = ResponseCache::new(config.cache.classes.clone(), config.cache.capacity);
        cache.spawn_sweeper(config.sweep_interval());

        let table = Self::with_parts(
            MessageBus::new(),
            QueryClassifier::default(),
            cache,
            StrategyBook::new(
                config.recovery.exploration_rate,
                config.recovery.history_limit,
            ),
            monitor,
            config.recovery.max_redispatch_attempts,
        );
        (table, alerts)
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Route one request through cache, bus, and recovery
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchResponse> {
        let operation = req.operation();
        let class = self
            .classifier
            .classify(&req.agent_id, &req.action, &req.data);
        let fingerprint = Fingerprint::of(&req.agent_id, &req.action, &req.data);

        let started = std::time::Instant::now();
        if let Some(value) = self.cache.lookup(&fingerprint).await {
            debug!("cache answered {} ({})", operation, class);
            self.monitor
                .record(&operation, started.elapsed(), Outcome::CacheHit)
                .await;
            return Ok(DispatchResponse::ok(value).with_elapsed(started.elapsed()));
        }

        match self.bus.dispatch(req.clone()).await {
            Ok(resp) => {
                self.cache
                    .store(fingerprint, resp.data.clone(), class)
                    .await;
                self.monitor
                    .record(&operation, resp.elapsed, Outcome::Success)
                    .await;
                Ok(resp)
            }
            Err(err) => {
                let Some(kind) = classify_failure(&err) else {
                    self.monitor
                        .record(&operation, started.elapsed(), Outcome::Failure)
                        .await;
                    return Err(err.into());
                };

                warn!("{} failed ({}), consulting the book: {}", operation, kind, err);
                match self.recover(&req, &fingerprint, class, kind).await {
                    Some(resp) => {
                        self.monitor
                            .record(&operation, started.elapsed(), Outcome::Success)
                            .await;
                        Ok(resp.with_elapsed(started.elapsed()))
                    }
                    None => {
                        self.monitor
                            .record(&operation, started.elapsed(), Outcome::Failure)
                            .await;
                        Err(OrchestratorError::Unrecovered {
                            kind,
                            original: err,
                        })
                    }
                }
            }
        }
    }

    /// Work through the book until a strategy lands or the candidates
    /// run out. Every attempt is recorded, win or lose.
    async fn recover(
        &self,
        req: &DispatchRequest,
        fingerprint: &Fingerprint,
        class: QueryClass,
        kind: ErrorKind,
    ) -> Option<DispatchResponse> {
        let mut tried: Vec<Strategy> = Vec::new();
        let mut redispatch_budget = self.max_redispatch;

        while let Some(strategy) = self.next_strategy(kind, &tried).await {
            tried.push(strategy);
            debug!("recovery attempt: {} for {}", strategy, kind);

            let outcome = match strategy {
                // a strategy the budget never let run is no evidence
                // against it, so it stays out of the ledger
                Strategy::Retry | Strategy::RetryTrimmedContext
                    if redispatch_budget == 0 =>
                {
                    debug!("redispatch budget spent, skipping {}", strategy);
                    continue;
                }
                Strategy::Retry => {
                    redispatch_budget -= 1;
                    self.redispatch(req.clone()).await
                }
                Strategy::RetryTrimmedContext => {
                    redispatch_budget -= 1;
                    let mut slim = req.clone();
                    slim.data = trimmed(&req.data);
                    self.redispatch(slim).await
                }
                Strategy::ServeStale => self
                    .cache
                    .lookup_stale(fingerprint)
                    .await
                    .map(DispatchResponse::recovered),
                Strategy::Fallback => {
                    let mut data = HashMap::new();
                    data.insert("fallback".to_string(), Value::Bool(true));
                    data.insert("text".to_string(), Value::String(fallback_answer(class)));
                    Some(DispatchResponse::recovered(data))
                }
            };

            let succeeded = outcome.is_some();
            self.recovery.record(kind, strategy, succeeded).await;
            if let Some(resp) = outcome {
                info!("{} recovered via {}", req.operation(), strategy);
                return Some(resp);
            }
        }

        None
    }

    /// Pick the book's choice, falling back to table order once the
    /// chosen strategy has already been burned this round
    async fn next_strategy(&self, kind: ErrorKind, tried: &[Strategy]) -> Option<Strategy> {
        let choice = self.recovery.select(kind).await?;
        if !tried.contains(&choice) {
            return Some(choice);
        }
        self.recovery
            .candidates_for(kind)
            .iter()
            .copied()
            .find(|s| !tried.contains(s))
    }

    /// One more trip to the agent
    async fn redispatch(&self, req: DispatchRequest) -> Option<DispatchResponse> {
        match self.bus.dispatch(req).await {
            Ok(resp) => Some(DispatchResponse::recovered(resp.data)),
            Err(err) => {
                debug!("redispatch failed: {}", err);
                None
            }
        }
    }

    /// Fan requests out on the bus and record a sample per slot
    pub async fn fan_out(
        &self,
        requests: Vec<DispatchRequest>,
        deadline: Duration,
        policy: JoinPolicy,
    ) -> Result<Vec<loremaster_bus::Result<DispatchResponse>>> {
        let operations: Vec<String> = requests.iter().map(|r| r.operation()).collect();

        let started = std::time::Instant::now();
        let slots = self.bus.fan_out(requests, deadline, policy).await?;

        for (operation, slot) in operations.iter().zip(slots.iter()) {
            let outcome = match slot {
                Ok(_) => Outcome::Success,
                Err(_) => Outcome::Failure,
            };
            let latency = slot
                .as_ref()
                .map(|resp| resp.elapsed)
                .unwrap_or_else(|_| started.elapsed());
            self.monitor.record(operation, latency, outcome).await;
        }

        Ok(slots)
    }

    /// Notify subscribed agents; returns how many were addressed
    pub async fn broadcast(&self, broadcast: Broadcast) -> usize {
        self.bus.broadcast(broadcast).await
    }

    pub async fn health(&self) -> HealthReport {
        self.monitor.health().await
    }

    pub async fn recent_recoveries(&self) -> Vec<RecoveryRecord> {
        self.recovery.recent().await
    }

    /// Capture the table's shape for later restore. Agents' internal
    /// state stays with the agents; the bundle records who was seated.
    pub async fn snapshot(&self, key: &str) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::new(key);
        let agents: Vec<String> = self
            .bus
            .agents()
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();
        snapshot.put("agents", agents);
        snapshot
    }

    /// Forget cache, recovery ledger, and metrics
    pub async fn reset(&self) {
        self.cache.clear().await;
        self.recovery.reset().await;
        self.monitor.reset().await;
    }

    /// Restore from a snapshot: cache, recovery ledger, and metrics all
    /// restart empty
    pub async fn restore(&self, snapshot: &SessionSnapshot) {
        info!("restoring session '{}'", snapshot.key);
        self.reset().await;
    }
}

/// Strip the payload for a retry after overflow: drop accumulated
/// context wholesale and cut any remaining oversized strings
fn trimmed(data: &HashMap<String, Value>) -> HashMap<String, Value> {
    data.iter()
        .filter(|(key, _)| key.as_str() != "context")
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) if s.chars().count() > TRIM_STRING_LIMIT => {
                    Value::String(s.chars().take(TRIM_STRING_LIMIT).collect())
                }
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Last-resort answer when every other strategy has failed
fn fallback_answer(class: QueryClass) -> String {
    match class {
        QueryClass::ScenarioGeneration => {
            "The scene holds where it stands; the tale resumes once the loremaster returns."
        }
        QueryClass::RuleQuery => {
            "The rulebook is out of reach; rule in the players' favor for now."
        }
        QueryClass::DiceRoll => "The dice cannot be reached; roll at the table.",
        QueryClass::CampaignInfo => "The campaign records are unavailable right now.",
        QueryClass::General => "The table cannot answer that right now; ask again shortly.",
    }
    .to_string()
}
