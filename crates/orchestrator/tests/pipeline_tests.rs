//! End-to-end dispatch pipeline: cache, recovery, and telemetry

use async_trait::async_trait;
use loremaster_bus::{
    Agent, AgentDescriptor, AgentFault, DispatchRequest, JoinPolicy, MessageBus,
};
use loremaster_cache::{CachePriority, ClassPolicy, PolicyTable, ResponseCache};
use loremaster_classifier::{QueryClass, QueryClassifier};
use loremaster_monitor::PerformanceMonitor;
use loremaster_orchestrator::{Orchestrator, OrchestratorError};
use loremaster_recovery::{ErrorKind, Strategy, StrategyBook};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts invocations and fails the first `failures` calls
struct FlakyAgent {
    id: &'static str,
    action: &'static str,
    calls: AtomicUsize,
    failures: usize,
    fault: AgentFault,
}

impl FlakyAgent {
    fn reliable(id: &'static str, action: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            action,
            calls: AtomicUsize::new(0),
            failures: 0,
            fault: AgentFault::Other("unused".into()),
        })
    }

    fn failing(id: &'static str, action: &'static str, failures: usize, fault: AgentFault) -> Arc<Self> {
        Arc::new(Self {
            id,
            action,
            calls: AtomicUsize::new(0),
            failures,
            fault,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new(self.id, [self.action]).parallel()
    }

    async fn handle(
        &self,
        _action: &str,
        _data: &HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>, AgentFault> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.fault.clone());
        }
        let mut out = HashMap::new();
        out.insert("answer".to_string(), json!(format!("answer #{}", call)));
        Ok(out)
    }
}

/// Answers quickly until flipped slow
struct MoodyAgent {
    slow: AtomicBool,
}

impl MoodyAgent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slow: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Agent for MoodyAgent {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new("bard", ["generate"]).parallel()
    }

    async fn handle(
        &self,
        _action: &str,
        _data: &HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>, AgentFault> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        let mut out = HashMap::new();
        out.insert("scene".to_string(), json!("the sunken crypt"));
        Ok(out)
    }
}

/// Exploration off so exploitation and table order decide every pick
fn deterministic_book() -> StrategyBook {
    StrategyBook::new(0.0, 64)
}

fn table(bus: MessageBus, policy: PolicyTable, book: StrategyBook) -> Orchestrator {
    let (monitor, _alerts) = PerformanceMonitor::with_defaults();
    Orchestrator::with_parts(
        bus,
        QueryClassifier::default(),
        ResponseCache::new(policy, 64),
        book,
        monitor,
        2,
    )
}

#[tokio::test]
async fn test_repeat_question_is_answered_from_cache() {
    let bus = MessageBus::new();
    let sage = FlakyAgent::reliable("sage", "consult");
    bus.register(sage.clone()).await;

    let lore = table(bus, PolicyTable::default(), deterministic_book());
    let ask = || DispatchRequest::new("sage", "consult").with_data("q", "the weather");

    let first = lore.dispatch(ask()).await.expect("should answer");
    let second = lore.dispatch(ask()).await.expect("should answer");

    assert_eq!(sage.calls(), 1);
    assert_eq!(first.data, second.data);

    let health = lore.health().await;
    assert!(health.cache_hit_rate > 0.0);
}

#[tokio::test]
async fn test_different_payloads_are_not_conflated() {
    let bus = MessageBus::new();
    let sage = FlakyAgent::reliable("sage", "consult");
    bus.register(sage.clone()).await;

    let lore = table(bus, PolicyTable::default(), deterministic_book());
    lore.dispatch(DispatchRequest::new("sage", "consult").with_data("q", "the weather"))
        .await
        .expect("should answer");
    lore.dispatch(DispatchRequest::new("sage", "consult").with_data("q", "the tides"))
        .await
        .expect("should answer");

    assert_eq!(sage.calls(), 2);
}

#[tokio::test]
async fn test_one_failure_recovers_by_retrying() {
    let bus = MessageBus::new();
    let oracle = FlakyAgent::failing(
        "oracle",
        "answer",
        1,
        AgentFault::Generation("the vision clouded".into()),
    );
    bus.register(oracle.clone()).await;

    let lore = table(bus, PolicyTable::default(), deterministic_book());
    let resp = lore
        .dispatch(DispatchRequest::new("oracle", "answer").with_data("q", "how does grappling work"))
        .await
        .expect("should recover");

    assert!(resp.success);
    assert!(resp.degraded);
    assert_eq!(oracle.calls(), 2);

    let records = lore.recent_recoveries().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_kind, ErrorKind::GenerationFailure);
    assert_eq!(records[0].strategy, Strategy::Retry);
    assert!(records[0].succeeded);
}

#[tokio::test]
async fn test_timed_out_agent_is_served_stale() {
    let bus = MessageBus::new();
    let bard = MoodyAgent::new();
    bus.register(bard.clone()).await;

    // scenarios expire immediately so the second ask has to re-dispatch
    let mut policy = PolicyTable::empty();
    policy.set(
        QueryClass::ScenarioGeneration,
        ClassPolicy::new(0, CachePriority::High),
    );

    let lore = table(bus, policy, deterministic_book());
    let ask = |timeout| {
        DispatchRequest::new("bard", "generate")
            .with_data("prompt", "the sunken crypt")
            .with_timeout(timeout)
    };

    let fresh = lore.dispatch(ask(Duration::from_secs(5))).await.expect("should answer");
    assert!(!fresh.degraded);

    tokio::time::sleep(Duration::from_millis(20)).await;
    bard.slow.store(true, Ordering::SeqCst);

    let stale = lore.dispatch(ask(Duration::from_millis(100))).await.expect("should serve stale");
    assert!(stale.degraded);
    assert_eq!(stale.data, fresh.data);

    let strategies: Vec<Strategy> = lore
        .recent_recoveries()
        .await
        .into_iter()
        .map(|r| r.strategy)
        .collect();
    assert!(strategies.contains(&Strategy::ServeStale));
}

#[tokio::test]
async fn test_dice_rolls_always_reach_the_agent() {
    let bus = MessageBus::new();
    loremaster_roster::seat_default_roster(&bus).await;

    let lore = table(bus, PolicyTable::default(), deterministic_book());
    let ask = || DispatchRequest::new("dice", "roll").with_data("expr", "1d20");

    lore.dispatch(ask()).await.expect("should roll");
    lore.dispatch(ask()).await.expect("should roll");

    // nondeterministic answers are never remembered
    assert!(lore.cache().is_empty().await);
    assert_eq!(lore.health().await.cache_hit_rate, 0.0);
}

#[tokio::test]
async fn test_timeout_with_a_proven_fallback_history() {
    let bus = MessageBus::new();
    let bard = MoodyAgent::new();
    bard.slow.store(true, Ordering::SeqCst);
    bus.register(bard).await;

    let book = deterministic_book();
    // the book already knows fallback is the only thing that works here
    for _ in 0..5 {
        book.record(ErrorKind::Timeout, Strategy::Fallback, true).await;
        book.record(ErrorKind::Timeout, Strategy::RetryTrimmedContext, false)
            .await;
        book.record(ErrorKind::Timeout, Strategy::ServeStale, false).await;
    }

    let lore = table(bus, PolicyTable::empty(), book);
    let resp = lore
        .dispatch(
            DispatchRequest::new("bard", "generate")
                .with_data("prompt", "the sunken crypt")
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .expect("fallback should answer");

    assert!(resp.success);
    assert!(resp.degraded);
    assert_eq!(resp.data["fallback"], json!(true));

    let last = lore.recent_recoveries().await.pop().expect("one attempt");
    assert_eq!(last.strategy, Strategy::Fallback);
    assert!(last.succeeded);
}

#[tokio::test]
async fn test_downed_agent_falls_back_to_canned_text() {
    let bus = MessageBus::new();
    bus.register(FlakyAgent::failing(
        "courier",
        "deliver",
        usize::MAX,
        AgentFault::Communication("no answer from the tower".into()),
    ))
    .await;

    let lore = table(bus, PolicyTable::default(), deterministic_book());
    let resp = lore
        .dispatch(DispatchRequest::new("courier", "deliver").with_data("q", "any news"))
        .await
        .expect("fallback always answers");

    assert!(resp.degraded);
    assert_eq!(resp.data["fallback"], json!(true));
    assert!(resp.data["text"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn test_unknown_agent_is_not_recovered() {
    let lore = table(MessageBus::new(), PolicyTable::default(), deterministic_book());
    let err = lore
        .dispatch(DispatchRequest::new("ghost", "haunt"))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Dispatch(_)));
    assert!(lore.recent_recoveries().await.is_empty());
}

#[tokio::test]
async fn test_exhausted_book_reports_unrecovered() {
    let bus = MessageBus::new();
    bus.register(FlakyAgent::failing(
        "oracle",
        "answer",
        usize::MAX,
        AgentFault::Generation("the vision never clears".into()),
    ))
    .await;

    // a book with retry as the only option for generation failures
    let mut candidates = HashMap::new();
    candidates.insert(ErrorKind::GenerationFailure, vec![Strategy::Retry]);
    let book = StrategyBook::with_candidates(candidates, 0.0, 64);

    let lore = table(bus, PolicyTable::default(), book);
    let err = lore
        .dispatch(DispatchRequest::new("oracle", "answer").with_data("q", "anything"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Unrecovered {
            kind: ErrorKind::GenerationFailure,
            ..
        }
    ));

    let records = lore.recent_recoveries().await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].succeeded);
}

#[tokio::test]
async fn test_spent_budget_leaves_no_mark_in_the_ledger() {
    let bus = MessageBus::new();
    let oracle = FlakyAgent::failing(
        "oracle",
        "answer",
        usize::MAX,
        AgentFault::Generation("the vision never clears".into()),
    );
    bus.register(oracle.clone()).await;

    // two redispatch strategies, budget for one
    let mut candidates = HashMap::new();
    candidates.insert(
        ErrorKind::GenerationFailure,
        vec![Strategy::Retry, Strategy::RetryTrimmedContext],
    );
    let book = StrategyBook::with_candidates(candidates, 0.0, 64);

    let (monitor, _alerts) = PerformanceMonitor::with_defaults();
    let lore = Orchestrator::with_parts(
        bus,
        QueryClassifier::default(),
        ResponseCache::new(PolicyTable::default(), 64),
        book,
        monitor,
        1,
    );

    let err = lore
        .dispatch(DispatchRequest::new("oracle", "answer").with_data("q", "anything"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Unrecovered { .. }));

    // the retry ran and lost; the trimmed retry never executed, so it
    // carries no attempt
    assert_eq!(oracle.calls(), 2);
    let records = lore.recent_recoveries().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].strategy, Strategy::Retry);
    assert!(!records[0].succeeded);
}

#[tokio::test]
async fn test_fan_out_through_the_table() {
    let bus = MessageBus::new();
    bus.register(FlakyAgent::reliable("sage", "consult")).await;
    bus.register(FlakyAgent::reliable("scribe", "copy")).await;

    let lore = table(bus, PolicyTable::empty(), deterministic_book());
    let slots = lore
        .fan_out(
            vec![
                DispatchRequest::new("sage", "consult"),
                DispatchRequest::new("scribe", "copy"),
            ],
            Duration::from_secs(2),
            JoinPolicy::Partial,
        )
        .await
        .expect("partial join always returns slots");

    assert_eq!(slots.len(), 2);
    assert!(slots.iter().all(|s| s.is_ok()));
    assert_eq!(lore.health().await.samples, 2);
}

#[tokio::test]
async fn test_snapshot_lists_the_seated_agents() {
    let bus = MessageBus::new();
    loremaster_roster::seat_default_roster(&bus).await;

    let lore = table(bus, PolicyTable::default(), deterministic_book());
    let snapshot = lore.snapshot("friday-game").await;

    assert_eq!(
        snapshot.get("agents"),
        Some(&json!(["campaign", "dice", "narrator", "rules"]))
    );
}

#[tokio::test]
async fn test_restore_forgets_cache_and_ledgers() {
    let bus = MessageBus::new();
    let sage = FlakyAgent::reliable("sage", "consult");
    bus.register(sage.clone()).await;

    let lore = table(bus, PolicyTable::default(), deterministic_book());
    let ask = || DispatchRequest::new("sage", "consult").with_data("q", "the weather");

    lore.dispatch(ask()).await.expect("should answer");
    let snapshot = lore.snapshot("friday-game").await;
    lore.restore(&snapshot).await;

    lore.dispatch(ask()).await.expect("should answer");
    assert_eq!(sage.calls(), 2);
    assert_eq!(lore.health().await.samples, 1);
}
