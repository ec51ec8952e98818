//! Integration tests for loremaster-monitor
//!
//! Tests cover:
//! - Aggregate health over the rolling window
//! - Per-agent status derivation
//! - Alert emission on threshold crossings and re-arming

use loremaster_monitor::{
    AgentStatus, AlertKind, AlertThresholds, Outcome, PerformanceMonitor, DEFAULT_WINDOW,
};
use std::time::Duration;

fn thresholds(rt: f64, err: f64, hit: f64) -> AlertThresholds {
    AlertThresholds {
        response_time_seconds: rt,
        error_rate: err,
        cache_hit_rate: hit,
    }
}

#[tokio::test]
async fn test_empty_monitor_reports_quiet_health() {
    let (monitor, _alerts) = PerformanceMonitor::with_defaults();
    let health = monitor.health().await;

    assert_eq!(health.samples, 0);
    assert_eq!(health.error_rate, 0.0);
    assert_eq!(health.cache_hit_rate, 0.0);
    assert_eq!(health.response_time_p95, Duration::ZERO);
    assert!(health.per_agent.is_empty());
}

#[tokio::test]
async fn test_health_aggregates() {
    let (monitor, _alerts) = PerformanceMonitor::with_defaults();

    for _ in 0..6 {
        monitor
            .record("rules:lookup", Duration::from_millis(40), Outcome::Success)
            .await;
    }
    monitor
        .record("rules:lookup", Duration::from_millis(1), Outcome::CacheHit)
        .await;
    monitor
        .record("narrator:generate", Duration::from_millis(900), Outcome::Failure)
        .await;

    let health = monitor.health().await;
    assert_eq!(health.samples, 8);
    assert!((health.error_rate - 1.0 / 8.0).abs() < 1e-9);
    assert!((health.cache_hit_rate - 1.0 / 8.0).abs() < 1e-9);
    // p95 over the seven real dispatches lands on the slow one
    assert_eq!(health.response_time_p95, Duration::from_millis(900));
}

#[tokio::test]
async fn test_per_agent_status() {
    let (monitor, _alerts) = PerformanceMonitor::channel(thresholds(2.0, 0.25, 0.0), DEFAULT_WINDOW);

    // steady agent: all good
    for _ in 0..10 {
        monitor
            .record("dice:roll", Duration::from_millis(5), Outcome::Success)
            .await;
    }
    // shaky agent: 40% failures -> degraded (over 0.25, under 0.50)
    for i in 0..10 {
        let outcome = if i % 5 < 2 { Outcome::Failure } else { Outcome::Success };
        monitor
            .record("campaign:recall", Duration::from_millis(20), outcome)
            .await;
    }
    // broken agent: all failures -> unhealthy
    for _ in 0..10 {
        monitor
            .record("narrator:generate", Duration::from_millis(50), Outcome::Failure)
            .await;
    }
    // barely seen agent: too few samples to judge
    monitor
        .record("sage:ask", Duration::from_millis(10), Outcome::Failure)
        .await;

    let health = monitor.health().await;
    assert_eq!(health.per_agent.get("dice"), Some(&AgentStatus::Healthy));
    assert_eq!(health.per_agent.get("campaign"), Some(&AgentStatus::Degraded));
    assert_eq!(health.per_agent.get("narrator"), Some(&AgentStatus::Unhealthy));
    assert_eq!(health.per_agent.get("sage"), Some(&AgentStatus::Healthy));
}

#[tokio::test]
async fn test_slow_response_alert_fires_once_until_rearmed() {
    let (monitor, mut alerts) =
        PerformanceMonitor::channel(thresholds(0.05, 1.0, 0.0), DEFAULT_WINDOW);

    for _ in 0..3 {
        monitor
            .record("narrator:generate", Duration::from_millis(200), Outcome::Success)
            .await;
    }

    let alert = alerts.try_recv().expect("crossing should raise an alert");
    assert_eq!(alert.kind, AlertKind::SlowResponses);
    assert!(alert.value > alert.threshold);

    // still breached: no duplicate alert
    assert!(alerts.try_recv().is_err());
}

#[tokio::test]
async fn test_error_rate_alert() {
    let (monitor, mut alerts) =
        PerformanceMonitor::channel(thresholds(10.0, 0.25, 0.0), DEFAULT_WINDOW);

    monitor
        .record("muse:compose", Duration::from_millis(10), Outcome::Success)
        .await;
    monitor
        .record("muse:compose", Duration::from_millis(10), Outcome::Failure)
        .await;

    let alert = alerts.try_recv().expect("half the dispatches failing should alert");
    assert_eq!(alert.kind, AlertKind::HighErrorRate);
}

#[tokio::test]
async fn test_cache_hit_alert_waits_for_samples() {
    let (monitor, mut alerts) =
        PerformanceMonitor::channel(thresholds(10.0, 1.0, 0.5), DEFAULT_WINDOW);

    // plenty of misses, but below the minimum sample count: stay quiet
    for _ in 0..10 {
        monitor
            .record("rules:lookup", Duration::from_millis(10), Outcome::Success)
            .await;
    }
    assert!(alerts.try_recv().is_err());

    for _ in 0..10 {
        monitor
            .record("rules:lookup", Duration::from_millis(10), Outcome::Success)
            .await;
    }
    let alert = alerts.try_recv().expect("enough samples now");
    assert_eq!(alert.kind, AlertKind::LowCacheHitRate);
}

#[tokio::test]
async fn test_window_is_bounded() {
    let (monitor, _alerts) = PerformanceMonitor::channel(thresholds(10.0, 1.0, 0.0), 16);

    for _ in 0..100 {
        monitor
            .record("dice:roll", Duration::from_millis(1), Outcome::Success)
            .await;
    }

    let health = monitor.health().await;
    assert_eq!(health.samples, 16);
    assert_eq!(monitor.recent(1000).await.len(), 16);
}

#[tokio::test]
async fn test_reset_clears_window_and_armed_alerts() {
    let (monitor, mut alerts) =
        PerformanceMonitor::channel(thresholds(0.05, 1.0, 0.0), DEFAULT_WINDOW);

    monitor
        .record("narrator:generate", Duration::from_millis(200), Outcome::Success)
        .await;
    let _ = alerts.try_recv();

    monitor.reset().await;
    assert_eq!(monitor.health().await.samples, 0);

    // same breach alerts again after a reset
    monitor
        .record("narrator:generate", Duration::from_millis(200), Outcome::Success)
        .await;
    assert!(alerts.try_recv().is_ok());
}
