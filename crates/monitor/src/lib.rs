//! SCRYING: table health telemetry.
//!
//! Records latency, outcome, and cache behavior for every dispatch, keeps a
//! rolling window of samples, and raises alerts when configured thresholds
//! are crossed. Purely observational: nothing here ever alters a dispatch.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

/// Default rolling window, in samples
pub const DEFAULT_WINDOW: usize = 512;

/// Below this many samples an agent is assumed healthy
const MIN_SAMPLES_FOR_STATUS: usize = 5;

/// Hit-rate alerting waits for a meaningful sample count
const MIN_SAMPLES_FOR_HIT_RATE: usize = 20;

/// How one dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    Failure,
    CacheHit,
}

/// One observation, appended per dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// `agent:action` label
    pub operation: String,
    pub latency: Duration,
    pub outcome: Outcome,
    pub timestamp: DateTime<Local>,
}

/// Alert configuration; thresholds live in config, not code
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// p95 dispatch latency above this raises an alert
    #[serde(default = "default_response_time")]
    pub response_time_seconds: f64,
    /// Failure fraction above this raises an alert
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// Hit fraction below this raises an alert
    #[serde(default = "default_cache_hit_rate")]
    pub cache_hit_rate: f64,
}

fn default_response_time() -> f64 {
    2.0
}

fn default_error_rate() -> f64 {
    0.25
}

fn default_cache_hit_rate() -> f64 {
    0.10
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time_seconds: default_response_time(),
            error_rate: default_error_rate(),
            cache_hit_rate: default_cache_hit_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    SlowResponses,
    HighErrorRate,
    LowCacheHitRate,
}

/// Raised when a threshold is crossed; re-armed once the metric recovers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Local>,
}

/// Per-agent verdict from recent error rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Aggregate view over the rolling window
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub response_time_p95: Duration,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    pub per_agent: HashMap<String, AgentStatus>,
    pub samples: usize,
}

pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

struct MonitorInner {
    window: VecDeque<MetricSample>,
    breached: HashSet<AlertKind>,
}

/// The scrying mirror. Cheap to clone; clones share the window.
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<Mutex<MonitorInner>>,
    thresholds: AlertThresholds,
    window_limit: usize,
    alerts: mpsc::UnboundedSender<Alert>,
}

impl PerformanceMonitor {
    /// Build a monitor plus the channel its alerts arrive on
    pub fn channel(
        thresholds: AlertThresholds,
        window_limit: usize,
    ) -> (Self, AlertReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Mutex::new(MonitorInner {
                    window: VecDeque::new(),
                    breached: HashSet::new(),
                })),
                thresholds,
                window_limit: window_limit.max(1),
                alerts: tx,
            },
            rx,
        )
    }

    pub fn with_defaults() -> (Self, AlertReceiver) {
        Self::channel(AlertThresholds::default(), DEFAULT_WINDOW)
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    /// Append one observation and evaluate the thresholds
    pub async fn record(&self, operation: impl Into<String>, latency: Duration, outcome: Outcome) {
        let sample = MetricSample {
            operation: operation.into(),
            latency,
            outcome,
            timestamp: Local::now(),
        };
        trace!(
            "sample {} {:?} in {:?}",
            sample.operation,
            sample.outcome,
            sample.latency
        );

        let mut inner = self.inner.lock().await;
        inner.window.push_back(sample);
        while inner.window.len() > self.window_limit {
            inner.window.pop_front();
        }
        self.evaluate(&mut inner);
    }

    /// Aggregate health over the rolling window
    pub async fn health(&self) -> HealthReport {
        let inner = self.inner.lock().await;
        Self::report(&inner.window, self.thresholds)
    }

    /// The raw recent samples, oldest first
    pub async fn recent(&self, limit: usize) -> Vec<MetricSample> {
        let inner = self.inner.lock().await;
        inner
            .window
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .rev()
            .collect()
    }

    /// Forget everything; used on session restore
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.window.clear();
        inner.breached.clear();
    }

    fn evaluate(&self, inner: &mut MonitorInner) {
        let report = Self::report(&inner.window, self.thresholds);
        let samples = report.samples;

        let checks = [
            (
                AlertKind::SlowResponses,
                report.response_time_p95.as_secs_f64(),
                self.thresholds.response_time_seconds,
                report.response_time_p95.as_secs_f64() > self.thresholds.response_time_seconds,
            ),
            (
                AlertKind::HighErrorRate,
                report.error_rate,
                self.thresholds.error_rate,
                report.error_rate > self.thresholds.error_rate,
            ),
            (
                AlertKind::LowCacheHitRate,
                report.cache_hit_rate,
                self.thresholds.cache_hit_rate,
                samples >= MIN_SAMPLES_FOR_HIT_RATE
                    && report.cache_hit_rate < self.thresholds.cache_hit_rate,
            ),
        ];

        for (kind, value, threshold, breached) in checks {
            if breached {
                if inner.breached.insert(kind) {
                    let alert = Alert {
                        kind,
                        message: format!(
                            "{:?} crossed: {:.3} against threshold {:.3}",
                            kind, value, threshold
                        ),
                        value,
                        threshold,
                        raised_at: Local::now(),
                    };
                    warn!("{}", alert.message);
                    let _ = self.alerts.send(alert);
                }
            } else {
                inner.breached.remove(&kind);
            }
        }
    }

    fn report(window: &VecDeque<MetricSample>, thresholds: AlertThresholds) -> HealthReport {
        let samples = window.len();
        if samples == 0 {
            return HealthReport {
                response_time_p95: Duration::ZERO,
                error_rate: 0.0,
                cache_hit_rate: 0.0,
                per_agent: HashMap::new(),
                samples: 0,
            };
        }

        let failures = window
            .iter()
            .filter(|s| s.outcome == Outcome::Failure)
            .count();
        let hits = window
            .iter()
            .filter(|s| s.outcome == Outcome::CacheHit)
            .count();

        // latency percentile over actual dispatches; cache hits are
        // near-instant and would only flatter the number
        let mut latencies: Vec<Duration> = window
            .iter()
            .filter(|s| s.outcome != Outcome::CacheHit)
            .map(|s| s.latency)
            .collect();
        latencies.sort();
        let p95 = percentile(&latencies, 0.95);

        let mut per_agent_counts: HashMap<String, (usize, usize)> = HashMap::new();
        for sample in window {
            let agent = sample
                .operation
                .split(':')
                .next()
                .unwrap_or(&sample.operation)
                .to_string();
            let entry = per_agent_counts.entry(agent).or_insert((0, 0));
            entry.0 += 1;
            if sample.outcome == Outcome::Failure {
                entry.1 += 1;
            }
        }

        let per_agent = per_agent_counts
            .into_iter()
            .map(|(agent, (total, failed))| {
                let status = if total < MIN_SAMPLES_FOR_STATUS {
                    AgentStatus::Healthy
                } else {
                    let rate = failed as f64 / total as f64;
                    if rate <= thresholds.error_rate {
                        AgentStatus::Healthy
                    } else if rate <= thresholds.error_rate * 2.0 {
                        AgentStatus::Degraded
                    } else {
                        AgentStatus::Unhealthy
                    }
                };
                (agent, status)
            })
            .collect();

        HealthReport {
            response_time_p95: p95,
            error_rate: failures as f64 / samples as f64,
            cache_hit_rate: hits as f64 / samples as f64,
            per_agent,
            samples,
        }
    }
}

fn percentile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (sorted.len() as f64 * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
