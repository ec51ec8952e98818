//! Loremaster command implementations

use anyhow::{Context, Result};
use std::time::Duration;

use loremaster_bus::DispatchRequest;
use loremaster_config::{self as config, Config};
use loremaster_monitor::AlertReceiver;
use loremaster_orchestrator::Orchestrator;
use loremaster_roster::seat_default_roster;

/// Load config and seat the default roster
async fn assemble_table() -> Result<(Orchestrator, AlertReceiver, Config)> {
    let cfg = Config::load().await.context("failed to load config")?;
    let (table, alerts) = Orchestrator::from_config(&cfg);
    seat_default_roster(table.bus()).await;
    Ok((table, alerts, cfg))
}

/// Initialize the vault
pub async fn init_command() -> Result<()> {
    config::init()
        .await
        .context("failed to establish the vault")?;

    println!("✓ Vault ready at {}", config::data_dir().display());
    println!("  config:    {}", config::config_path().display());
    println!("  snapshots: {}", config::snapshots_dir().display());
    Ok(())
}

/// Parse key=value payload entries; values parse as JSON, falling back
/// to plain strings
fn parse_pairs(pairs: &[String]) -> Result<Vec<(String, serde_json::Value)>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .with_context(|| format!("expected key=value, got '{}'", pair))?;
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

/// Dispatch one request and print the answer
pub async fn ask_command(
    agent: String,
    action: String,
    data: Vec<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let (table, _alerts, cfg) = assemble_table().await?;

    let mut req = DispatchRequest::new(&agent, &action)
        .with_timeout(cfg.default_timeout());
    for (key, value) in parse_pairs(&data)? {
        req = req.with_data(key, value);
    }
    if let Some(seconds) = timeout {
        req = req.with_timeout(Duration::from_secs(seconds));
    }

    let resp = table.dispatch(req).await?;
    if resp.degraded {
        println!("(degraded answer)");
    }
    println!("{}", serde_json::to_string_pretty(&resp.data)?);
    println!("answered in {:.3}s", resp.elapsed.as_secs_f64());
    Ok(())
}

/// Roll dice through the table
pub async fn roll_command(expr: String) -> Result<()> {
    let (table, _alerts, _cfg) = assemble_table().await?;

    let resp = table
        .dispatch(DispatchRequest::new("dice", "roll").with_data("expr", expr.as_str()))
        .await?;

    // a degraded answer has no dice in it
    let total = resp
        .data
        .get("total")
        .cloned()
        .with_context(|| format!("'{}' did not roll", expr))?;
    let rolls = resp.data.get("rolls").cloned().unwrap_or_default();
    let modifier = resp
        .data
        .get("modifier")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    if modifier == 0 {
        println!("{} = {} {}", expr, total, rolls);
    } else {
        println!("{} = {} {} {:+}", expr, total, rolls, modifier);
    }
    Ok(())
}

/// Show the roster and the table's health
pub async fn status_command() -> Result<()> {
    let (table, _alerts, cfg) = assemble_table().await?;

    println!("◆ Table Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("Roster:");
    for descriptor in table.bus().agents().await {
        let mut actions: Vec<&str> = descriptor
            .capabilities
            .iter()
            .map(|s| s.as_str())
            .collect();
        actions.sort_unstable();
        let mode = if descriptor.parallel {
            "parallel"
        } else {
            "serialized"
        };
        println!("  {} - {} ({})", descriptor.id, actions.join(", "), mode);
    }

    let health = table.health().await;
    println!("Health:");
    println!("  samples:    {}", health.samples);
    println!("  p95:        {:?}", health.response_time_p95);
    println!("  error rate: {:.1}%", health.error_rate * 100.0);
    println!("  hit rate:   {:.1}%", health.cache_hit_rate * 100.0);

    println!("Config:");
    println!("  cache capacity:   {}", cfg.cache.capacity);
    println!("  exploration rate: {}", cfg.recovery.exploration_rate);
    println!("  default timeout:  {}s", cfg.table.default_timeout_seconds);
    Ok(())
}
