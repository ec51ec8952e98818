//! The default roster seated at a Loremaster table
//!
//! Four built-in agents cover the table's staple requests: dice, rules,
//! campaign memory, and narration. Each one is an ordinary
//! [`loremaster_bus::Agent`]; external agents register the same way.

use loremaster_bus::MessageBus;
use std::sync::Arc;

pub mod campaign;
pub mod dice;
pub mod narrator;
pub mod rules;

pub use campaign::CampaignAgent;
pub use dice::DiceAgent;
pub use narrator::NarratorAgent;
pub use rules::RulesAgent;

/// Seat the default roster at the table
pub async fn seat_default_roster(bus: &MessageBus) {
    bus.register(Arc::new(DiceAgent::new())).await;
    bus.register(Arc::new(RulesAgent::new())).await;
    bus.register(Arc::new(CampaignAgent::new())).await;
    bus.register(Arc::new(NarratorAgent::new())).await;
}
