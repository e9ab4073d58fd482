//! Durable storage for the position map and run statistics.

pub mod file;
pub mod memory;
pub mod redis;

use crate::execution::{Position, RunStats};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use self::redis::RedisSnapshotStore;

/// Everything the bot needs to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub positions: BTreeMap<String, Position>,
    pub stats: RunStats,
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    /// Integrity problems that make the snapshot unsafe to trade from
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (market, pos) in &self.positions {
            if !is_krw_market(market) {
                problems.push(format!("invalid market {}", market));
            }
            if pos.market != *market {
                problems.push(format!("{} is stored under {}", pos.market, market));
            }
            if !(pos.entry_price.is_finite() && pos.entry_price > 0.0) {
                problems.push(format!("{} has entry price {}", market, pos.entry_price));
            }
            if !(pos.quantity.is_finite() && pos.quantity >= 0.0) {
                problems.push(format!("{} has quantity {}", market, pos.quantity));
            }
        }

        if !self.stats.total_profit.is_finite() {
            problems.push(format!("total profit is {}", self.stats.total_profit));
        }
        if self.stats.wins + self.stats.losses != self.stats.trades {
            problems.push(format!(
                "{} wins and {} losses do not add up to {} trades",
                self.stats.wins, self.stats.losses, self.stats.trades
            ));
        }
        problems
    }
}

fn is_krw_market(market: &str) -> bool {
    match market.strip_prefix("KRW-") {
        Some(coin) if !coin.is_empty() => coin
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()),
        _ => false,
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `None` when nothing has been saved yet
    async fn load(&self) -> Result<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}
