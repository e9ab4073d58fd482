use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    /// Buy order submitted, not yet confirmed filled
    Entering,
    /// Coins held, watching exit conditions
    Holding,
    /// Exit order resting or in flight
    Exiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    DeadCross,
    Liquidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    Limit,
    Market,
}

/// The bot's record of an open trade in one market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market: String,
    pub state: PositionState,
    pub entry_price: f64,
    pub quantity: f64,
    pub available: f64,
    pub reserved: f64,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub entry_time: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub high_water_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub exit_kind: Option<ExitKind>,
    #[serde(default)]
    pub recovered: bool,
    #[serde(default)]
    pub error_count: u32,
    /// Quantity already sold by an exit order that was later canceled
    #[serde(default)]
    pub exit_filled_qty: f64,
    #[serde(default)]
    pub exit_filled_value: f64,
}

impl Position {
    /// Position for a just-submitted buy order
    pub fn entering(
        market: &str,
        quantity: f64,
        price: f64,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            market: market.to_string(),
            state: PositionState::Entering,
            entry_price: price,
            quantity,
            available: 0.0,
            reserved: 0.0,
            entry_order_id: Some(order_id.to_string()),
            exit_order_id: None,
            entry_time: now,
            filled_at: None,
            high_water_price: None,
            stop_price: None,
            target_price: None,
            exit_reason: None,
            exit_kind: None,
            recovered: false,
            error_count: 0,
            exit_filled_qty: 0.0,
            exit_filled_value: 0.0,
        }
    }

    /// Filled position holding `available + reserved`
    pub fn holding(
        market: &str,
        entry_price: f64,
        available: f64,
        reserved: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: PositionState::Holding,
            available,
            reserved,
            quantity: available + reserved,
            entry_order_id: None,
            filled_at: Some(now),
            ..Self::entering(market, available + reserved, entry_price, "", now)
        }
    }

    pub fn mark_filled(&mut self, quantity: f64, price: f64, now: DateTime<Utc>) {
        self.state = PositionState::Holding;
        self.entry_price = price;
        self.quantity = quantity;
        self.available = quantity;
        self.reserved = 0.0;
        self.filled_at = Some(now);
    }

    /// Start trailing from `reference`, keeping any higher mark
    pub fn seed_trailing(&mut self, reference: f64, trailing_ratio: f64) {
        let high = self
            .high_water_price
            .map_or(reference, |known| known.max(reference));
        self.high_water_price = Some(high);
        self.stop_price = Some(high * (1.0 - trailing_ratio));
    }

    /// Ratchet the high-water mark when `price` clears it by more than
    /// `noise`. Returns true when the stop moved.
    pub fn update_trailing(&mut self, price: f64, trailing_ratio: f64, noise: f64) -> bool {
        let Some(high) = self.high_water_price else {
            self.seed_trailing(price.max(self.entry_price), trailing_ratio);
            return true;
        };

        if price > high * (1.0 + noise) {
            self.high_water_price = Some(price);
            self.stop_price = Some(price * (1.0 - trailing_ratio));
            true
        } else {
            false
        }
    }

    pub fn loss_limit(&self, loss_ratio: f64) -> f64 {
        self.entry_price * (1.0 - loss_ratio)
    }

    pub fn begin_exit(
        &mut self,
        order_id: String,
        kind: ExitKind,
        reason: ExitReason,
        target: Option<f64>,
        quantity: f64,
    ) {
        self.state = PositionState::Exiting;
        self.exit_order_id = Some(order_id);
        self.exit_kind = Some(kind);
        self.exit_reason = Some(reason);
        self.target_price = target;
        self.reserved = quantity;
        self.available = (self.quantity - quantity).max(0.0);
    }

    /// Back to Holding after the exit order went away
    pub fn abort_exit(&mut self, available: f64, reserved: f64) {
        self.state = PositionState::Holding;
        self.exit_order_id = None;
        self.exit_kind = None;
        self.exit_reason = None;
        self.target_price = None;
        self.available = available;
        self.reserved = reserved;
        self.quantity = available + reserved;
    }

    /// Count a partial fill of an exit order that will not complete
    pub fn record_exit_fill(&mut self, quantity: f64, price: f64) {
        self.exit_filled_qty += quantity;
        self.exit_filled_value += quantity * price;
    }
}

/// Realized results of a run. Only mutated when a position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_profit: f64,
    pub started_at: DateTime<Utc>,
}

impl RunStats {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            trades: 0,
            wins: 0,
            losses: 0,
            total_profit: 0.0,
            started_at,
        }
    }

    pub fn record_close(&mut self, net_profit: f64) {
        self.trades += 1;
        if net_profit > 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.total_profit += net_profit;
    }

    /// Percentage of closed trades that made money
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }
}

/// One completed round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub market: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub net_profit: f64,
    pub reason: Option<ExitReason>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub recovered: bool,
}

/// Read-only view for dashboards and logs
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub runtime_minutes: i64,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub total_profit: f64,
    pub positions: BTreeMap<String, Position>,
    pub current_scan: String,
    pub last_activity: String,
}
