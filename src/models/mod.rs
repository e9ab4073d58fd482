use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quote currency every traded market is priced in.
pub const QUOTE_CURRENCY: &str = "KRW";

/// Quantities at or below this are treated as empty.
pub const DUST_QUANTITY: f64 = 1e-8;

/// One candle bucket as returned by the exchange.
///
/// `value` is the accumulated traded value in KRW over the bucket and is what
/// the volume-surge signal looks at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub market: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub value: f64,
}

/// Ordering of a candle slice handed to the signal evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker {
    pub market: String,
    pub trade_price: f64,
    /// Traded value over the trailing 24 hours, in KRW
    pub acc_trade_price_24h: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderbookUnit {
    pub ask_price: f64,
    pub bid_price: f64,
    pub ask_size: f64,
    pub bid_size: f64,
}

/// Order book levels, best level first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Orderbook {
    pub market: String,
    pub units: Vec<OrderbookUnit>,
}

impl Orderbook {
    pub fn best_ask(&self) -> Option<f64> {
        self.units
            .first()
            .map(|u| u.ask_price)
            .filter(|p| p.is_finite() && *p > 0.0)
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.units
            .first()
            .map(|u| u.bid_price)
            .filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Filled,
    Canceled,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderState::Pending => "pending",
            OrderState::Filled => "filled",
            OrderState::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

/// An order as the execution venue sees it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub market: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price; `None` for market orders
    pub price: Option<f64>,
    pub volume: f64,
    pub executed_volume: f64,
    /// Average execution price, once anything executed
    pub executed_price: Option<f64>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn detail(&self) -> OrderDetail {
        OrderDetail {
            id: self.id.clone(),
            state: self.state,
            executed_qty: self.executed_volume,
            executed_price: self.executed_price,
        }
    }
}

/// Fill information for a single order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDetail {
    pub id: String,
    pub state: OrderState,
    pub executed_qty: f64,
    pub executed_price: Option<f64>,
}

impl OrderDetail {
    pub fn has_fill(&self) -> bool {
        self.executed_qty > DUST_QUANTITY
    }
}

/// Result of a cancel request. Failure is a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

impl CancelOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Exchange-side balance for one market's base currency
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Holding {
    pub market: String,
    pub available: f64,
    /// Locked by resting sell orders
    pub reserved: f64,
    pub avg_buy_price: f64,
}

impl Holding {
    pub fn empty(market: &str) -> Self {
        Self {
            market: market.to_string(),
            ..Default::default()
        }
    }

    pub fn total(&self) -> f64 {
        self.available + self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.total() <= DUST_QUANTITY
    }
}

/// Trading fees as fractions of the traded value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub buy: f64,
    pub sell: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            buy: 0.0004,
            sell: 0.0004,
        }
    }
}

impl FeeSchedule {
    /// Net profit of a round trip after both fees.
    pub fn net_profit(&self, buy_price: f64, sell_price: f64, quantity: f64) -> f64 {
        calculate_net_profit(buy_price, sell_price, quantity, self)
    }
}

/// `sell * qty * (1 - sell_fee) - buy * qty * (1 + buy_fee)`
pub fn calculate_net_profit(
    buy_price: f64,
    sell_price: f64,
    quantity: f64,
    fees: &FeeSchedule,
) -> f64 {
    let proceeds = sell_price * quantity * (1.0 - fees.sell);
    let cost = buy_price * quantity * (1.0 + fees.buy);
    proceeds - cost
}

/// `KRW-BTC` -> `BTC`
pub fn currency_of(market: &str) -> &str {
    market
        .split_once('-')
        .map(|(_, currency)| currency)
        .unwrap_or(market)
}

/// `BTC` -> `KRW-BTC`
pub fn market_for(currency: &str) -> String {
    format!("{}-{}", QUOTE_CURRENCY, currency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_profit_includes_both_fees() {
        let net = calculate_net_profit(100.0, 110.0, 1.0, &FeeSchedule::default());
        assert!((net - 9.916).abs() < 1e-9);
    }

    #[test]
    fn test_net_profit_loss() {
        let fees = FeeSchedule::default();
        assert!(fees.net_profit(100.0, 100.0, 1.0) < 0.0);
    }

    #[test]
    fn test_market_naming() {
        assert_eq!(currency_of("KRW-BTC"), "BTC");
        assert_eq!(market_for("ETH"), "KRW-ETH");
        assert_eq!(currency_of("BTC"), "BTC");
    }

    #[test]
    fn test_holding_total() {
        let holding = Holding {
            market: "KRW-BTC".into(),
            available: 1.5,
            reserved: 0.5,
            avg_buy_price: 100.0,
        };
        assert_eq!(holding.total(), 2.0);
        assert!(!holding.is_empty());
        assert!(Holding::empty("KRW-BTC").is_empty());
    }

    #[test]
    fn test_orderbook_best_levels() {
        let book = Orderbook {
            market: "KRW-BTC".into(),
            units: vec![OrderbookUnit {
                ask_price: 101.0,
                bid_price: 99.0,
                ask_size: 1.0,
                bid_size: 1.0,
            }],
        };
        assert_eq!(book.best_ask(), Some(101.0));
        assert_eq!(book.best_bid(), Some(99.0));

        let empty = Orderbook {
            market: "KRW-BTC".into(),
            units: vec![],
        };
        assert!(empty.best_ask().is_none());
    }
}
