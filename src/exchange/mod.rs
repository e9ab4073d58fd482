//! Market data and order execution seams.
//!
//! The position manager only talks to these traits. Live trading, paper
//! trading and backtests differ only in which implementations are handed in.

pub mod live;
pub mod precision;
pub mod simulated;

use crate::models::{CancelOutcome, Candle, Holding, Order, OrderDetail, OrderState, Orderbook, Ticker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

pub use live::LiveExecution;
pub use precision::{adjust_number, floor_quantity, optimal_sell_price, round_quantity};
pub use simulated::{Ledger, SimulatedExchange};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("api error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("insufficient balance: need {needed:.2}, have {available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },

    #[error("insufficient holding in {market}: need {needed}, have {available}")]
    InsufficientHolding {
        market: String,
        needed: f64,
        available: f64,
    },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("no data for {0}")]
    NoData(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ExchangeError {
    /// Errors worth retrying on the next cycle
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Network(_) => true,
            ExchangeError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::Parse(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Parse(err.to_string())
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Source of candles, tickers and order books
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Up to `count` candles of `unit_minutes`, newest first, ending at
    /// `as_of` (or now).
    async fn get_candles(
        &self,
        market: &str,
        count: usize,
        as_of: Option<DateTime<Utc>>,
        unit_minutes: u32,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn get_ticker(&self, market: &str) -> ExchangeResult<Ticker>;

    async fn get_orderbook(&self, market: &str) -> ExchangeResult<Orderbook>;

    /// KRW markets sorted by 24h traded value, descending
    async fn markets_by_volume(&self) -> ExchangeResult<Vec<String>>;

    /// Current time as seen by this source. Historical sources return their
    /// replay clock.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Order placement and account state
#[async_trait]
pub trait Execution: Send + Sync {
    fn name(&self) -> &str;

    /// Limit buy; returns the order id
    async fn place_buy(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String>;

    /// Limit sell; returns the order id
    async fn place_sell(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String>;

    async fn place_market_sell(&self, market: &str, quantity: f64) -> ExchangeResult<String>;

    async fn cancel(&self, order_id: &str) -> CancelOutcome;

    async fn order_status(&self, order_id: &str) -> ExchangeResult<OrderState>;

    async fn order_detail(&self, order_id: &str) -> ExchangeResult<OrderDetail>;

    async fn holding_of(&self, market: &str) -> ExchangeResult<Holding>;

    /// Non-empty holdings keyed by market
    async fn all_holdings(&self) -> ExchangeResult<HashMap<String, Holding>>;

    async fn all_open_orders(&self) -> ExchangeResult<Vec<Order>>;

    /// Free KRW balance
    async fn balance(&self) -> ExchangeResult<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(ExchangeError::Api {
            status: 429,
            message: "too many".into()
        }
        .is_transient());
        assert!(ExchangeError::Api {
            status: 503,
            message: "down".into()
        }
        .is_transient());
        assert!(!ExchangeError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!ExchangeError::OrderNotFound("x".into()).is_transient());
        assert!(!ExchangeError::Auth("x".into()).is_transient());
    }
}
