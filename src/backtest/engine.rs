use super::history::HistoricalMarket;
use crate::exchange::{Execution, Ledger, MarketData, SimulatedExchange};
use crate::models::FeeSchedule;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub const DEFAULT_INITIAL_CASH: f64 = 1_000_000.0;

/// Replayed market data plus a simulated venue sharing its clock
pub struct BacktestEngine {
    market: Arc<HistoricalMarket>,
    exchange: Arc<SimulatedExchange>,
}

impl BacktestEngine {
    pub fn new(market: HistoricalMarket, initial_cash: f64, fees: FeeSchedule) -> Self {
        let market = Arc::new(market);
        let exchange = Arc::new(SimulatedExchange::new(
            "backtest",
            market.clone(),
            Ledger::new(initial_cash, fees),
        ));
        Self { market, exchange }
    }

    /// Move the clock to `now` and fill resting asks the new prices reach.
    /// Returns the number of fills.
    pub async fn advance(&self, now: DateTime<Utc>) -> usize {
        self.market.set_time(now);
        let filled = self.exchange.match_resting_orders().await;
        if filled > 0 {
            tracing::debug!("{} resting orders filled at {}", filled, now);
        }
        filled
    }

    pub fn history(&self) -> &Arc<HistoricalMarket> {
        &self.market
    }

    pub fn exchange(&self) -> &Arc<SimulatedExchange> {
        &self.exchange
    }

    pub fn market_data(&self) -> Arc<dyn MarketData> {
        self.market.clone()
    }

    pub fn execution(&self) -> Arc<dyn Execution> {
        self.exchange.clone()
    }
}
