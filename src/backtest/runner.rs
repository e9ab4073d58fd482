use super::engine::{BacktestEngine, DEFAULT_INITIAL_CASH};
use super::history::HistoricalMarket;
use super::metrics::{BacktestReport, EquitySample, ReportHeader};
use crate::config::BotConfig;
use crate::execution::PositionManager;
use crate::persistence::MemoryStore;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const RESULTS_DIR: &str = "backtest_results";

/// Replay window and starting conditions
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Candle unit and clock step, in minutes
    pub unit: u32,
    pub initial_cash: f64,
    /// Restrict the replay to these markets; empty means all loaded
    pub markets: Vec<String>,
}

impl BacktestConfig {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, unit: u32) -> Self {
        Self {
            start,
            end,
            unit,
            initial_cash: DEFAULT_INITIAL_CASH,
            markets: Vec::new(),
        }
    }
}

/// Drives a `PositionManager` over historical candles
pub struct BacktestRunner {
    bot: BotConfig,
    config: BacktestConfig,
}

impl BacktestRunner {
    pub fn new(mut bot: BotConfig, config: BacktestConfig) -> Self {
        bot.candle_unit = config.unit;
        // the simulated venue answers cancels immediately
        bot.cancel_backoff_ms = 0;
        Self { bot, config }
    }

    /// Replay `market` from start to end and liquidate what is left.
    ///
    /// Each step advances the clock by one candle, fills resting asks, then
    /// runs one bot cycle.
    pub async fn run(&self, mut market: HistoricalMarket) -> Result<BacktestReport> {
        let BacktestConfig { start, end, unit, initial_cash, .. } = self.config.clone();
        if unit == 0 {
            return Err("candle unit must be positive".into());
        }
        if start >= end {
            return Err(format!("backtest start {} is not before end {}", start, end).into());
        }
        if !self.config.markets.is_empty() {
            market.retain_markets(&self.config.markets);
        }
        let markets = market.markets();
        if markets.is_empty() {
            return Err("no market data to replay".into());
        }

        tracing::info!(
            "🚀 Starting backtest: {} → {}, {} markets, {}m candles, {:.0} KRW",
            start,
            end,
            markets.len(),
            unit,
            initial_cash
        );

        let engine = BacktestEngine::new(market, initial_cash, self.bot.fees());
        engine.advance(start).await;

        let mut manager = PositionManager::new(
            self.bot.clone(),
            engine.market_data(),
            engine.execution(),
            Arc::new(MemoryStore::new()),
        );

        let step = Duration::minutes(unit as i64);
        let steps_per_day = (24 * 60 / unit as usize).max(1);
        let mut equity_curve = Vec::new();
        let mut now = start;
        let mut steps = 0usize;

        while now <= end {
            engine.advance(now).await;
            manager.run_cycle().await;

            if steps % steps_per_day == 0 {
                equity_curve.push(EquitySample {
                    time: now,
                    cash: engine.exchange().cash().await,
                    equity: engine.exchange().equity().await,
                });
            }

            steps += 1;
            now += step;
        }

        manager.liquidate().await;

        let final_cash = engine.exchange().cash().await;
        let final_equity = engine.exchange().equity().await;
        let stats = manager.run_stats();
        tracing::info!(
            "🏁 Backtest finished after {} steps: {} trades, {:.1}% win rate, {:+.0} KRW",
            steps,
            stats.trades,
            stats.win_rate(),
            stats.total_profit
        );
        if !manager.positions().is_empty() {
            tracing::warn!("{} positions still open after liquidation", manager.positions().len());
        }

        let header = ReportHeader {
            start,
            end,
            unit_minutes: unit,
            markets,
            initial_cash,
        };
        Ok(BacktestReport::new(
            header,
            final_cash,
            final_equity,
            manager.closed_trades(),
            equity_curve,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::synthetic::{MarketScenario, SyntheticDataGenerator};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_empty_window() {
        let runner = BacktestRunner::new(BotConfig::default(), BacktestConfig::new(start(), start(), 1));
        assert!(runner.run(HistoricalMarket::new(start())).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_missing_markets() {
        let mut config = BacktestConfig::new(start(), start() + Duration::hours(1), 1);
        config.markets = vec!["KRW-DOGE".into()];

        let mut market = HistoricalMarket::new(start());
        let candles = SyntheticDataGenerator::new(1).generate("KRW-BTC", MarketScenario::Sideways, start(), 60, 1);
        market.insert("KRW-BTC", candles);

        let runner = BacktestRunner::new(BotConfig::default(), config);
        assert!(runner.run(market).await.is_err());
    }

    #[tokio::test]
    async fn test_quiet_market_trades_nothing() {
        let mut market = HistoricalMarket::new(start());
        let candles = SyntheticDataGenerator::new(5).generate("KRW-BTC", MarketScenario::Sideways, start(), 300, 1);
        market.insert("KRW-BTC", candles);

        let config = BacktestConfig::new(start(), start() + Duration::minutes(299), 1);
        let report = BacktestRunner::new(BotConfig::default(), config).run(market).await.unwrap();

        assert_eq!(report.trades, 0);
        assert_eq!(report.final_cash, DEFAULT_INITIAL_CASH);
        assert_eq!(report.equity_curve.len(), 1);
    }
}
