//! Offline replay: historical candles, a simulated venue on the same clock,
//! and the runner that drives the bot through them.

pub mod engine;
pub mod history;
pub mod metrics;
pub mod runner;
pub mod synthetic;

pub use engine::{BacktestEngine, DEFAULT_INITIAL_CASH};
pub use history::{candle_file_name, parse_timestamp, HistoricalMarket};
pub use metrics::{
    print_comparison, BacktestReport, EquitySample, ReportHeader, ReportSummary, TradeRecord,
};
pub use runner::{BacktestConfig, BacktestRunner, RESULTS_DIR};
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
