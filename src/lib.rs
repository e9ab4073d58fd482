// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod strategy;

// Re-export commonly used types
pub use config::{BotConfig, Credentials, ExitPolicy};
pub use exchange::{ExchangeError, ExchangeResult, Execution, MarketData};
pub use execution::{Position, PositionManager, PositionState};
pub use models::*;
pub use strategy::SignalEvaluator;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
