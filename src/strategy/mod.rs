// Entry and exit signals
pub mod signals;

pub use signals::{Cross, CrossKind, CrossLatch, SignalEvaluator};
