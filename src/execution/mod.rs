// Position lifecycle: state machine, bookkeeping and reconciliation
pub mod position;
pub mod position_manager;
pub mod reconciler;

pub use position::{
    ClosedTrade, ExitKind, ExitReason, Position, PositionState, RunStats, StatsSnapshot,
};
pub use position_manager::PositionManager;
pub use reconciler::ReconcileSummary;
