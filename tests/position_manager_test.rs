mod common;

use async_trait::async_trait;
use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use surgebot::config::{BotConfig, ExitPolicy};
use surgebot::exchange::{ExchangeError, ExchangeResult, Execution};
use surgebot::execution::{ExitReason, Position, PositionManager, PositionState, RunStats};
use surgebot::models::{CancelOutcome, Holding, Order, OrderDetail, OrderSide, OrderState};
use surgebot::persistence::{MemoryStore, Snapshot};

/// A venue that is down
struct UnreachableExchange;

#[async_trait]
impl Execution for UnreachableExchange {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn place_buy(&self, _: &str, _: f64, _: f64) -> ExchangeResult<String> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn place_sell(&self, _: &str, _: f64, _: f64) -> ExchangeResult<String> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn place_market_sell(&self, _: &str, _: f64) -> ExchangeResult<String> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn cancel(&self, _: &str) -> CancelOutcome {
        CancelOutcome::failed("connection refused")
    }

    async fn order_status(&self, _: &str) -> ExchangeResult<OrderState> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn order_detail(&self, _: &str) -> ExchangeResult<OrderDetail> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn holding_of(&self, _: &str) -> ExchangeResult<Holding> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn all_holdings(&self) -> ExchangeResult<HashMap<String, Holding>> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn all_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        Err(ExchangeError::Network("connection refused".into()))
    }

    async fn balance(&self) -> ExchangeResult<f64> {
        Err(ExchangeError::Network("connection refused".into()))
    }
}

#[tokio::test]
async fn test_stale_buy_is_canceled_after_timeout() {
    let engine = engine(vec![(MARKET, quiet_path(MARKET, 10, 100.0))]);
    engine
        .exchange()
        .with_ledger(|ledger| {
            ledger.seed_order(pending_order("bid-1", MARKET, OrderSide::Bid, 100.0, 100.0))
        })
        .await;
    let entering = Position::entering(MARKET, 100.0, 100.0, "bid-1", t0());
    let mut manager = restored_manager(BotConfig::default(), &engine, vec![entering]).await;

    // one minute in: still waiting
    engine.advance(at(1)).await;
    manager.check_positions().await;
    assert_eq!(manager.positions()[MARKET].state, PositionState::Entering);

    // past the 120 s timeout
    engine.advance(at(3)).await;
    manager.check_positions().await;
    assert!(manager.positions().is_empty());
    assert_eq!(
        engine.execution().order_status("bid-1").await.unwrap(),
        OrderState::Canceled
    );
    assert_eq!(manager.run_stats().trades, 0);
}

#[tokio::test]
async fn test_restored_buy_fill_is_adopted() {
    let engine = engine(vec![(MARKET, quiet_path(MARKET, 10, 100.0))]);
    let mut filled = pending_order("bid-1", MARKET, OrderSide::Bid, 100.0, 100.0);
    filled.state = OrderState::Filled;
    filled.executed_volume = 100.0;
    filled.executed_price = Some(99.5);
    engine
        .exchange()
        .with_ledger(|ledger| {
            ledger.seed_order(filled);
            ledger.seed_holding(MARKET, 100.0, 0.0, 99.5);
        })
        .await;

    let entering = Position::entering(MARKET, 100.0, 100.0, "bid-1", t0());
    let mut manager = restored_manager(BotConfig::default(), &engine, vec![entering]).await;
    engine.advance(at(3)).await;
    manager.check_positions().await;

    let pos = &manager.positions()[MARKET];
    assert_eq!(pos.state, PositionState::Holding);
    assert_eq!(pos.entry_price, 99.5);
    assert_eq!(pos.quantity, 100.0);
}

#[tokio::test]
async fn test_position_dropped_after_repeated_failures() {
    let engine = engine(vec![(MARKET, quiet_path(MARKET, 10, 100.0))]);
    engine.advance(at(1)).await;

    let entering = Position::entering(MARKET, 100.0, 100.0, "bid-1", t0());
    let mut positions = std::collections::BTreeMap::new();
    positions.insert(MARKET.to_string(), entering);
    let store = Arc::new(MemoryStore::with_snapshot(surgebot::persistence::Snapshot {
        positions,
        stats: surgebot::execution::RunStats::new(t0()),
        saved_at: t0(),
    }));

    let mut manager = PositionManager::restore(
        BotConfig::default(),
        engine.market_data(),
        Arc::new(UnreachableExchange),
        store.clone(),
    )
    .await;

    manager.check_positions().await;
    assert_eq!(manager.positions()[MARKET].error_count, 1);
    manager.check_positions().await;
    assert_eq!(manager.positions()[MARKET].error_count, 2);
    manager.check_positions().await;
    assert!(manager.positions().is_empty());

    // the drop was persisted
    assert!(store.latest().unwrap().positions.is_empty());
    // a failing venue never ends the cycle loop
    assert!(!manager.run_cycle().await);
}

#[tokio::test]
async fn test_stop_loss_replaces_resting_take_profit() {
    // 110.11 entry; 105 is below the 1.5% loss limit while the ask rests at 113
    let path = then(surge_path(MARKET), &[111.0, 111.0, 105.0]);
    let engine = engine(vec![(MARKET, path)]);
    engine.advance(at(SIGNAL_INDEX)).await;

    let mut config = BotConfig::default();
    config.exit_policy = ExitPolicy::TakeProfit;
    config.cancel_backoff_ms = 0;
    let mut manager = manager(config, &engine);

    assert!(manager.run_cycle().await);
    engine.advance(at(SIGNAL_INDEX + 1)).await;
    manager.check_positions().await;
    assert_eq!(manager.positions()[MARKET].state, PositionState::Holding);

    engine.advance(at(SIGNAL_INDEX + 2)).await;
    manager.check_positions().await;
    let exiting = &manager.positions()[MARKET];
    assert_eq!(exiting.state, PositionState::Exiting);
    assert_eq!(exiting.target_price, Some(113.0));

    engine.advance(at(SIGNAL_INDEX + 3)).await;
    manager.check_positions().await;
    assert!(manager.positions().is_empty());

    let trade = &manager.closed_trades()[0];
    assert_eq!(trade.reason, Some(ExitReason::StopLoss));
    assert_close(trade.exit_price, 105.0);
    assert_eq!(manager.run_stats().losses, 1);
    assert!(engine.execution().all_open_orders().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dead_cross_exit() {
    // the 5-candle average sinks under the 20-candle one four candles later
    let path = then(surge_path(MARKET), &[95.0, 95.0, 95.0, 95.0, 95.0]);
    let last = path.len() - 1;
    let engine = engine(vec![(MARKET, path)]);
    engine.advance(at(SIGNAL_INDEX)).await;

    let mut config = BotConfig::default();
    config.exit_policy = ExitPolicy::DeadCross;
    config.loss_ratio = 0.5;
    let mut manager = manager(config, &engine);
    assert!(manager.run_cycle().await);

    for index in SIGNAL_INDEX + 1..=last {
        engine.advance(at(index)).await;
        manager.check_positions().await;
        if manager.positions().is_empty() {
            break;
        }
    }

    assert!(manager.positions().is_empty());
    let trade = &manager.closed_trades()[0];
    assert_eq!(trade.reason, Some(ExitReason::DeadCross));
    assert_eq!(trade.exit_time, at(last));
    assert_close(trade.exit_price, 95.0);
}

#[tokio::test]
async fn test_stats_snapshot() {
    let engine = engine(vec![(MARKET, surge_path(MARKET))]);
    engine.advance(at(SIGNAL_INDEX)).await;
    let mut manager = manager(BotConfig::default(), &engine);
    manager.run_cycle().await;

    let stats = manager.stats();
    assert_eq!(stats.positions.len(), 1);
    assert_eq!(stats.trades, 0);
    assert_eq!(stats.runtime_minutes, 0);
    assert!(stats.last_activity.contains(MARKET));
}

#[tokio::test]
async fn test_failed_dead_cross_sell_is_retried() {
    let path = then(surge_path(MARKET), &[95.0, 95.0, 95.0, 95.0, 95.0]);
    let last = path.len() - 1;
    let engine = engine(vec![(MARKET, path)]);
    engine.advance(at(SIGNAL_INDEX)).await;

    let mut config = BotConfig::default();
    config.exit_policy = ExitPolicy::DeadCross;
    config.loss_ratio = 0.5;
    let scripted = Arc::new(ScriptedExchange::new(&engine).fail_market_sells(1));
    let mut manager = manager_on(config, &engine, scripted.clone(), Arc::new(MemoryStore::new()));
    assert!(manager.run_cycle().await);

    for index in SIGNAL_INDEX + 1..=last {
        engine.advance(at(index)).await;
        // two checks per candle: a rejected sell must not use up the cross
        manager.check_positions().await;
        manager.check_positions().await;
        if manager.positions().is_empty() {
            break;
        }
    }

    assert!(manager.positions().is_empty());
    let trade = &manager.closed_trades()[0];
    assert_eq!(trade.reason, Some(ExitReason::DeadCross));
    assert_eq!(trade.exit_time, at(last));
    assert_eq!(scripted.sells_placed(), 1);
}

#[tokio::test]
async fn test_rejected_buy_is_retried_on_the_same_signal() {
    let engine = engine(vec![(MARKET, surge_path(MARKET))]);
    engine.advance(at(SIGNAL_INDEX)).await;

    let scripted = Arc::new(ScriptedExchange::new(&engine).fail_buys(1));
    let mut manager = manager_on(
        BotConfig::default(),
        &engine,
        scripted,
        Arc::new(MemoryStore::new()),
    );

    assert!(manager.run_cycle().await);
    assert!(manager.positions().is_empty());

    assert!(manager.run_cycle().await);
    assert!(manager.positions().contains_key(MARKET));

    // once bought, the cross is spent
    assert!(!manager.check_buy_signal(MARKET).await);
}

#[tokio::test]
async fn test_stop_out_finds_take_profit_already_filled() {
    let path = then(surge_path(MARKET), &[111.0, 111.0, 105.0]);
    let engine = engine(vec![(MARKET, path)]);
    engine.advance(at(SIGNAL_INDEX)).await;

    let mut config = BotConfig::default();
    config.exit_policy = ExitPolicy::TakeProfit;
    config.cancel_backoff_ms = 0;
    let scripted = Arc::new(ScriptedExchange::new(&engine));
    let mut manager = manager_on(config, &engine, scripted.clone(), Arc::new(MemoryStore::new()));

    assert!(manager.run_cycle().await);
    engine.advance(at(SIGNAL_INDEX + 1)).await;
    manager.check_positions().await;
    engine.advance(at(SIGNAL_INDEX + 2)).await;
    manager.check_positions().await;

    let exiting = &manager.positions()[MARKET];
    assert_eq!(exiting.state, PositionState::Exiting);
    let ask_id = exiting.exit_order_id.clone().unwrap();
    scripted.fill_when_canceled(&ask_id);

    // stop-loss breach, but the resting sell fills before the cancel lands
    engine.advance(at(SIGNAL_INDEX + 3)).await;
    manager.check_positions().await;
    assert!(manager.positions().is_empty());

    let trade = &manager.closed_trades()[0];
    assert_eq!(trade.reason, Some(ExitReason::TakeProfit));
    assert_close(trade.exit_price, 113.0);
    assert_eq!(manager.run_stats().wins, 1);
    assert_eq!(manager.run_stats().losses, 0);

    // only the take-profit order was ever placed
    assert_eq!(scripted.sells_placed(), 1);
    assert!(engine.execution().all_open_orders().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_buy_filled_during_timeout_cancel_is_kept() {
    let engine = engine(vec![(MARKET, quiet_path(MARKET, 10, 100.0))]);
    engine
        .exchange()
        .with_ledger(|ledger| {
            ledger.seed_order(pending_order("bid-1", MARKET, OrderSide::Bid, 100.0, 100.0))
        })
        .await;

    let scripted = Arc::new(ScriptedExchange::new(&engine));
    scripted.fill_when_canceled("bid-1");
    let entering = Position::entering(MARKET, 100.0, 100.0, "bid-1", t0());
    let mut manager =
        restored_manager_on(BotConfig::default(), &engine, scripted, vec![entering]).await;

    // past the 120 s timeout
    engine.advance(at(3)).await;
    manager.check_positions().await;

    let pos = &manager.positions()[MARKET];
    assert_eq!(pos.state, PositionState::Holding);
    assert_eq!(pos.quantity, 100.0);
    assert_eq!(pos.entry_price, 100.0);
    assert_eq!(
        engine.execution().order_status("bid-1").await.unwrap(),
        OrderState::Filled
    );
}

#[tokio::test]
async fn test_restore_restarts_the_runtime_clock() {
    let engine = engine(vec![(MARKET, quiet_path(MARKET, 60, 100.0))]);
    engine.advance(at(30)).await;

    let mut stats = RunStats::new(t0());
    stats.trades = 4;
    stats.wins = 3;
    stats.losses = 1;
    stats.total_profit = 1200.0;
    let store = Arc::new(MemoryStore::with_snapshot(Snapshot {
        positions: Default::default(),
        stats,
        saved_at: at(10),
    }));

    let manager = PositionManager::restore(
        BotConfig::default(),
        engine.market_data(),
        engine.execution(),
        store,
    )
    .await;

    let restored = manager.run_stats();
    assert_eq!(restored.started_at, at(30));
    assert_eq!(restored.trades, 4);
    assert_eq!(restored.wins, 3);
    assert_eq!(restored.total_profit, 1200.0);

    engine.advance(at(45)).await;
    assert_eq!(manager.stats().runtime_minutes, 15);
}
