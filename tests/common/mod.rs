#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use surgebot::backtest::{BacktestEngine, HistoricalMarket, DEFAULT_INITIAL_CASH};
use surgebot::config::BotConfig;
use surgebot::exchange::{ExchangeError, ExchangeResult, Execution, SimulatedExchange};
use surgebot::execution::{Position, PositionManager, RunStats};
use surgebot::models::{
    CancelOutcome, Candle, Holding, Order, OrderDetail, OrderSide, OrderState, OrderType,
};
use surgebot::persistence::{MemoryStore, Snapshot};

pub const MARKET: &str = "KRW-TEST";

/// Candle index at which the scripted surge and golden cross line up
pub const SIGNAL_INDEX: usize = 70;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(index: usize) -> DateTime<Utc> {
    t0() + Duration::minutes(index as i64)
}

pub fn candle(market: &str, index: usize, close: f64, value: f64) -> Candle {
    Candle {
        market: market.to_string(),
        timestamp: at(index),
        open: close,
        high: close,
        low: close,
        close,
        volume: value / close,
        value,
    }
}

/// Flat closes and traded value, then a 1.5x value build-up and a close of
/// 110 at index 69. At `SIGNAL_INDEX` the newest candle trades 2x the
/// build-up, so with default windows the bot sees a 2.0x / 1.5x surge and a
/// golden cross on the same candle.
pub fn surge_path(market: &str) -> Vec<Candle> {
    let mut candles = Vec::new();
    for i in 0..65 {
        candles.push(candle(market, i, 100.0, 100.0));
    }
    for i in 65..69 {
        candles.push(candle(market, i, 100.0, 150.0));
    }
    candles.push(candle(market, 69, 110.0, 150.0));
    candles.push(candle(market, SIGNAL_INDEX, 110.0, 300.0));
    candles
}

/// Append candles with the given closes after the last one, at quiet value
pub fn then(mut candles: Vec<Candle>, closes: &[f64]) -> Vec<Candle> {
    let market = candles[0].market.clone();
    let next = candles.len();
    for (offset, close) in closes.iter().enumerate() {
        candles.push(candle(&market, next + offset, *close, 100.0));
    }
    candles
}

/// Flat market with no signal
pub fn quiet_path(market: &str, len: usize, close: f64) -> Vec<Candle> {
    (0..len).map(|i| candle(market, i, close, 100.0)).collect()
}

pub fn engine(paths: Vec<(&str, Vec<Candle>)>) -> BacktestEngine {
    let mut market = HistoricalMarket::new(t0());
    for (name, candles) in paths {
        market.insert(name, candles);
    }
    BacktestEngine::new(market, DEFAULT_INITIAL_CASH, BotConfig::default().fees())
}

pub fn manager(config: BotConfig, engine: &BacktestEngine) -> PositionManager {
    PositionManager::new(
        config,
        engine.market_data(),
        engine.execution(),
        Arc::new(MemoryStore::new()),
    )
}

/// Manager whose store already holds `positions`
pub async fn restored_manager(
    config: BotConfig,
    engine: &BacktestEngine,
    positions: Vec<Position>,
) -> PositionManager {
    restored_manager_on(config, engine, engine.execution(), positions).await
}

pub async fn restored_manager_on(
    config: BotConfig,
    engine: &BacktestEngine,
    execution: Arc<dyn Execution>,
    positions: Vec<Position>,
) -> PositionManager {
    let positions: BTreeMap<String, Position> = positions
        .into_iter()
        .map(|p| (p.market.clone(), p))
        .collect();
    let snapshot = Snapshot {
        positions,
        stats: RunStats::new(t0()),
        saved_at: t0(),
    };

    PositionManager::restore(
        config,
        engine.market_data(),
        execution,
        Arc::new(MemoryStore::with_snapshot(snapshot)),
    )
    .await
}

pub fn pending_order(id: &str, market: &str, side: OrderSide, volume: f64, price: f64) -> Order {
    Order {
        id: id.to_string(),
        market: market.to_string(),
        side,
        order_type: OrderType::Limit,
        price: Some(price),
        volume,
        executed_volume: 0.0,
        executed_price: None,
        state: OrderState::Pending,
        created_at: t0(),
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {} but got {}",
        expected,
        actual
    );
}

/// The backtest venue with scripted faults layered on top
pub struct ScriptedExchange {
    inner: Arc<SimulatedExchange>,
    buy_failures: AtomicUsize,
    market_sell_failures: AtomicUsize,
    /// Orders that fill while their cancel is in flight
    fill_on_cancel: Mutex<HashSet<String>>,
    /// Markets whose holding lookup fails
    broken_holdings: Mutex<HashSet<String>>,
    sells_placed: AtomicUsize,
}

impl ScriptedExchange {
    pub fn new(engine: &BacktestEngine) -> Self {
        Self {
            inner: engine.exchange().clone(),
            buy_failures: AtomicUsize::new(0),
            market_sell_failures: AtomicUsize::new(0),
            fill_on_cancel: Mutex::new(HashSet::new()),
            broken_holdings: Mutex::new(HashSet::new()),
            sells_placed: AtomicUsize::new(0),
        }
    }

    pub fn fail_buys(self, count: usize) -> Self {
        self.buy_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_market_sells(self, count: usize) -> Self {
        self.market_sell_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fill_when_canceled(&self, order_id: &str) {
        self.fill_on_cancel.lock().unwrap().insert(order_id.to_string());
    }

    pub fn break_holding(&self, market: &str) {
        self.broken_holdings.lock().unwrap().insert(market.to_string());
    }

    /// Sell orders (limit and market) accepted so far
    pub fn sells_placed(&self) -> usize {
        self.sells_placed.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Execution for ScriptedExchange {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn place_buy(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String> {
        if Self::take_failure(&self.buy_failures) {
            return Err(ExchangeError::Network("timed out".into()));
        }
        self.inner.place_buy(market, quantity, price).await
    }

    async fn place_sell(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String> {
        let id = self.inner.place_sell(market, quantity, price).await?;
        self.sells_placed.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn place_market_sell(&self, market: &str, quantity: f64) -> ExchangeResult<String> {
        if Self::take_failure(&self.market_sell_failures) {
            return Err(ExchangeError::Network("timed out".into()));
        }
        let id = self.inner.place_market_sell(market, quantity).await?;
        self.sells_placed.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn cancel(&self, order_id: &str) -> CancelOutcome {
        let fills = self.fill_on_cancel.lock().unwrap().remove(order_id);
        if !fills {
            return self.inner.cancel(order_id).await;
        }

        // the venue fills the order just before the cancel arrives
        self.inner
            .with_ledger(|ledger| {
                let order = ledger.order(order_id).unwrap().clone();
                let price = order.price.unwrap();
                match order.side {
                    OrderSide::Ask => {
                        ledger.match_resting(&order.market, price);
                    }
                    OrderSide::Bid => {
                        let mut filled = order.clone();
                        filled.state = OrderState::Filled;
                        filled.executed_volume = order.volume;
                        filled.executed_price = Some(price);
                        ledger.seed_order(filled);
                        ledger.seed_holding(&order.market, order.volume, 0.0, price);
                    }
                }
            })
            .await;
        CancelOutcome::failed("order already filled")
    }

    async fn order_status(&self, order_id: &str) -> ExchangeResult<OrderState> {
        self.inner.order_status(order_id).await
    }

    async fn order_detail(&self, order_id: &str) -> ExchangeResult<OrderDetail> {
        self.inner.order_detail(order_id).await
    }

    async fn holding_of(&self, market: &str) -> ExchangeResult<Holding> {
        let broken = self.broken_holdings.lock().unwrap().contains(market);
        if broken {
            return Err(ExchangeError::Network("connection reset".into()));
        }
        self.inner.holding_of(market).await
    }

    async fn all_holdings(&self) -> ExchangeResult<HashMap<String, Holding>> {
        self.inner.all_holdings().await
    }

    async fn all_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        self.inner.all_open_orders().await
    }

    async fn balance(&self) -> ExchangeResult<f64> {
        self.inner.balance().await
    }
}

/// Manager trading through `execution` and saving into `store`
pub fn manager_on(
    config: BotConfig,
    engine: &BacktestEngine,
    execution: Arc<dyn Execution>,
    store: Arc<MemoryStore>,
) -> PositionManager {
    PositionManager::new(config, engine.market_data(), execution, store)
}
