use super::{Execution, ExchangeError, ExchangeResult, MarketData};
use crate::models::{
    CancelOutcome, FeeSchedule, Holding, Order, OrderDetail, OrderSide, OrderState, OrderType,
    DUST_QUANTITY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-memory balances and order book of a simulated account.
///
/// Limit buys fill immediately at their limit price. Limit sells reserve the
/// quantity and rest until `match_resting` sees the last price reach them.
/// Market sells fill at the price they are given.
#[derive(Debug, Clone)]
pub struct Ledger {
    cash: f64,
    fees: FeeSchedule,
    holdings: HashMap<String, Holding>,
    orders: HashMap<String, Order>,
}

impl Ledger {
    pub fn new(cash: f64, fees: FeeSchedule) -> Self {
        Self {
            cash,
            fees,
            holdings: HashMap::new(),
            orders: HashMap::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn fees(&self) -> FeeSchedule {
        self.fees
    }

    /// Put coins into the account without touching cash
    pub fn seed_holding(&mut self, market: &str, available: f64, reserved: f64, avg_buy_price: f64) {
        self.holdings.insert(
            market.to_string(),
            Holding {
                market: market.to_string(),
                available,
                reserved,
                avg_buy_price,
            },
        );
    }

    /// Insert an order as-is. Balances are not adjusted; seed a matching
    /// holding for resting asks.
    pub fn seed_order(&mut self, order: Order) {
        self.orders.insert(order.id.clone(), order);
    }

    fn validate(quantity: f64, price: f64) -> ExchangeResult<()> {
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(ExchangeError::InvalidOrder(format!("bad quantity {}", quantity)));
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(ExchangeError::InvalidOrder(format!("bad price {}", price)));
        }
        Ok(())
    }

    fn new_order(
        market: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Order {
        Order {
            id: Uuid::new_v4().to_string(),
            market: market.to_string(),
            side,
            order_type,
            price,
            volume: quantity,
            executed_volume: 0.0,
            executed_price: None,
            state: OrderState::Pending,
            created_at: now,
        }
    }

    fn record(&mut self, order: Order) -> String {
        let id = order.id.clone();
        self.orders.insert(id.clone(), order);
        id
    }

    pub fn buy(
        &mut self,
        market: &str,
        quantity: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> ExchangeResult<String> {
        Self::validate(quantity, price)?;

        let cost = price * quantity * (1.0 + self.fees.buy);
        if cost > self.cash + 1e-9 {
            return Err(ExchangeError::InsufficientBalance {
                needed: cost,
                available: self.cash,
            });
        }
        self.cash -= cost;

        let holding = self
            .holdings
            .entry(market.to_string())
            .or_insert_with(|| Holding::empty(market));
        let total = holding.total();
        holding.avg_buy_price = (holding.avg_buy_price * total + price * quantity) / (total + quantity);
        holding.available += quantity;

        let mut order = Self::new_order(market, OrderSide::Bid, OrderType::Limit, quantity, Some(price), now);
        order.state = OrderState::Filled;
        order.executed_volume = quantity;
        order.executed_price = Some(price);
        Ok(self.record(order))
    }

    fn take_available(&mut self, market: &str, quantity: f64) -> ExchangeResult<&mut Holding> {
        let available = self.holdings.get(market).map(|h| h.available).unwrap_or(0.0);
        if quantity > available + DUST_QUANTITY {
            return Err(ExchangeError::InsufficientHolding {
                market: market.to_string(),
                needed: quantity,
                available,
            });
        }

        let holding = self
            .holdings
            .get_mut(market)
            .ok_or_else(|| ExchangeError::NoData(market.to_string()))?;
        holding.available = (holding.available - quantity).max(0.0);
        Ok(holding)
    }

    pub fn sell_limit(
        &mut self,
        market: &str,
        quantity: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> ExchangeResult<String> {
        Self::validate(quantity, price)?;
        self.take_available(market, quantity)?.reserved += quantity;

        let order = Self::new_order(market, OrderSide::Ask, OrderType::Limit, quantity, Some(price), now);
        Ok(self.record(order))
    }

    pub fn sell_market(
        &mut self,
        market: &str,
        quantity: f64,
        last_price: f64,
        now: DateTime<Utc>,
    ) -> ExchangeResult<String> {
        Self::validate(quantity, last_price)?;
        self.take_available(market, quantity)?;
        self.cash += last_price * quantity * (1.0 - self.fees.sell);
        self.remove_dust(market);

        let mut order = Self::new_order(market, OrderSide::Ask, OrderType::Market, quantity, None, now);
        order.state = OrderState::Filled;
        order.executed_volume = quantity;
        order.executed_price = Some(last_price);
        Ok(self.record(order))
    }

    pub fn cancel(&mut self, order_id: &str) -> CancelOutcome {
        let Some(order) = self.orders.get_mut(order_id) else {
            return CancelOutcome::failed(format!("order {} not found", order_id));
        };
        if order.state != OrderState::Pending {
            return CancelOutcome::failed(format!("order already {}", order.state));
        }

        order.state = OrderState::Canceled;
        if order.side == OrderSide::Ask {
            let remaining = order.volume - order.executed_volume;
            let market = order.market.clone();
            if let Some(holding) = self.holdings.get_mut(&market) {
                holding.reserved = (holding.reserved - remaining).max(0.0);
                holding.available += remaining;
            }
        }
        CancelOutcome::ok()
    }

    /// Fill resting asks in `market` whose limit is at or below `last_price`,
    /// at their limit price. Returns the number of fills.
    pub fn match_resting(&mut self, market: &str, last_price: f64) -> usize {
        if !(last_price.is_finite() && last_price > 0.0) {
            return 0;
        }

        let mut filled = Vec::new();
        for order in self.orders.values_mut() {
            let crossed = order.price.map(|p| p <= last_price).unwrap_or(false);
            if order.market == market
                && order.side == OrderSide::Ask
                && order.state == OrderState::Pending
                && crossed
            {
                let quantity = order.volume - order.executed_volume;
                let price = order.price.unwrap_or(last_price);
                order.state = OrderState::Filled;
                order.executed_volume = order.volume;
                order.executed_price = Some(price);
                filled.push((quantity, price));
            }
        }

        for (quantity, price) in &filled {
            if let Some(holding) = self.holdings.get_mut(market) {
                holding.reserved = (holding.reserved - quantity).max(0.0);
            }
            self.cash += price * quantity * (1.0 - self.fees.sell);
        }
        self.remove_dust(market);
        filled.len()
    }

    fn remove_dust(&mut self, market: &str) {
        if self.holdings.get(market).map(|h| h.is_empty()).unwrap_or(false) {
            self.holdings.remove(market);
        }
    }

    pub fn order(&self, order_id: &str) -> ExchangeResult<&Order> {
        self.orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    pub fn holding(&self, market: &str) -> Holding {
        self.holdings
            .get(market)
            .cloned()
            .unwrap_or_else(|| Holding::empty(market))
    }

    pub fn holdings(&self) -> HashMap<String, Holding> {
        self.holdings
            .iter()
            .filter(|(_, h)| !h.is_empty())
            .map(|(m, h)| (m.clone(), h.clone()))
            .collect()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        let mut open: Vec<Order> = self
            .orders
            .values()
            .filter(|o| o.state == OrderState::Pending)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        open
    }

    /// Markets with at least one resting order
    pub fn pending_markets(&self) -> BTreeSet<String> {
        self.orders
            .values()
            .filter(|o| o.state == OrderState::Pending)
            .map(|o| o.market.clone())
            .collect()
    }

    /// Cash plus holdings marked at the given prices
    pub fn equity(&self, prices: &HashMap<String, f64>) -> f64 {
        self.cash
            + self
                .holdings
                .iter()
                .map(|(market, h)| h.total() * prices.get(market).copied().unwrap_or(h.avg_buy_price))
                .sum::<f64>()
    }
}

/// `Execution` over a `Ledger`, priced by any `MarketData` source.
///
/// Paper trading pairs it with the live client; backtests pair it with a
/// `HistoricalMarket`.
pub struct SimulatedExchange {
    name: String,
    ledger: Mutex<Ledger>,
    market: Arc<dyn MarketData>,
}

impl SimulatedExchange {
    pub fn new(name: impl Into<String>, market: Arc<dyn MarketData>, ledger: Ledger) -> Self {
        Self {
            name: name.into(),
            ledger: Mutex::new(ledger),
            market,
        }
    }

    /// Run `f` with exclusive access to the ledger
    pub async fn with_ledger<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut ledger = self.ledger.lock().await;
        f(&mut ledger)
    }

    pub async fn cash(&self) -> f64 {
        self.ledger.lock().await.cash()
    }

    /// Fill resting asks that the current last price has reached
    pub async fn match_resting_orders(&self) -> usize {
        let markets = self.ledger.lock().await.pending_markets();

        let mut fills = 0;
        for market in markets {
            let price = match self.market.get_ticker(&market).await {
                Ok(ticker) => ticker.trade_price,
                Err(e) => {
                    tracing::debug!("No price for {} while matching: {}", market, e);
                    continue;
                }
            };
            fills += self.ledger.lock().await.match_resting(&market, price);
        }
        fills
    }

    /// Cash plus holdings marked at the latest prices
    pub async fn equity(&self) -> f64 {
        let markets: Vec<String> = self.ledger.lock().await.holdings.keys().cloned().collect();

        let mut prices = HashMap::new();
        for market in markets {
            if let Ok(ticker) = self.market.get_ticker(&market).await {
                prices.insert(market, ticker.trade_price);
            }
        }
        self.ledger.lock().await.equity(&prices)
    }
}

#[async_trait]
impl Execution for SimulatedExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_buy(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String> {
        let now = self.market.now();
        self.ledger.lock().await.buy(market, quantity, price, now)
    }

    async fn place_sell(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String> {
        let now = self.market.now();
        self.ledger.lock().await.sell_limit(market, quantity, price, now)
    }

    async fn place_market_sell(&self, market: &str, quantity: f64) -> ExchangeResult<String> {
        let ticker = self.market.get_ticker(market).await?;
        let now = self.market.now();
        self.ledger
            .lock()
            .await
            .sell_market(market, quantity, ticker.trade_price, now)
    }

    async fn cancel(&self, order_id: &str) -> CancelOutcome {
        self.ledger.lock().await.cancel(order_id)
    }

    async fn order_status(&self, order_id: &str) -> ExchangeResult<OrderState> {
        Ok(self.ledger.lock().await.order(order_id)?.state)
    }

    async fn order_detail(&self, order_id: &str) -> ExchangeResult<OrderDetail> {
        Ok(self.ledger.lock().await.order(order_id)?.detail())
    }

    async fn holding_of(&self, market: &str) -> ExchangeResult<Holding> {
        Ok(self.ledger.lock().await.holding(market))
    }

    async fn all_holdings(&self) -> ExchangeResult<HashMap<String, Holding>> {
        Ok(self.ledger.lock().await.holdings())
    }

    async fn all_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        Ok(self.ledger.lock().await.open_orders())
    }

    async fn balance(&self) -> ExchangeResult<f64> {
        Ok(self.ledger.lock().await.cash())
    }
}
