use super::position::{
    ClosedTrade, ExitKind, ExitReason, Position, PositionState, RunStats, StatsSnapshot,
};
use crate::config::{BotConfig, ExitPolicy};
use crate::exchange::{
    adjust_number, floor_quantity, optimal_sell_price, round_quantity, ExchangeError,
    ExchangeResult, Execution, MarketData,
};
use crate::models::{OrderDetail, OrderSide, OrderState, DUST_QUANTITY};
use crate::persistence::{Snapshot, SnapshotStore};
use crate::strategy::{CrossKind, CrossLatch, SignalEvaluator};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Owns every open position and the run statistics.
///
/// Each cycle checks the positions one at a time, then scans for entries.
/// All venue access goes through the `MarketData` / `Execution` handed in at
/// construction, so the same code runs live, on paper and in backtests.
pub struct PositionManager {
    pub(super) config: BotConfig,
    pub(super) market_data: Arc<dyn MarketData>,
    pub(super) execution: Arc<dyn Execution>,
    store: Arc<dyn SnapshotStore>,
    evaluator: SignalEvaluator,
    latch: CrossLatch,
    pub(super) positions: BTreeMap<String, Position>,
    stats: RunStats,
    closed_trades: Vec<ClosedTrade>,
    current_scan: String,
    last_activity: String,
}

impl PositionManager {
    pub fn new(
        config: BotConfig,
        market_data: Arc<dyn MarketData>,
        execution: Arc<dyn Execution>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let evaluator =
            SignalEvaluator::new(config.volume.clone(), config.moving_average.clone());
        let started_at = market_data.now();

        Self {
            config,
            market_data,
            execution,
            store,
            evaluator,
            latch: CrossLatch::new(),
            positions: BTreeMap::new(),
            stats: RunStats::new(started_at),
            closed_trades: Vec::new(),
            current_scan: String::new(),
            last_activity: String::new(),
        }
    }

    /// Create a manager and restore the last saved snapshot, if any.
    ///
    /// An unreadable store is logged and the manager starts empty.
    pub async fn restore(
        config: BotConfig,
        market_data: Arc<dyn MarketData>,
        execution: Arc<dyn Execution>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let mut manager = Self::new(config, market_data, execution, store);

        match manager.store.load().await {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    "📂 Restored {} positions (trades: {}, profit: {:.0} KRW)",
                    snapshot.positions.len(),
                    snapshot.stats.trades,
                    snapshot.stats.total_profit
                );
                // counters carry over, the runtime clock restarts
                let started_at = manager.stats.started_at;
                manager.positions = snapshot.positions;
                manager.stats = RunStats {
                    started_at,
                    ..snapshot.stats
                };
            }
            Ok(None) => tracing::info!("No saved state, starting fresh"),
            Err(e) => tracing::error!("Failed to load saved state, starting fresh: {}", e),
        }

        manager
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn run_stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            runtime_minutes: (self.market_data.now() - self.stats.started_at).num_minutes(),
            trades: self.stats.trades,
            wins: self.stats.wins,
            losses: self.stats.losses,
            win_rate: self.stats.win_rate(),
            total_profit: self.stats.total_profit,
            positions: self.positions.clone(),
            current_scan: self.current_scan.clone(),
            last_activity: self.last_activity.clone(),
        }
    }

    /// Save positions and stats. Failures are logged; memory stays authoritative.
    pub(super) async fn persist(&self) {
        let snapshot = Snapshot {
            positions: self.positions.clone(),
            stats: self.stats.clone(),
            saved_at: self.market_data.now(),
        };
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::error!("💾 Failed to save state: {}", e);
        }
    }

    async fn store_position(&mut self, position: Position) {
        self.positions.insert(position.market.clone(), position);
        self.persist().await;
    }

    async fn remove_position(&mut self, market: &str) {
        if self.positions.remove(market).is_some() {
            self.persist().await;
        }
    }

    /// Last trade price, or `None` when the venue has no usable price
    pub(super) async fn current_price(&self, market: &str) -> ExchangeResult<Option<f64>> {
        match self.market_data.get_ticker(market).await {
            Ok(ticker) if ticker.trade_price.is_finite() && ticker.trade_price > 0.0 => {
                Ok(Some(ticker.trade_price))
            }
            Ok(ticker) => {
                tracing::warn!("Ignoring invalid price {} for {}", ticker.trade_price, market);
                Ok(None)
            }
            Err(ExchangeError::NoData(_)) => {
                tracing::warn!("No ticker for {}, skipping", market);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// One pass: check every position, then look for entries.
    ///
    /// Returns false when the cycle could not run.
    pub async fn run_cycle(&mut self) -> bool {
        self.current_scan = "Checking positions...".to_string();
        self.check_positions().await;

        let balance = match self.execution.balance().await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!("❌ Balance query failed: {}", e);
                self.current_scan = "Error occurred, retrying...".to_string();
                return false;
            }
        };

        if balance < self.config.buy_amount {
            self.current_scan = format!("Insufficient balance: {:.0} KRW", balance);
            return true;
        }

        self.current_scan = "Scanning markets...".to_string();
        let markets = match self.market_data.markets_by_volume().await {
            Ok(markets) => markets,
            Err(e) => {
                tracing::error!("❌ Market list query failed: {}", e);
                self.current_scan = "Error occurred, retrying...".to_string();
                return false;
            }
        };

        for market in markets.into_iter().take(self.config.scan_limit) {
            if self.positions.contains_key(&market) {
                continue;
            }
            if !self.check_buy_signal(&market).await {
                continue;
            }
            if !self.buy(&market).await {
                // unlatch so the signal is retried while its candle is current
                self.latch.forget(&market);
                continue;
            }

            match self.execution.balance().await {
                Ok(balance) if balance >= self.config.buy_amount => {}
                Ok(balance) => {
                    tracing::info!("Balance down to {:.0} KRW, scan stopped", balance);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Balance re-check failed, scan stopped: {}", e);
                    break;
                }
            }
        }

        true
    }

    /// Check every position once, in market order
    pub async fn check_positions(&mut self) {
        let markets: Vec<String> = self.positions.keys().cloned().collect();

        for market in markets {
            match self.check_position(&market).await {
                Ok(()) => self.clear_errors(&market).await,
                Err(e) => self.record_failure(&market, e).await,
            }
        }
    }

    async fn clear_errors(&mut self, market: &str) {
        let reset = match self.positions.get_mut(market) {
            Some(pos) if pos.error_count > 0 => {
                pos.error_count = 0;
                true
            }
            _ => false,
        };
        if reset {
            self.persist().await;
        }
    }

    async fn record_failure(&mut self, market: &str, err: ExchangeError) {
        let limit = self.config.max_position_errors;
        let Some(pos) = self.positions.get_mut(market) else {
            tracing::warn!("⚠️ Check failed for {}: {}", market, err);
            return;
        };

        pos.error_count += 1;
        let count = pos.error_count;
        if count >= limit {
            tracing::error!(
                "🗑️ Dropping {} after {} failed checks ({}); reconciliation will rebuild it",
                market,
                count,
                err
            );
            self.remove_position(market).await;
        } else {
            tracing::warn!("⚠️ Check failed for {} ({}/{}): {}", market, count, limit, err);
        }
    }

    async fn check_position(&mut self, market: &str) -> ExchangeResult<()> {
        let Some(pos) = self.positions.get(market).cloned() else {
            return Ok(());
        };

        match pos.state {
            PositionState::Entering => self.check_entering(pos).await,
            PositionState::Holding => self.check_holding(pos).await,
            PositionState::Exiting => self.check_exiting(pos).await,
        }
    }

    // ========================================================================
    // Entering
    // ========================================================================

    async fn check_entering(&mut self, pos: Position) -> ExchangeResult<()> {
        let Some(order_id) = pos.entry_order_id.clone() else {
            tracing::warn!("{} is entering without an order id, dropping it", pos.market);
            self.remove_position(&pos.market).await;
            return Ok(());
        };

        let detail = self.execution.order_detail(&order_id).await?;
        match detail.state {
            OrderState::Filled => self.confirm_entry(pos, &detail).await,
            OrderState::Canceled if detail.has_fill() => self.confirm_entry(pos, &detail).await,
            OrderState::Canceled => {
                tracing::info!("❎ Buy order for {} was canceled unfilled", pos.market);
                self.remove_position(&pos.market).await;
            }
            OrderState::Pending => {
                let waited = self.market_data.now() - pos.entry_time;
                if waited >= self.config.buy_timeout() {
                    self.abandon_entry(pos, &order_id).await;
                }
            }
        }
        Ok(())
    }

    /// Cancel a stale buy, then trust the order's final status over the
    /// cancel result
    async fn abandon_entry(&mut self, pos: Position, order_id: &str) {
        let outcome = self.execution.cancel(order_id).await;
        if !outcome.success {
            tracing::warn!(
                "Cancel of stale buy for {} failed: {}",
                pos.market,
                outcome.reason.as_deref().unwrap_or("unknown")
            );
        }

        match self.execution.order_detail(order_id).await {
            Ok(detail) if detail.state == OrderState::Filled || detail.has_fill() => {
                tracing::info!("Buy for {} filled while timing out, keeping it", pos.market);
                self.confirm_entry(pos, &detail).await;
            }
            Ok(_) => {
                tracing::info!("⌛ Buy order for {} timed out, dropped", pos.market);
                self.remove_position(&pos.market).await;
            }
            Err(e) => {
                tracing::warn!("Could not confirm cancel for {} ({}), dropping", pos.market, e);
                self.remove_position(&pos.market).await;
            }
        }
    }

    async fn confirm_entry(&mut self, mut pos: Position, detail: &OrderDetail) {
        let quantity = if detail.has_fill() {
            detail.executed_qty
        } else {
            pos.quantity
        };
        let price = detail
            .executed_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(pos.entry_price);

        pos.mark_filled(quantity, price, self.market_data.now());
        if self.config.exit_policy == ExitPolicy::TrailingStop {
            pos.seed_trailing(price, self.config.trailing_ratio);
        }

        tracing::info!("✅ Bought {}: {:.8} @ {:.2}", pos.market, quantity, price);
        self.last_activity = format!("Bought {} @ {:.2}", pos.market, price);
        self.store_position(pos).await;
    }

    // ========================================================================
    // Holding
    // ========================================================================

    async fn check_holding(&mut self, mut pos: Position) -> ExchangeResult<()> {
        let Some(price) = self.current_price(&pos.market).await? else {
            return Ok(());
        };

        if price <= pos.loss_limit(self.config.loss_ratio) {
            tracing::info!(
                "🛑 Stop-loss hit for {} at {:.2} (entry {:.2})",
                pos.market,
                price,
                pos.entry_price
            );
            return self.exit_at_market(pos, ExitReason::StopLoss).await;
        }

        match self.config.exit_policy {
            ExitPolicy::TrailingStop => {
                if pos.update_trailing(price, self.config.trailing_ratio, self.config.trailing_noise)
                {
                    tracing::debug!(
                        "📈 Trailing stop for {} raised to {:.2}",
                        pos.market,
                        pos.stop_price.unwrap_or_default()
                    );
                    self.store_position(pos.clone()).await;
                }

                match pos.stop_price {
                    Some(stop) if price <= stop => {
                        tracing::info!("📉 Trailing stop hit for {} at {:.2}", pos.market, price);
                        self.exit_at_market(pos, ExitReason::TrailingStop).await
                    }
                    _ => Ok(()),
                }
            }
            ExitPolicy::DeadCross => {
                let candles = self
                    .market_data
                    .get_candles(
                        &pos.market,
                        self.evaluator.candles_needed(),
                        None,
                        self.config.candle_unit,
                    )
                    .await?;

                match self.evaluator.detect_cross(&candles) {
                    Some(cross)
                        if cross.kind == CrossKind::Dead && self.latch.accept(&pos.market, &cross) =>
                    {
                        tracing::info!("💀 Dead cross on {}, selling", pos.market);
                        let market = pos.market.clone();
                        let result = self.exit_at_market(pos, ExitReason::DeadCross).await;

                        // still holding: the same cross must fire again next cycle
                        let holding = self
                            .positions
                            .get(&market)
                            .is_some_and(|p| p.state == PositionState::Holding);
                        if result.is_err() || holding {
                            self.latch.forget(&market);
                        }
                        result
                    }
                    _ => Ok(()),
                }
            }
            ExitPolicy::TakeProfit => self.place_profit_order(pos).await,
        }
    }

    /// Rest a limit sell at the profit target once the entry has settled
    async fn place_profit_order(&mut self, mut pos: Position) -> ExchangeResult<()> {
        if let Some(filled_at) = pos.filled_at {
            if self.market_data.now() - filled_at < self.config.profit_order_delay() {
                return Ok(());
            }
        }

        let market = pos.market.clone();
        let holding = self.execution.holding_of(&market).await?;
        if holding.is_empty() {
            tracing::warn!("Holding for {} is gone, dropping position", market);
            self.remove_position(&market).await;
            return Ok(());
        }

        let target = pos.entry_price * (1.0 + self.config.profit_ratio);
        if holding.reserved > DUST_QUANTITY {
            // a sell already rests on the venue
            let open = self.execution.all_open_orders().await?;
            if let Some(order) = open
                .into_iter()
                .find(|o| o.market == market && o.side == OrderSide::Ask)
            {
                tracing::info!("Adopting resting sell {} for {}", order.id, market);
                pos.quantity = holding.total();
                pos.begin_exit(
                    order.id,
                    ExitKind::Limit,
                    ExitReason::TakeProfit,
                    order.price.or(Some(target)),
                    holding.reserved,
                );
                self.store_position(pos).await;
                return Ok(());
            }
        }

        let quantity = floor_quantity(holding.available);
        if quantity <= 0.0 {
            return Ok(());
        }
        let orderbook = self.market_data.get_orderbook(&market).await?;
        let price = optimal_sell_price(&orderbook, target);

        let order_id = self.execution.place_sell(&market, quantity, price).await?;
        tracing::info!("🎯 Take-profit order for {}: {:.8} @ {:.2}", market, quantity, price);

        pos.quantity = holding.total();
        pos.begin_exit(
            order_id,
            ExitKind::Limit,
            ExitReason::TakeProfit,
            Some(price),
            quantity,
        );
        self.last_activity = format!("Sell order {} @ {:.2}", market, price);
        self.store_position(pos).await;
        Ok(())
    }

    /// Market-sell everything available, then confirm right away
    async fn exit_at_market(&mut self, mut pos: Position, reason: ExitReason) -> ExchangeResult<()> {
        let market = pos.market.clone();
        let holding = self.execution.holding_of(&market).await?;
        let quantity = round_quantity(holding.available);

        if quantity <= DUST_QUANTITY {
            if holding.is_empty() {
                tracing::warn!("{} has nothing left to sell", market);
                pos.exit_reason = Some(reason);
                self.close_position(pos, 0.0, 0.0).await;
            } else {
                tracing::warn!(
                    "{} is locked by another order ({:.8} reserved), leaving it to reconciliation",
                    market,
                    holding.reserved
                );
            }
            return Ok(());
        }

        let order_id = self.execution.place_market_sell(&market, quantity).await?;
        tracing::info!("💸 Market sell {} {:.8} ({:?})", market, quantity, reason);

        pos.quantity = holding.total();
        pos.begin_exit(order_id, ExitKind::Market, reason, None, quantity);
        self.store_position(pos.clone()).await;

        self.confirm_exit_order(pos).await
    }

    // ========================================================================
    // Exiting
    // ========================================================================

    async fn check_exiting(&mut self, pos: Position) -> ExchangeResult<()> {
        if pos.exit_kind == Some(ExitKind::Limit) {
            if let Some(price) = self.current_price(&pos.market).await? {
                if price <= pos.loss_limit(self.config.loss_ratio) {
                    tracing::info!(
                        "🛑 Stop-loss breached for {} at {:.2} with a resting sell",
                        pos.market,
                        price
                    );
                    return self.stop_out_resting(pos, ExitReason::StopLoss).await;
                }
            }
        }

        self.confirm_exit_order(pos).await
    }

    /// Follow the exit order without any stop checks
    async fn confirm_exit_order(&mut self, pos: Position) -> ExchangeResult<()> {
        let Some(order_id) = pos.exit_order_id.clone() else {
            return self.return_to_holding(pos).await;
        };

        let detail = self.execution.order_detail(&order_id).await?;
        match detail.state {
            OrderState::Filled => {
                let (quantity, price) = self.fill_of(&pos, &detail).await?;
                self.close_position(pos, quantity, price).await;
                Ok(())
            }
            OrderState::Canceled => {
                let mut pos = pos;
                if detail.has_fill() {
                    let (quantity, price) = self.fill_of(&pos, &detail).await?;
                    pos.record_exit_fill(quantity, price);
                }
                tracing::info!("Exit order for {} was canceled, back to holding", pos.market);
                self.return_to_holding(pos).await
            }
            OrderState::Pending => Ok(()),
        }
    }

    /// Executed quantity and price of an exit order, with fallbacks for
    /// venues that omit them
    async fn fill_of(&self, pos: &Position, detail: &OrderDetail) -> ExchangeResult<(f64, f64)> {
        let quantity = if detail.has_fill() {
            detail.executed_qty
        } else {
            pos.reserved
        };

        let price = match detail.executed_price.or(pos.target_price) {
            Some(price) => price,
            None => self
                .current_price(&pos.market)
                .await?
                .unwrap_or(pos.entry_price),
        };
        Ok((quantity, price))
    }

    async fn return_to_holding(&mut self, mut pos: Position) -> ExchangeResult<()> {
        let holding = self.execution.holding_of(&pos.market).await?;
        if holding.is_empty() {
            self.close_position(pos, 0.0, 0.0).await;
            return Ok(());
        }

        pos.abort_exit(holding.available, holding.reserved);
        self.store_position(pos).await;
        Ok(())
    }

    /// Replace a resting limit sell with a market sell.
    ///
    /// The cancel is retried with backoff. If it still cannot be confirmed the
    /// order status decides: a fill closes the position, a pending order is
    /// left for the next cycle.
    async fn stop_out_resting(&mut self, mut pos: Position, reason: ExitReason) -> ExchangeResult<()> {
        let Some(order_id) = pos.exit_order_id.clone() else {
            return self.exit_at_market(pos, reason).await;
        };

        let confirmed = self.cancel_with_retry(&order_id).await;
        let detail = self.execution.order_detail(&order_id).await?;

        match detail.state {
            OrderState::Filled => {
                tracing::info!("Resting sell for {} filled before the cancel", pos.market);
                let (quantity, price) = self.fill_of(&pos, &detail).await?;
                self.close_position(pos, quantity, price).await;
                return Ok(());
            }
            OrderState::Pending if !confirmed => {
                tracing::warn!("Could not cancel sell for {}, retrying next cycle", pos.market);
                return Ok(());
            }
            _ => {}
        }

        if detail.has_fill() {
            let (quantity, price) = self.fill_of(&pos, &detail).await?;
            pos.record_exit_fill(quantity, price);
        }

        let holding = self.execution.holding_of(&pos.market).await?;
        pos.abort_exit(holding.available, holding.reserved);
        self.store_position(pos.clone()).await;

        self.exit_at_market(pos, reason).await
    }

    /// True once a cancel is acknowledged
    async fn cancel_with_retry(&self, order_id: &str) -> bool {
        let attempts = self.config.cancel_retries.max(1);

        for attempt in 1..=attempts {
            let outcome = self.execution.cancel(order_id).await;
            if outcome.success {
                return true;
            }

            tracing::warn!(
                "Cancel attempt {}/{} for {} failed: {}",
                attempt,
                attempts,
                order_id,
                outcome.reason.as_deref().unwrap_or("unknown")
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.cancel_backoff() * attempt).await;
            }
        }
        false
    }

    /// Book the round trip and forget the position.
    ///
    /// Fills of earlier, canceled exit orders are folded into the exit price.
    async fn close_position(&mut self, pos: Position, fill_qty: f64, fill_price: f64) {
        let quantity = pos.exit_filled_qty + fill_qty;
        if quantity <= DUST_QUANTITY {
            tracing::info!("Position {} closed with nothing sold", pos.market);
            self.remove_position(&pos.market).await;
            return;
        }

        let exit_price = (pos.exit_filled_value + fill_qty * fill_price) / quantity;
        let net_profit = self
            .config
            .fees()
            .net_profit(pos.entry_price, exit_price, quantity);
        self.stats.record_close(net_profit);

        let icon = if net_profit > 0.0 { "💰" } else { "📉" };
        tracing::info!(
            "{} Closed {} @ {:.2} (entry {:.2}, qty {:.8}): {:+.0} KRW [{:?}]",
            icon,
            pos.market,
            exit_price,
            pos.entry_price,
            quantity,
            net_profit,
            pos.exit_reason
        );
        self.last_activity = format!("Sold {} {:+.0} KRW", pos.market, net_profit);

        self.closed_trades.push(ClosedTrade {
            market: pos.market.clone(),
            entry_price: pos.entry_price,
            exit_price,
            quantity,
            net_profit,
            reason: pos.exit_reason,
            entry_time: pos.entry_time,
            exit_time: self.market_data.now(),
            recovered: pos.recovered,
        });

        self.positions.remove(&pos.market);
        self.persist().await;
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Volume surge and a golden cross not reported before
    pub async fn check_buy_signal(&mut self, market: &str) -> bool {
        let candles = match self
            .market_data
            .get_candles(
                market,
                self.evaluator.candles_needed(),
                None,
                self.config.candle_unit,
            )
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                tracing::debug!("No candles for {}: {}", market, e);
                return false;
            }
        };

        let Some(volume) = self.evaluator.volume_surge(&candles) else {
            return false;
        };
        self.current_scan = format!(
            "{} ({:.2}x / {:.2}x)",
            market, volume.short_ratio, volume.long_ratio
        );

        match self.evaluator.entry_cross(&candles) {
            Some(cross) if self.latch.accept(market, &cross) => {
                tracing::info!(
                    "🎯 Entry signal on {}: value {:.2}x / {:.2}x, golden cross at {}",
                    market,
                    volume.short_ratio,
                    volume.long_ratio,
                    cross.at
                );
                true
            }
            _ => false,
        }
    }

    async fn entry_price(&self, market: &str) -> Option<f64> {
        if let Ok(book) = self.market_data.get_orderbook(market).await {
            if let Some(ask) = book.best_ask() {
                return Some(ask);
            }
        }

        match self.current_price(market).await {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!("No price for {}: {}", market, e);
                None
            }
        }
    }

    /// Submit a limit buy for `buy_amount` KRW at the best ask.
    ///
    /// Returns false when the buy was declined or rejected.
    pub async fn buy(&mut self, market: &str) -> bool {
        if self.positions.contains_key(market) {
            return false;
        }
        if self.config.buy_amount < self.config.min_order_value {
            tracing::warn!(
                "Buy amount {:.0} is below the minimum order value {:.0}",
                self.config.buy_amount,
                self.config.min_order_value
            );
            return false;
        }

        let Some(price) = self.entry_price(market).await else {
            return false;
        };
        let quantity = adjust_number(self.config.buy_amount / price);
        if quantity <= 0.0 || quantity * price < self.config.min_order_value {
            tracing::info!("Buy for {} declined: quantity {} at {:.2}", market, quantity, price);
            return false;
        }

        match self.execution.place_buy(market, quantity, price).await {
            Ok(order_id) => {
                let pos = Position::entering(market, quantity, price, &order_id, self.market_data.now());
                tracing::info!("🛒 Buy order for {}: {:.8} @ {:.2}", market, quantity, price);
                self.last_activity = format!("Buy order {} @ {:.2}", market, price);
                self.store_position(pos).await;
                true
            }
            Err(e) => {
                tracing::warn!("❌ Buy order for {} failed: {}", market, e);
                false
            }
        }
    }

    /// Close everything at market. Used at the end of a backtest.
    pub async fn liquidate(&mut self) {
        let markets: Vec<String> = self.positions.keys().cloned().collect();

        for market in markets {
            let Some(pos) = self.positions.get(&market).cloned() else {
                continue;
            };

            let result = match (pos.state, pos.exit_kind) {
                (PositionState::Entering, _) => {
                    if let Some(order_id) = pos.entry_order_id.clone() {
                        self.abandon_entry(pos, &order_id).await;
                    }
                    match self.positions.get(&market).cloned() {
                        Some(held) if held.state == PositionState::Holding => {
                            self.exit_at_market(held, ExitReason::Liquidation).await
                        }
                        _ => Ok(()),
                    }
                }
                (PositionState::Holding, _) => self.exit_at_market(pos, ExitReason::Liquidation).await,
                (PositionState::Exiting, Some(ExitKind::Limit)) => {
                    self.stop_out_resting(pos, ExitReason::Liquidation).await
                }
                (PositionState::Exiting, _) => self.confirm_exit_order(pos).await,
            };

            if let Err(e) = result {
                tracing::warn!("Failed to liquidate {}: {}", market, e);
            }
        }
    }
}
