use super::position::{Position, PositionState};
use super::position_manager::PositionManager;
use crate::config::ExitPolicy;
use crate::exchange::ExchangeResult;
use crate::models::{Holding, Order, OrderSide};
use std::collections::BTreeSet;

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    /// Positions created or rewritten
    pub updated: usize,
    /// Stale positions deleted
    pub removed: usize,
    /// Stray sell orders canceled
    pub canceled_orders: usize,
    /// Markets left as they were after an exchange error
    pub skipped: usize,
}

impl ReconcileSummary {
    pub fn changed(&self) -> usize {
        self.updated + self.removed
    }
}

impl PositionManager {
    /// Rebuild the position map from exchange holdings and open orders.
    ///
    /// Running it again without exchange-side changes changes nothing.
    /// Statistics are never touched.
    pub async fn reconcile(&mut self) -> ExchangeResult<ReconcileSummary> {
        let holdings = self.execution.all_holdings().await?;
        let open_orders = self.execution.all_open_orders().await?;

        let markets: BTreeSet<String> = holdings
            .keys()
            .chain(self.positions.keys())
            .chain(open_orders.iter().map(|o| &o.market))
            .cloned()
            .collect();

        let mut summary = ReconcileSummary::default();
        for market in markets {
            summary.examined += 1;
            let existing = self.positions.get(&market).cloned();

            let buy_order = open_orders
                .iter()
                .find(|o| o.market == market && o.side == OrderSide::Bid);

            let rebuilt = if let Some(order) = buy_order {
                Some(entering_from_order(order, existing.as_ref()))
            } else {
                match holdings.get(&market).filter(|h| !h.is_empty()) {
                    Some(holding) => {
                        let result = self
                            .rebuild_holding(&market, holding, existing.as_ref(), &open_orders, &mut summary)
                            .await;
                        match result {
                            Ok(rebuilt) => rebuilt,
                            Err(e) => {
                                tracing::warn!("⚠️ Skipping {} this pass: {}", market, e);
                                summary.skipped += 1;
                                continue;
                            }
                        }
                    }
                    None => None,
                }
            };

            match (existing, rebuilt) {
                (None, None) => {}
                (Some(_), None) => {
                    tracing::info!("🧹 {} has no exchange-side position, removed", market);
                    self.positions.remove(&market);
                    summary.removed += 1;
                }
                (old, Some(new)) => {
                    if old.as_ref() != Some(&new) {
                        tracing::info!("🔧 {} reconciled as {:?}", market, new.state);
                        self.positions.insert(market.clone(), new);
                        summary.updated += 1;
                    }
                }
            }
        }

        self.persist().await;
        tracing::info!(
            "🔄 Reconciliation complete: {} changed ({} updated, {} removed, {} stray orders canceled, {} skipped)",
            summary.changed(),
            summary.updated,
            summary.removed,
            summary.canceled_orders,
            summary.skipped
        );
        Ok(summary)
    }

    async fn rebuild_holding(
        &mut self,
        market: &str,
        holding: &Holding,
        existing: Option<&Position>,
        open_orders: &[Order],
        summary: &mut ReconcileSummary,
    ) -> ExchangeResult<Option<Position>> {
        let tracked_exit = existing
            .filter(|p| p.state == PositionState::Exiting)
            .and_then(|p| p.exit_order_id.clone());

        let mut tracked_exit_open = false;
        let mut canceled_any = false;
        for ask in open_orders
            .iter()
            .filter(|o| o.market == market && o.side == OrderSide::Ask)
        {
            if tracked_exit.as_deref() == Some(ask.id.as_str()) {
                tracked_exit_open = true;
                continue;
            }

            let outcome = self.execution.cancel(&ask.id).await;
            if outcome.success {
                tracing::info!("Canceled stray sell order {} on {}", ask.id, market);
                summary.canceled_orders += 1;
                canceled_any = true;
            } else {
                tracing::warn!(
                    "Failed to cancel stray sell order {} on {}: {}",
                    ask.id,
                    market,
                    outcome.reason.as_deref().unwrap_or("unknown")
                );
            }
        }

        // cancels release reserved quantity
        let holding = if canceled_any {
            self.execution.holding_of(market).await?
        } else {
            holding.clone()
        };
        if holding.is_empty() {
            return Ok(None);
        }

        if let (true, Some(pos)) = (tracked_exit_open, existing) {
            let mut kept = pos.clone();
            kept.available = holding.available;
            kept.reserved = holding.reserved;
            kept.quantity = holding.total();
            return Ok(Some(kept));
        }

        let entry_price = if holding.avg_buy_price > 0.0 {
            holding.avg_buy_price
        } else if let Some(known) = existing.map(|p| p.entry_price).filter(|p| *p > 0.0) {
            known
        } else {
            match self.current_price(market).await? {
                Some(price) => price,
                None => {
                    tracing::warn!("No entry price for {}, leaving it untracked", market);
                    return Ok(existing.cloned());
                }
            }
        };

        let now = self.market_data.now();
        let mut pos = Position::holding(market, entry_price, holding.available, holding.reserved, now);
        if let Some(old) = existing {
            pos.entry_time = old.entry_time;
            pos.filled_at = old.filled_at.or(Some(now));
            pos.entry_order_id = old.entry_order_id.clone();
            pos.high_water_price = old.high_water_price;
            pos.exit_filled_qty = old.exit_filled_qty;
            pos.exit_filled_value = old.exit_filled_value;
        }
        pos.recovered = existing.map_or(true, |p| p.recovered || p.state != PositionState::Holding);

        if self.config.exit_policy == ExitPolicy::TrailingStop {
            let current = self.current_price(market).await.ok().flatten();
            pos.seed_trailing(current.unwrap_or(entry_price).max(entry_price), self.config.trailing_ratio);
        }

        Ok(Some(pos))
    }
}

/// Entering position mirroring an open buy order
fn entering_from_order(order: &Order, existing: Option<&Position>) -> Position {
    if let Some(pos) = existing {
        if pos.state == PositionState::Entering
            && pos.entry_order_id.as_deref() == Some(order.id.as_str())
        {
            return pos.clone();
        }
    }

    let entry_time = existing.map(|p| p.entry_time).unwrap_or(order.created_at);
    let price = order.price.unwrap_or_default();
    Position::entering(&order.market, order.volume, price, &order.id, entry_time)
}
