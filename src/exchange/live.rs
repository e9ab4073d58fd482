use super::{Execution, ExchangeError, ExchangeResult};
use crate::api::bithumb::{Account, BithumbClient};
use crate::models::{
    currency_of, CancelOutcome, Holding, Order, OrderDetail, OrderSide, OrderState, QUOTE_CURRENCY,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Real orders on the exchange account behind `BithumbClient`
pub struct LiveExecution {
    client: Arc<BithumbClient>,
}

impl LiveExecution {
    pub fn new(client: Arc<BithumbClient>) -> ExchangeResult<Self> {
        if !client.has_credentials() {
            return Err(ExchangeError::Auth(
                "live execution requires API credentials".into(),
            ));
        }
        Ok(Self { client })
    }

    async fn accounts(&self) -> ExchangeResult<Vec<Account>> {
        self.client.get_accounts().await
    }
}

#[async_trait]
impl Execution for LiveExecution {
    fn name(&self) -> &str {
        "bithumb"
    }

    async fn place_buy(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String> {
        let order = self
            .client
            .place_order(market, OrderSide::Bid, quantity, Some(price))
            .await?;
        tracing::debug!("📝 Buy order {} placed: {} {} @ {}", order.uuid, market, quantity, price);
        Ok(order.uuid)
    }

    async fn place_sell(&self, market: &str, quantity: f64, price: f64) -> ExchangeResult<String> {
        let order = self
            .client
            .place_order(market, OrderSide::Ask, quantity, Some(price))
            .await?;
        tracing::debug!("📝 Sell order {} placed: {} {} @ {}", order.uuid, market, quantity, price);
        Ok(order.uuid)
    }

    async fn place_market_sell(&self, market: &str, quantity: f64) -> ExchangeResult<String> {
        let order = self
            .client
            .place_order(market, OrderSide::Ask, quantity, None)
            .await?;
        tracing::debug!("📝 Market sell {} placed: {} {}", order.uuid, market, quantity);
        Ok(order.uuid)
    }

    async fn cancel(&self, order_id: &str) -> CancelOutcome {
        match self.client.cancel_order(order_id).await {
            Ok(_) => CancelOutcome::ok(),
            Err(e) => CancelOutcome::failed(e.to_string()),
        }
    }

    async fn order_status(&self, order_id: &str) -> ExchangeResult<OrderState> {
        Ok(self.client.get_order(order_id).await?.order_state())
    }

    async fn order_detail(&self, order_id: &str) -> ExchangeResult<OrderDetail> {
        Ok(self.client.get_order(order_id).await?.into_order().detail())
    }

    async fn holding_of(&self, market: &str) -> ExchangeResult<Holding> {
        let currency = currency_of(market);
        Ok(self
            .accounts()
            .await?
            .into_iter()
            .find(|a| a.currency == currency)
            .map(Account::into_holding)
            .unwrap_or_else(|| Holding::empty(market)))
    }

    async fn all_holdings(&self) -> ExchangeResult<HashMap<String, Holding>> {
        Ok(self
            .accounts()
            .await?
            .into_iter()
            .filter(Account::is_tradable)
            .map(Account::into_holding)
            .filter(|h| !h.is_empty())
            .map(|h| (h.market.clone(), h))
            .collect())
    }

    async fn all_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        Ok(self
            .client
            .get_open_orders()
            .await?
            .into_iter()
            .map(|o| o.into_order())
            .collect())
    }

    async fn balance(&self) -> ExchangeResult<f64> {
        Ok(self
            .accounts()
            .await?
            .iter()
            .find(|a| a.currency == QUOTE_CURRENCY)
            .map(|a| a.balance)
            .unwrap_or(0.0))
    }
}
