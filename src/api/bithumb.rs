use crate::config::{ApiConfig, Credentials};
use crate::exchange::precision::format_decimal;
use crate::exchange::{ExchangeError, ExchangeResult, MarketData};
use crate::models::{
    market_for, Candle, Holding, Order, OrderSide, OrderState, OrderType, Orderbook, OrderbookUnit,
    Ticker, QUOTE_CURRENCY,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use governor::{Quota, RateLimiter};
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::{Client, Method};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Type alias for the rate limiter to simplify signatures
type BithumbRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Most candles the API returns per request
pub const MAX_CANDLES_PER_REQUEST: usize = 200;

// Points/reward balances show up in accounts but are not tradable
const NON_TRADABLE_CURRENCIES: &[&str] = &[QUOTE_CURRENCY, "P"];

/// Bithumb v1 REST client
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct BithumbClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    rate_limiter: Arc<BithumbRateLimiter>,
}

#[derive(Debug, Serialize)]
struct AuthClaims<'a> {
    access_key: &'a str,
    nonce: String,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct MarketInfo {
    pub market: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiCandle {
    pub market: String,
    pub candle_date_time_utc: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub opening_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub high_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub low_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub trade_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub candle_acc_trade_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub candle_acc_trade_volume: f64,
}

#[derive(Debug, Deserialize)]
pub struct ApiTicker {
    pub market: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub trade_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub acc_trade_price_24h: f64,
}

#[derive(Debug, Deserialize)]
pub struct ApiOrderbook {
    pub market: String,
    pub orderbook_units: Vec<ApiOrderbookUnit>,
}

#[derive(Debug, Deserialize)]
pub struct ApiOrderbookUnit {
    #[serde(deserialize_with = "lenient_f64")]
    pub ask_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub bid_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub ask_size: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub bid_size: f64,
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub currency: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub balance: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub locked: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub avg_buy_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ApiTrade {
    #[serde(deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub volume: f64,
}

#[derive(Debug, Deserialize)]
pub struct ApiOrder {
    pub uuid: String,
    pub side: String,
    pub ord_type: String,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub price: Option<f64>,
    pub state: String,
    #[serde(default)]
    pub market: String,
    pub created_at: Option<DateTime<chrono::FixedOffset>>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub executed_volume: Option<f64>,
    #[serde(default)]
    pub trades: Vec<ApiTrade>,
}

/// Accepts a JSON number or a numeric string
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    lenient_opt_f64(deserializer)?.ok_or_else(|| de::Error::custom("expected a number"))
}

fn lenient_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) if s.is_empty() => Ok(None),
        Some(Raw::Text(s)) => s.parse::<f64>().map(Some).map_err(de::Error::custom),
    }
}

impl ApiCandle {
    pub fn into_candle(self) -> ExchangeResult<Candle> {
        let naive = NaiveDateTime::parse_from_str(&self.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| ExchangeError::Parse(format!("{}: {}", self.candle_date_time_utc, e)))?;

        Ok(Candle {
            market: self.market,
            timestamp: naive.and_utc(),
            open: self.opening_price,
            high: self.high_price,
            low: self.low_price,
            close: self.trade_price,
            volume: self.candle_acc_trade_volume,
            value: self.candle_acc_trade_price,
        })
    }
}

impl ApiOrder {
    pub fn order_state(&self) -> OrderState {
        match self.state.as_str() {
            "done" => OrderState::Filled,
            "cancel" => OrderState::Canceled,
            _ => OrderState::Pending,
        }
    }

    /// Volume-weighted price of the recorded trades
    pub fn average_price(&self) -> Option<f64> {
        let volume: f64 = self.trades.iter().map(|t| t.volume).sum();
        if volume > 0.0 {
            let funds: f64 = self.trades.iter().map(|t| t.price * t.volume).sum();
            Some(funds / volume)
        } else {
            None
        }
    }

    pub fn into_order(self) -> Order {
        let state = self.order_state();
        let executed_price = self.average_price().or(if state == OrderState::Filled {
            self.price
        } else {
            None
        });

        Order {
            side: if self.side == "bid" {
                OrderSide::Bid
            } else {
                OrderSide::Ask
            },
            order_type: if self.ord_type == "limit" {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            price: self.price,
            volume: self.volume.unwrap_or(0.0),
            executed_volume: self.executed_volume.unwrap_or(0.0),
            executed_price,
            state,
            created_at: self
                .created_at
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            id: self.uuid,
            market: self.market,
        }
    }
}

impl Account {
    pub fn is_tradable(&self) -> bool {
        !NON_TRADABLE_CURRENCIES.contains(&self.currency.as_str())
    }

    pub fn into_holding(self) -> Holding {
        Holding {
            market: market_for(&self.currency),
            available: self.balance,
            reserved: self.locked,
            avg_buy_price: self.avg_buy_price.unwrap_or(0.0),
        }
    }
}

/// Build `k=v&k=v` without re-encoding; used for both the URL and the hash
fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

impl BithumbClient {
    pub fn new(api: &ApiConfig, credentials: Option<Credentials>) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;

        let burst = NonZeroU32::new(api.rate_limit)
            .ok_or_else(|| ExchangeError::InvalidOrder("rate_limit must be non-zero".into()))?;
        let period = Duration::from_millis(api.rate_limit_interval_ms.max(1)) / burst.get();
        let quota = Quota::with_period(period)
            .ok_or_else(|| ExchangeError::InvalidOrder("rate limit period is zero".into()))?
            .allow_burst(burst);

        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Bearer token for a private request. `query` is the url-encoded
    /// parameter string, hashed with SHA512 when present.
    fn auth_token(&self, query: Option<&str>) -> ExchangeResult<String> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Auth("API credentials are not configured".into()))?;

        let query_hash = query
            .filter(|q| !q.is_empty())
            .map(|q| hex::encode(Sha512::digest(q.as_bytes())));
        let claims = AuthClaims {
            access_key: &credentials.access_key,
            nonce: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            query_hash_alg: query_hash.as_ref().map(|_| "SHA512"),
            query_hash,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(credentials.secret_key.as_bytes()),
        )
        .map_err(|e| ExchangeError::Auth(e.to_string()))
    }

    async fn public_get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, endpoint);
        tracing::debug!("GET {}", endpoint);

        let response = self.client.get(&url).query(params).send().await?;
        Self::handle_response(response).await
    }

    async fn private_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        self.rate_limiter.until_ready().await;

        let query = build_query(params);
        let token = self.auth_token(Some(&query))?;
        let url = format!("{}{}", self.base_url, endpoint);
        tracing::debug!("{} (signed) {}", method, endpoint);

        let request = if method == Method::POST {
            let body: serde_json::Map<String, serde_json::Value> = params
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect();
            self.client.post(&url).json(&body)
        } else if query.is_empty() {
            self.client.request(method, &url)
        } else {
            self.client.request(method, format!("{}?{}", url, query))
        };

        let response = request.bearer_auth(token).send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                tracing::error!("Failed to parse response: {} - Body: {}", e, body);
                ExchangeError::Parse(e.to_string())
            });
        }

        let (name, message) = match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(parsed) => (parsed.error.name, parsed.error.message),
            Err(_) => (String::new(), body),
        };

        Err(match (status.as_u16(), name.as_str()) {
            (401, _) | (_, "jwt_verification") | (_, "invalid_access_key") => {
                ExchangeError::Auth(message)
            }
            (_, "order_not_found") => ExchangeError::OrderNotFound(message),
            (_, "insufficient_funds_bid") => ExchangeError::InsufficientBalance {
                needed: 0.0,
                available: 0.0,
            },
            (_, "insufficient_funds_ask") => ExchangeError::InsufficientHolding {
                market: String::new(),
                needed: 0.0,
                available: 0.0,
            },
            (status, _) => ExchangeError::Api { status, message },
        })
    }

    // ========================================================================
    // Public endpoints
    // ========================================================================

    pub async fn get_markets(&self) -> ExchangeResult<Vec<MarketInfo>> {
        self.public_get("/v1/market/all", &[("isDetails", "false".to_string())])
            .await
    }

    /// Minute candles, newest first. `to` is exclusive.
    pub async fn get_minute_candles(
        &self,
        market: &str,
        count: usize,
        to: Option<DateTime<Utc>>,
        unit: u32,
    ) -> ExchangeResult<Vec<ApiCandle>> {
        let mut params = vec![
            ("market", market.to_string()),
            ("count", count.min(MAX_CANDLES_PER_REQUEST).to_string()),
        ];
        if let Some(to) = to {
            params.push(("to", to.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
        }

        self.public_get(&format!("/v1/candles/minutes/{}", unit), &params)
            .await
    }

    pub async fn get_tickers(&self, markets: &[String]) -> ExchangeResult<Vec<ApiTicker>> {
        self.public_get("/v1/ticker", &[("markets", markets.join(","))])
            .await
    }

    pub async fn get_orderbooks(&self, markets: &[String]) -> ExchangeResult<Vec<ApiOrderbook>> {
        self.public_get("/v1/orderbook", &[("markets", markets.join(","))])
            .await
    }

    // ========================================================================
    // Private endpoints
    // ========================================================================

    pub async fn get_accounts(&self) -> ExchangeResult<Vec<Account>> {
        self.private_request(Method::GET, "/v1/accounts", &[]).await
    }

    pub async fn get_order(&self, uuid: &str) -> ExchangeResult<ApiOrder> {
        self.private_request(Method::GET, "/v1/order", &[("uuid", uuid.to_string())])
            .await
    }

    pub async fn get_open_orders(&self) -> ExchangeResult<Vec<ApiOrder>> {
        self.private_request(Method::GET, "/v1/orders", &[("state", "wait".to_string())])
            .await
    }

    /// Submit an order; `price` is `None` for market orders
    pub async fn place_order(
        &self,
        market: &str,
        side: OrderSide,
        volume: f64,
        price: Option<f64>,
    ) -> ExchangeResult<ApiOrder> {
        let side = match side {
            OrderSide::Bid => "bid",
            OrderSide::Ask => "ask",
        };
        let mut params = vec![
            ("market", market.to_string()),
            ("side", side.to_string()),
            ("volume", format_decimal(volume)),
        ];
        match price {
            Some(price) => {
                params.push(("price", format_decimal(price)));
                params.push(("ord_type", "limit".to_string()));
            }
            None => params.push(("ord_type", "market".to_string())),
        }

        self.private_request(Method::POST, "/v1/orders", &params).await
    }

    pub async fn cancel_order(&self, uuid: &str) -> ExchangeResult<ApiOrder> {
        self.private_request(Method::DELETE, "/v1/order", &[("uuid", uuid.to_string())])
            .await
    }
}

#[async_trait]
impl MarketData for BithumbClient {
    async fn get_candles(
        &self,
        market: &str,
        count: usize,
        as_of: Option<DateTime<Utc>>,
        unit_minutes: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        self.get_minute_candles(market, count, as_of, unit_minutes)
            .await?
            .into_iter()
            .map(ApiCandle::into_candle)
            .collect()
    }

    async fn get_ticker(&self, market: &str) -> ExchangeResult<Ticker> {
        let ticker = self
            .get_tickers(&[market.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::NoData(market.to_string()))?;

        Ok(Ticker {
            market: ticker.market,
            trade_price: ticker.trade_price,
            acc_trade_price_24h: ticker.acc_trade_price_24h,
            timestamp: Utc::now(),
        })
    }

    async fn get_orderbook(&self, market: &str) -> ExchangeResult<Orderbook> {
        let book = self
            .get_orderbooks(&[market.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::NoData(market.to_string()))?;

        Ok(Orderbook {
            market: book.market,
            units: book
                .orderbook_units
                .into_iter()
                .map(|u| OrderbookUnit {
                    ask_price: u.ask_price,
                    bid_price: u.bid_price,
                    ask_size: u.ask_size,
                    bid_size: u.bid_size,
                })
                .collect(),
        })
    }

    async fn markets_by_volume(&self) -> ExchangeResult<Vec<String>> {
        let prefix = format!("{}-", QUOTE_CURRENCY);
        let markets: Vec<String> = self
            .get_markets()
            .await?
            .into_iter()
            .map(|m| m.market)
            .filter(|m| m.starts_with(&prefix))
            .collect();
        if markets.is_empty() {
            return Ok(markets);
        }

        let mut tickers = self.get_tickers(&markets).await?;
        tickers.sort_by(|a, b| b.acc_trade_price_24h.total_cmp(&a.acc_trade_price_24h));
        Ok(tickers.into_iter().map(|t| t.market).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(url: &str, credentials: Option<Credentials>) -> BithumbClient {
        let api = ApiConfig {
            base_url: url.to_string(),
            ..ApiConfig::default()
        };
        BithumbClient::new(&api, credentials).unwrap()
    }

    fn credentials() -> Credentials {
        Credentials {
            access_key: "access".into(),
            secret_key: "secret".into(),
        }
    }

    #[test]
    fn test_build_query() {
        let query = build_query(&[("uuid", "abc".into()), ("state", "wait".into())]);
        assert_eq!(query, "uuid=abc&state=wait");
        assert_eq!(build_query(&[]), "");
    }

    #[test]
    fn test_auth_token_carries_query_hash() {
        let client = client_for("http://localhost", Some(credentials()));
        let token = client.auth_token(Some("uuid=abc")).unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let decoded = jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &jsonwebtoken::DecodingKey::from_secret(b"secret"),
            &validation,
        )
        .unwrap();

        let expected = hex::encode(Sha512::digest(b"uuid=abc"));
        assert_eq!(decoded.claims["access_key"], "access");
        assert_eq!(decoded.claims["query_hash"], expected.as_str());
        assert_eq!(decoded.claims["query_hash_alg"], "SHA512");
    }

    #[test]
    fn test_auth_requires_credentials() {
        let client = client_for("http://localhost", None);
        assert!(matches!(client.auth_token(None), Err(ExchangeError::Auth(_))));
    }

    #[test]
    fn test_order_conversion() {
        let raw = r#"{
            "uuid": "o-1", "side": "bid", "ord_type": "limit", "price": "100",
            "state": "done", "market": "KRW-BTC", "volume": "2", "executed_volume": "2",
            "created_at": "2024-01-01T09:00:00+09:00",
            "trades": [{"price": "99", "volume": "1"}, {"price": "101", "volume": "1"}]
        }"#;
        let order: ApiOrder = serde_json::from_str(raw).unwrap();
        let order = order.into_order();

        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.side, OrderSide::Bid);
        assert_eq!(order.executed_price, Some(100.0));
        assert_eq!(order.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_markets_by_volume_sorted() {
        let mut server = mockito::Server::new_async().await;
        let markets = server
            .mock("GET", "/v1/market/all")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"market":"KRW-BTC"},{"market":"KRW-ETH"},{"market":"BTC-ETH"}]"#)
            .create_async()
            .await;
        let tickers = server
            .mock("GET", "/v1/ticker")
            .match_query(Matcher::UrlEncoded("markets".into(), "KRW-BTC,KRW-ETH".into()))
            .with_status(200)
            .with_body(
                r#"[{"market":"KRW-BTC","trade_price":100.0,"acc_trade_price_24h":10.0},
                    {"market":"KRW-ETH","trade_price":50.0,"acc_trade_price_24h":20.0}]"#,
            )
            .create_async()
            .await;

        let client = client_for(&server.url(), None);
        let sorted = client.markets_by_volume().await.unwrap();
        assert_eq!(sorted, vec!["KRW-ETH".to_string(), "KRW-BTC".to_string()]);

        markets.assert_async().await;
        tickers.assert_async().await;
    }

    #[tokio::test]
    async fn test_candles_parse() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/candles/minutes/1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"market":"KRW-BTC","candle_date_time_utc":"2024-01-01T00:01:00",
                     "opening_price":100,"high_price":110,"low_price":95,"trade_price":105,
                     "candle_acc_trade_price":2100.5,"candle_acc_trade_volume":20}]"#,
            )
            .create_async()
            .await;

        let client = client_for(&server.url(), None);
        let candles = client.get_candles("KRW-BTC", 1, None, 1).await.unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[0].value, 2100.5);
    }

    #[tokio::test]
    async fn test_accounts_with_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/accounts")
            .match_header("authorization", Matcher::Regex("^Bearer .+".into()))
            .with_status(200)
            .with_body(
                r#"[{"currency":"KRW","balance":"50000","locked":"0","avg_buy_price":"0"},
                    {"currency":"BTC","balance":"5","locked":"0","avg_buy_price":"100"}]"#,
            )
            .create_async()
            .await;

        let client = client_for(&server.url(), Some(credentials()));
        let accounts = client.get_accounts().await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(!accounts[0].is_tradable());

        let holding = accounts.into_iter().nth(1).unwrap().into_holding();
        assert_eq!(holding.market, "KRW-BTC");
        assert_eq!(holding.total(), 5.0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_mapping() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/order")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":{"name":"order_not_found","message":"no such order"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/ticker")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let client = client_for(&server.url(), Some(credentials()));
        let err = client.get_order("missing").await.unwrap_err();
        assert!(matches!(err, ExchangeError::OrderNotFound(_)));

        let err = client.get_ticker("KRW-BTC").await.unwrap_err();
        assert!(err.is_transient());
    }
}
