use crate::exchange::{ExchangeError, ExchangeResult, MarketData};
use crate::models::{Candle, Orderbook, OrderbookUnit, Ticker};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

/// Spread of the single synthetic order book level
const SYNTHETIC_SPREAD: f64 = 0.001;

const FILE_TIME_FORMAT: &str = "%Y%m%d%H%M";

/// `{market}_{unit}m_{start}_{end}.json`, the layout `load_dir` reads
pub fn candle_file_name(market: &str, unit: u32, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "{}_{}m_{}_{}.json",
        market,
        unit,
        start.format(FILE_TIME_FORMAT),
        end.format(FILE_TIME_FORMAT)
    )
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM` or RFC 3339 as UTC
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(naive.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|e| format!("invalid timestamp '{}': {}", input, e))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

/// Pre-loaded candles replayed against a movable clock.
///
/// Every query only sees candles stamped at or before the clock.
#[derive(Debug)]
pub struct HistoricalMarket {
    /// Oldest first
    series: HashMap<String, Vec<Candle>>,
    clock_ms: AtomicI64,
}

impl HistoricalMarket {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            series: HashMap::new(),
            clock_ms: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Add candles for a market; any order is accepted, duplicates collapse
    pub fn insert(&mut self, market: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        self.series.insert(market.to_string(), candles);
    }

    /// Load every `{market}_{unit}m_*.json` file in `dir`
    pub fn load_dir(dir: &Path, unit: u32) -> Result<Self> {
        let marker = format!("_{}m_", unit);
        let mut loaded: HashMap<String, Vec<Candle>> = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let Some((market, _)) = name.split_once(&marker) else {
                continue;
            };

            let json = std::fs::read_to_string(&path)?;
            let candles: Vec<Candle> = serde_json::from_str(&json)
                .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
            tracing::info!("📂 Loaded {} candles for {} from {}", candles.len(), market, name);
            loaded.entry(market.to_string()).or_default().extend(candles);
        }

        if loaded.is_empty() {
            return Err(format!("no {}-minute candle files in {}", unit, dir.display()).into());
        }

        let mut market = Self::new(Utc::now());
        for (name, candles) in loaded {
            market.insert(&name, candles);
        }
        if let Some((start, _)) = market.time_range() {
            market.set_time(start);
        }
        Ok(market)
    }

    pub fn retain_markets(&mut self, keep: &[String]) {
        self.series.retain(|market, _| keep.contains(market));
    }

    pub fn markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = self.series.keys().cloned().collect();
        markets.sort();
        markets
    }

    /// Earliest and latest candle across all markets
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.series.values().filter_map(|s| s.first()).map(|c| c.timestamp).min()?;
        let last = self.series.values().filter_map(|s| s.last()).map(|c| c.timestamp).max()?;
        Some((first, last))
    }

    pub fn set_time(&self, now: DateTime<Utc>) {
        self.clock_ms.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.clock_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Candles at or before `at`, oldest first
    fn visible(&self, market: &str, at: DateTime<Utc>) -> ExchangeResult<&[Candle]> {
        let series = self
            .series
            .get(market)
            .ok_or_else(|| ExchangeError::NoData(market.to_string()))?;
        let end = series.partition_point(|c| c.timestamp <= at);
        Ok(&series[..end])
    }

    fn value_24h(candles: &[Candle], now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::hours(24);
        candles
            .iter()
            .rev()
            .take_while(|c| c.timestamp > cutoff)
            .map(|c| c.value)
            .sum()
    }
}

#[async_trait]
impl MarketData for HistoricalMarket {
    async fn get_candles(
        &self,
        market: &str,
        count: usize,
        as_of: Option<DateTime<Utc>>,
        _unit_minutes: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let now = self.time();
        let at = as_of.map_or(now, |t| t.min(now));
        let visible = self.visible(market, at)?;

        Ok(visible.iter().rev().take(count).cloned().collect())
    }

    async fn get_ticker(&self, market: &str) -> ExchangeResult<Ticker> {
        let now = self.time();
        let visible = self.visible(market, now)?;
        let last = visible
            .last()
            .ok_or_else(|| ExchangeError::NoData(market.to_string()))?;

        Ok(Ticker {
            market: market.to_string(),
            trade_price: last.close,
            acc_trade_price_24h: Self::value_24h(visible, now),
            timestamp: last.timestamp,
        })
    }

    async fn get_orderbook(&self, market: &str) -> ExchangeResult<Orderbook> {
        let ticker = self.get_ticker(market).await?;
        let size = self
            .visible(market, self.time())?
            .last()
            .map(|c| c.volume)
            .unwrap_or_default();

        Ok(Orderbook {
            market: market.to_string(),
            units: vec![OrderbookUnit {
                ask_price: ticker.trade_price * (1.0 + SYNTHETIC_SPREAD),
                bid_price: ticker.trade_price * (1.0 - SYNTHETIC_SPREAD),
                ask_size: size,
                bid_size: size,
            }],
        })
    }

    async fn markets_by_volume(&self) -> ExchangeResult<Vec<String>> {
        let now = self.time();
        let mut ranked: Vec<(String, f64)> = self
            .series
            .keys()
            .filter_map(|market| {
                let visible = self.visible(market, now).ok()?;
                if visible.is_empty() {
                    return None;
                }
                Some((market.clone(), Self::value_24h(visible, now)))
            })
            .collect();

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(ranked.into_iter().map(|(market, _)| market).collect())
    }

    fn now(&self) -> DateTime<Utc> {
        self.time()
    }
}
