use crate::models::Candle;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Candles per surge cycle in `MarketScenario::SurgeBreakout`
pub const SURGE_CYCLE: usize = 180;
/// Offset in the cycle of the candle that closes with the breakout jump
pub const BREAKOUT_OFFSET: usize = 155;

const BUILD_UP_START: usize = 150;
const RALLY_END: usize = 170;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Choppy market pulled back toward the base price
    Sideways,
    /// ±1% swings every candle
    Volatile,
    /// Slow bleed, then a traded-value build-up, a breakout candle and a
    /// rally that retraces. Repeats every `SURGE_CYCLE` candles.
    SurgeBreakout,
}

impl std::str::FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uptrend" => Ok(Self::Uptrend),
            "downtrend" => Ok(Self::Downtrend),
            "sideways" => Ok(Self::Sideways),
            "volatile" => Ok(Self::Volatile),
            "surge" | "surge_breakout" => Ok(Self::SurgeBreakout),
            other => Err(format!("unknown scenario: {}", other)),
        }
    }
}

/// One candle's movement: relative drift, noise amplitude, volume factor
struct Step {
    drift: f64,
    noise: f64,
    volume: f64,
}

/// Generates reproducible candle series for backtests and demos
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 10_000.0,
            base_volume: 1_000.0,
        }
    }

    pub fn with_base_price(mut self, base_price: f64) -> Self {
        self.base_price = base_price;
        self
    }

    /// Generate oldest-first candles for `market`
    ///
    /// # Arguments
    /// * `scenario` - The market scenario to simulate
    /// * `start` - Timestamp of the first candle
    /// * `num_candles` - Number of candles to generate
    /// * `interval_minutes` - Minutes between candles
    pub fn generate(
        &mut self,
        market: &str,
        scenario: MarketScenario,
        start: DateTime<Utc>,
        num_candles: usize,
        interval_minutes: i64,
    ) -> Vec<Candle> {
        let per_day = 24.0 * 60.0 / interval_minutes.max(1) as f64;
        let mut candles = Vec::with_capacity(num_candles);
        let mut price = self.base_price;

        for i in 0..num_candles {
            let timestamp = start + Duration::minutes(i as i64 * interval_minutes);
            let step = match scenario {
                MarketScenario::Uptrend => Step { drift: 0.02 / per_day, noise: 0.001, volume: 1.0 },
                MarketScenario::Downtrend => Step { drift: -0.02 / per_day, noise: 0.001, volume: 1.0 },
                MarketScenario::Sideways => Step {
                    drift: (self.base_price - price) / price * 0.05,
                    noise: 0.003,
                    volume: 1.0,
                },
                MarketScenario::Volatile => Step { drift: 0.0, noise: 0.01, volume: 1.3 },
                MarketScenario::SurgeBreakout => surge_step(i % SURGE_CYCLE),
            };

            let open = price;
            price *= 1.0 + step.drift + self.rng.gen_range(-step.noise..step.noise);
            // never let the series collapse to zero
            price = price.max(self.base_price * 0.01);

            candles.push(self.create_candle(market, open, price, step.volume, timestamp));
        }

        candles
    }

    /// Create a candle moving from `open` to `close` with small wicks
    fn create_candle(
        &mut self,
        market: &str,
        open: f64,
        close: f64,
        volume_factor: f64,
        timestamp: DateTime<Utc>,
    ) -> Candle {
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..0.002));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..0.002));
        let volume = self.base_volume * volume_factor * self.rng.gen_range(0.9..1.1);

        Candle {
            market: market.to_string(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            value: close * volume,
        }
    }
}

fn surge_step(phase: usize) -> Step {
    match phase {
        p if p < BUILD_UP_START => Step { drift: -0.0004, noise: 0.0003, volume: 1.0 },
        p if p < BREAKOUT_OFFSET => Step { drift: -0.0004, noise: 0.0003, volume: 2.0 },
        p if p == BREAKOUT_OFFSET => Step { drift: 0.05, noise: 0.0003, volume: 2.0 },
        p if p == BREAKOUT_OFFSET + 1 => Step { drift: 0.003, noise: 0.0003, volume: 5.0 },
        p if p < RALLY_END => Step { drift: 0.003, noise: 0.0005, volume: 1.5 },
        _ => Step { drift: -0.004, noise: 0.0005, volume: 1.0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MaWindows, VolumeWindows};
    use crate::strategy::SignalEvaluator;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn newest_first(candles: &[Candle], upto: usize, count: usize) -> Vec<Candle> {
        candles[..=upto].iter().rev().take(count).cloned().collect()
    }

    #[test]
    fn test_uptrend_ends_higher() {
        let mut gen = SyntheticDataGenerator::new(42);
        let candles = gen.generate("KRW-BTC", MarketScenario::Uptrend, start(), 1440, 1);
        assert_eq!(candles.len(), 1440);
        assert!(candles.last().unwrap().close > candles[0].close);
    }

    #[test]
    fn test_downtrend_ends_lower() {
        let mut gen = SyntheticDataGenerator::new(42);
        let candles = gen.generate("KRW-BTC", MarketScenario::Downtrend, start(), 1440, 1);
        assert!(candles.last().unwrap().close < candles[0].close);
    }

    #[test]
    fn test_same_seed_same_series() {
        let a = SyntheticDataGenerator::new(7).generate("KRW-BTC", MarketScenario::Volatile, start(), 100, 1);
        let b = SyntheticDataGenerator::new(7).generate("KRW-BTC", MarketScenario::Volatile, start(), 100, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_candles_are_consistent() {
        let mut gen = SyntheticDataGenerator::new(3);
        let candles = gen.generate("KRW-ETH", MarketScenario::Sideways, start(), 200, 5);
        for (i, c) in candles.iter().enumerate() {
            assert_eq!(c.market, "KRW-ETH");
            assert_eq!(c.timestamp, start() + Duration::minutes(i as i64 * 5));
            assert!(c.high >= c.open.max(c.close));
            assert!(c.low <= c.open.min(c.close));
            assert!((c.value - c.close * c.volume).abs() < 1e-6);
        }
    }

    #[test]
    fn test_surge_breakout_produces_entry() {
        let mut gen = SyntheticDataGenerator::new(11);
        let candles = gen.generate("KRW-XRP", MarketScenario::SurgeBreakout, start(), 400, 1);
        let evaluator = SignalEvaluator::new(VolumeWindows::default(), MaWindows::default());
        let needed = evaluator.candles_needed();

        // the candle after the breakout close is the decision point
        let entry = BREAKOUT_OFFSET + 1;
        assert!(evaluator.entry_cross(&newest_first(&candles, entry, needed)).is_some());
        assert!(evaluator
            .entry_cross(&newest_first(&candles, SURGE_CYCLE + entry, needed))
            .is_some());

        // quiet bleed never triggers
        assert!(evaluator.entry_cross(&newest_first(&candles, 100, needed)).is_none());
    }

    #[test]
    fn test_parse_scenario() {
        assert_eq!("surge".parse::<MarketScenario>().unwrap(), MarketScenario::SurgeBreakout);
        assert!("sideways".parse::<MarketScenario>().is_ok());
        assert!("moon".parse::<MarketScenario>().is_err());
    }
}
