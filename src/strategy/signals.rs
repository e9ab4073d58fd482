use crate::config::{MaWindows, VolumeWindows};
use crate::indicators::{sma_from_newest, volume, VolumeSignal};
use crate::models::{Candle, CandleOrder};
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossKind {
    /// Short MA crossed above the long MA
    Golden,
    /// Short MA crossed below the long MA
    Dead,
}

/// A moving-average crossover at one sample candle
#[derive(Debug, Clone, PartialEq)]
pub struct Cross {
    pub kind: CrossKind,
    pub at: DateTime<Utc>,
    pub short_ma: f64,
    pub long_ma: f64,
}

/// Entry/exit signals computed from a candle slice.
///
/// Slices are never mutated; when configured for oldest-first input they are
/// reversed into a local copy.
#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    volume: VolumeWindows,
    moving_average: MaWindows,
    order: CandleOrder,
}

impl SignalEvaluator {
    pub fn new(volume: VolumeWindows, moving_average: MaWindows) -> Self {
        Self {
            volume,
            moving_average,
            order: CandleOrder::NewestFirst,
        }
    }

    pub fn with_order(mut self, order: CandleOrder) -> Self {
        self.order = order;
        self
    }

    /// Candles to request so both signals can be evaluated
    pub fn candles_needed(&self) -> usize {
        // the cross needs the previous sample plus the skipped open candle
        volume::samples_needed(&self.volume).max(self.moving_average.long + 2)
    }

    fn newest_first<'a>(&self, candles: &'a [Candle]) -> Cow<'a, [Candle]> {
        match self.order {
            CandleOrder::NewestFirst => Cow::Borrowed(candles),
            CandleOrder::OldestFirst => Cow::Owned(candles.iter().rev().cloned().collect()),
        }
    }

    pub fn volume_surge(&self, candles: &[Candle]) -> Option<VolumeSignal> {
        let candles = self.newest_first(candles);
        let values: Vec<f64> = candles.iter().map(|c| c.value).collect();
        volume::volume_surge(&values, &self.volume)
    }

    /// Detect a crossover between the previous and the current sample.
    ///
    /// The newest candle is still forming, so the current sample is
    /// `candles[1..]` and the previous one `candles[2..]`.
    pub fn detect_cross(&self, candles: &[Candle]) -> Option<Cross> {
        let candles = self.newest_first(candles);
        let (short, long) = (self.moving_average.short, self.moving_average.long);
        if candles.len() < long + 2 {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let short_now = sma_from_newest(&closes, 1, short)?;
        let long_now = sma_from_newest(&closes, 1, long)?;
        let short_prev = sma_from_newest(&closes, 2, short)?;
        let long_prev = sma_from_newest(&closes, 2, long)?;

        let kind = if short_prev <= long_prev && short_now > long_now {
            CrossKind::Golden
        } else if short_prev >= long_prev && short_now < long_now {
            CrossKind::Dead
        } else {
            return None;
        };

        Some(Cross {
            kind,
            at: candles[1].timestamp,
            short_ma: short_now,
            long_ma: long_now,
        })
    }

    /// The golden cross behind an entry: it needs a fired volume surge at
    /// the same decision point
    pub fn entry_cross(&self, candles: &[Candle]) -> Option<Cross> {
        self.volume_surge(candles).filter(|v| v.fired)?;
        self.detect_cross(candles).filter(|cross| cross.kind == CrossKind::Golden)
    }
}

/// Remembers the last cross reported per market so the same crossover is
/// reported once even when its candle is evaluated in several cycles.
#[derive(Debug, Default)]
pub struct CrossLatch {
    last: HashMap<String, (CrossKind, DateTime<Utc>)>,
}

impl CrossLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time this cross is seen for the market
    pub fn accept(&mut self, market: &str, cross: &Cross) -> bool {
        let key = (cross.kind, cross.at);
        if self.last.get(market) == Some(&key) {
            return false;
        }
        self.last.insert(market.to_string(), key);
        true
    }

    pub fn forget(&mut self, market: &str) {
        self.last.remove(market);
    }
}
