/// SMA of a newest-first series, starting `skip` samples back from the newest.
///
/// `sma_from_newest(closes, 1, 5)` averages `closes[1..6]`.
pub fn sma_from_newest(values: &[f64], skip: usize, period: usize) -> Option<f64> {
    if period == 0 || values.len() < skip + period {
        return None;
    }

    let window = &values[skip..skip + period];
    let sma = window.iter().sum::<f64>() / period as f64;
    sma.is_finite().then_some(sma)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![108.0, 106.0, 104.0, 102.0, 100.0];
        assert_eq!(sma_from_newest(&prices, 0, 5), Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        assert!(sma_from_newest(&prices, 0, 5).is_none());
        assert!(sma_from_newest(&prices, 0, 0).is_none());
    }

    #[test]
    fn test_sma_from_newest_skips_open_candle() {
        // newest first: 999 is the still-open candle
        let closes = vec![999.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(sma_from_newest(&closes, 1, 2), Some(15.0));
        assert_eq!(sma_from_newest(&closes, 2, 3), Some(30.0));
        assert!(sma_from_newest(&closes, 2, 4).is_none());
    }
}
