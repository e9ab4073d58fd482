use crate::config::VolumeWindows;

/// Traded-value surge measured on a newest-first series
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSignal {
    /// Value of the newest candle
    pub current: f64,
    pub short_avg: f64,
    pub long_avg: f64,
    /// current / short_avg
    pub short_ratio: f64,
    /// short_avg / long_avg
    pub long_ratio: f64,
    pub fired: bool,
}

/// Minimum series length `volume_surge` needs
pub fn samples_needed(windows: &VolumeWindows) -> usize {
    windows.short + windows.long + 1
}

/// Compare the newest value against the `short` values before it, and those
/// against the `long` values before them.
///
/// Returns `None` when the series is too short or an average is zero or not
/// finite.
pub fn volume_surge(values: &[f64], windows: &VolumeWindows) -> Option<VolumeSignal> {
    if windows.short == 0 || windows.long == 0 || values.len() < samples_needed(windows) {
        return None;
    }

    let current = values[0];
    let short_window = &values[1..1 + windows.short];
    let long_window = &values[1 + windows.short..1 + windows.short + windows.long];

    let short_avg = short_window.iter().sum::<f64>() / windows.short as f64;
    let long_avg = long_window.iter().sum::<f64>() / windows.long as f64;

    let usable = |v: f64| v.is_finite() && v > 0.0;
    if !current.is_finite() || !usable(short_avg) || !usable(long_avg) {
        return None;
    }

    let fired = current > short_avg * windows.short_threshold
        && short_avg > long_avg * windows.long_threshold;

    Some(VolumeSignal {
        current,
        short_avg,
        long_avg,
        short_ratio: current / short_avg,
        long_ratio: short_avg / long_avg,
        fired,
    })
}
