// Technical indicators used by the entry/exit signals

pub mod moving_average;
pub mod volume;

pub use moving_average::sma_from_newest;
pub use volume::{volume_surge, VolumeSignal};
