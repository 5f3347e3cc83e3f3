//! Built-in strategies and the rolling-window indicators they use.

mod breakout;
mod indicators;
mod moving_average;

pub use breakout::BreakoutStrategy;
pub use indicators::{RollingHigh, RollingLow, Sma};
pub use moving_average::MovingAverageStrategy;
