pub mod candle;
pub mod clock;
pub mod timeframe;

// Re-export the candle types for convenient access (e.g. `use crate::market_data::BaseCandle`).
pub use candle::{AggregatedCandle, BaseCandle, CandleKey, TickRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use timeframe::{bucket_start, normalize_timeframe, timeframe_ms, TimeframeSpec};
