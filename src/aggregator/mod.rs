pub mod listeners;
pub mod tick_aggregator;
pub mod tick_buffer;

pub use listeners::{CandleListener, ListenerRegistry, Subscription};
pub use tick_aggregator::{AggregatorStats, TickAggregator};
pub use tick_buffer::{build_candles_from_ticks, TickBuffer, TickRejection};
