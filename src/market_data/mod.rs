pub mod aggregator;
pub mod candle_builder;
pub mod feed;

pub use aggregator::{AggregationCoordinator, AggregationStats, LateTickPolicy, TickOutcome};
pub use candle_builder::CandleBuilder;
