pub mod aggregator;
pub mod candle_relay;
pub mod window_store;

pub use aggregator::CandleAggregator;
pub use candle_relay::{run_candle_service, CandleRelay};
pub use window_store::WindowStore;
