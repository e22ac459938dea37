pub mod candle;
pub mod exchange;
pub mod ids;
pub mod interval;

pub use candle::CandleRecord;
pub use exchange::Exchange;
pub use ids::TaskKey;
pub use interval::Interval;
