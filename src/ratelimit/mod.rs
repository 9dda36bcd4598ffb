pub mod meter;
pub mod storage;

pub use meter::RateLimiter;
pub use storage::{MeterRow, MeterStorage, SqliteMeterStorage};
