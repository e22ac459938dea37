pub mod budget;
pub mod limiter;

pub use budget::RateLimitBudget;
pub use limiter::RateLimiter;
