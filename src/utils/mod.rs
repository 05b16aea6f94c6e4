pub mod math;
pub mod rate_limiter;

pub use math::*;
pub use rate_limiter::RateLimiter;
