pub mod frame;
pub mod rate_limiter;
