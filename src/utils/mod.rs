//! # Utility Modules
//!
//! Supporting utilities shared by connections, servers and clients.
//!
//! ## Components
//! - **Backoff**: bounded exponential retry delays
//! - **Rate Limit**: lock-free token bucket
//! - **Logging**: structured logging bootstrap
//! - **Timeout**: default deadlines and async timeout wrappers
//! - **Metrics**: thread-safe observability counters

pub mod backoff;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod timeout;

pub use backoff::Backoff;
pub use metrics::{Metrics, MetricsSnapshot, Timer};
pub use rate_limit::RateLimiter;
