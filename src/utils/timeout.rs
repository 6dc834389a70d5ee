//! Timeout defaults and async timeout wrappers.

use crate::error::{EngineError, Result};
use std::future::Future;
use std::time::Duration;

/// Dial timeout for outbound connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time without reads or writes before a connection is considered dead
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often the idle loop compares the last-active time against the idle timeout
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a single socket write
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause taken by a loop that found the rate limiter empty
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(100);

/// Pause taken by the accept loop after refusing a connection
pub const REFUSE_BACKOFF: Duration = Duration::from_millis(100);

/// Run `fut` with a deadline, mapping expiry to `on_elapsed`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration, on_elapsed: EngineError) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed),
    }
}
