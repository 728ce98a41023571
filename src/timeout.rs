//! Deadline enforcement for blocking bus operations
//!
//! A hung peripheral (or a hung multiplexer) can stall an I2C transfer
//! indefinitely, and a transfer stalled inside a syscall cannot be interrupted
//! from safe code. The compromise made here is the same one tokio makes for
//! all blocking work: the operation runs on the blocking thread pool and the
//! caller races it against a timer. When the timer wins, the caller gets
//! [`TimeoutError`] and moves on; the operation itself is *abandoned*, not
//! killed.
//!
//! An abandoned operation may still complete later, which is why a timeout
//! must never be followed by quietly reusing the same device handle --
//! [`BusHandle`] enforces that by refusing further transactions until it is
//! given a fresh handle (see [`BusHandle::reset`]).
//!
//! No retries happen at this layer. Retry policy belongs to whoever owns the
//! sensor, because only they know whether a missed poll matters.
//!
//! [`BusHandle`]: crate::bus::BusHandle
//! [`BusHandle::reset`]: crate::bus::BusHandle::reset

use std::fmt;
use std::time::Duration;

use tokio::task;
use tokio::time;

/// A guarded operation outlived its deadline
///
/// The underlying operation was abandoned mid-flight, so the state of the
/// resource it was touching must be treated as unknown by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError
{
    limit: Duration,
}

impl TimeoutError
{
    /// The deadline the operation failed to meet
    pub fn limit(&self) -> Duration
    {
        self.limit
    }
}

impl fmt::Display for TimeoutError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "still pending after {:?}; the operation was abandoned and its resource is in an unknown state", self.limit)
    }
}

impl std::error::Error for TimeoutError {}

/// Run a blocking operation, giving it at most `limit` to complete
///
/// The operation is executed on the async runtime's blocking pool. If it
/// finishes in time its return value is handed back unchanged; if it panics,
/// the panic is resumed on the calling task. On deadline the call returns
/// [`TimeoutError`] promptly while the operation keeps running detached --
/// the caller must not touch the resource the operation owns until it has
/// been replaced or externally reset.
pub async fn run_with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, TimeoutError>
    where F: FnOnce() -> T + Send + 'static,
          T: Send + 'static,
{
    let pending = task::spawn_blocking(operation);

    match time::timeout(limit, pending).await {
        Ok(Ok(value)) => Ok(value),
        // The blocking task is never aborted by this module, so a join error
        // can only mean the operation panicked.
        Ok(Err(join_err)) => std::panic::resume_unwind(join_err.into_panic()),
        Err(_elapsed) => Err(TimeoutError { limit }),
    }
}
