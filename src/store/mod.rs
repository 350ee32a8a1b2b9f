#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default upper bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT_MILLIS: u64 = 50;

/// The state of a key's window immediately after one atomic check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Whether the event was recorded.
    pub admitted: bool,
    /// Events inside the window, including the new one if it was admitted.
    pub count: u64,
    /// Timestamp of the oldest event still inside the window, if any.
    pub oldest_millis: Option<u64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Protocol(String),
}

/// Describes a shared store able to run the sliding window check as one indivisible operation.
///
/// A store is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection managers already do so internally; there is
/// no need to wrap it twice.
#[async_trait]
pub trait WindowStore: Clone + Send + Sync {
    /// Atomically, with respect to every other call for the same key:
    ///
    /// 1. Discard events of `key` with a timestamp at or before `now_millis - window_millis`.
    /// 2. Count the remaining events.
    /// 3. If the count is below `limit`, record an event at `now_millis` (even if another event
    ///    already has that timestamp) and refresh the key's expiry to `window_millis`.
    ///
    /// A rejected event is never recorded. `limit` and `window_millis` are at least 1.
    async fn execute(
        &self,
        key: &str,
        limit: u64,
        window_millis: u64,
        now_millis: u64,
    ) -> Result<WindowSnapshot, StoreError>;
}
