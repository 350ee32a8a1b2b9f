use crate::error::Error;
use serde::Deserialize;
use std::time::Duration;

/// A quota: at most `limit` requests within any trailing `window_millis`.
///
/// Policies are supplied on every check rather than stored, so a key can be moved to a different
/// policy at any time; previously recorded requests are simply counted against the new window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuotaPolicy {
    /// The total requests to be allowed within the window.
    pub limit: u64,
    /// Length of the trailing window in milliseconds.
    pub window_millis: u64,
}

impl QuotaPolicy {
    pub const fn new(limit: u64, window_millis: u64) -> Self {
        Self {
            limit,
            window_millis,
        }
    }

    /// Sub-millisecond precision in `window` is discarded.
    pub fn from_duration(limit: u64, window: Duration) -> Self {
        Self::new(limit, window.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis)
    }

    /// Both the limit and the window must be non-zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.limit == 0 || self.window_millis == 0 {
            return Err(Error::InvalidPolicy {
                limit: self.limit,
                window_millis: self.window_millis,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(QuotaPolicy::new(100, 60_000).validate().is_ok());
        assert!(matches!(
            QuotaPolicy::new(0, 60_000).validate(),
            Err(Error::InvalidPolicy { limit: 0, .. })
        ));
        assert!(matches!(
            QuotaPolicy::new(5, 0).validate(),
            Err(Error::InvalidPolicy {
                window_millis: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_from_duration_truncates() {
        let policy = QuotaPolicy::from_duration(10, Duration::from_micros(1_500_900));
        assert_eq!(policy.window_millis, 1_500);
        assert_eq!(policy.window(), Duration::from_millis(1_500));
    }
}
