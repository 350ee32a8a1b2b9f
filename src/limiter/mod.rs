use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::middleware::builder::HeaderCompatibleOutput;
use crate::policy::QuotaPolicy;
use crate::store::{WindowSnapshot, WindowStore};

/// The outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    /// Number of requests that will be permitted until the oldest counted request expires.
    pub remaining: u64,
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Unix timestamp (ms) at which the oldest counted request leaves the window.
    pub reset_millis: u64,
    /// Unix timestamp (ms) the decision was made at.
    pub issued_at_millis: u64,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    pub fn is_rejected(&self) -> bool {
        !self.admitted
    }

    /// Milliseconds from the decision until [Decision::reset_millis].
    pub fn millis_until_reset(&self) -> u64 {
        self.reset_millis.saturating_sub(self.issued_at_millis)
    }
}

impl HeaderCompatibleOutput for Decision {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the reset (rounded upwards, so that a slot is guaranteed to be free after
    /// waiting for the duration).
    fn seconds_until_reset(&self) -> u64 {
        (self.millis_until_reset() as f64 / 1000f64).ceil() as u64
    }
}

/// Sliding window admission control over a shared [WindowStore].
///
/// The engine keeps no state of its own: every decision is a function of the key, the policy,
/// the clock and whatever the store holds, so any number of engines on any number of hosts can
/// share one store.
#[derive(Debug, Clone)]
pub struct RateLimiterEngine<S, C = SystemClock> {
    store: S,
    clock: C,
}

impl<S: WindowStore> RateLimiterEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<S: WindowStore, C: Clock> RateLimiterEngine<S, C> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decide whether one more request for `key` fits in `policy`.
    ///
    /// Over quota is not an error: it is reported as a [Decision] with `admitted == false`, and
    /// does not consume a slot. Store failures are returned as-is, never retried and never turned
    /// into an admission or rejection.
    pub async fn check(&self, key: &str, policy: &QuotaPolicy) -> Result<Decision, Error> {
        policy.validate()?;
        let now = self.clock.now_millis();
        let snapshot = self
            .store
            .execute(key, policy.limit, policy.window_millis, now)
            .await
            .map_err(|e| {
                let e = Error::from(e);
                match &e {
                    Error::StoreProtocol(_) => log::error!("Rate limit check for {key} failed: {e}"),
                    _ => log::warn!("Rate limit check for {key} failed: {e}"),
                }
                e
            })?;
        let decision = decide(policy, now, snapshot).map_err(|e| {
            log::error!("Rate limit check for {key} failed: {e}");
            e
        })?;
        log::debug!(
            "Rate limit {key}: admitted={} remaining={}/{} reset={}",
            decision.admitted,
            decision.remaining,
            decision.limit,
            decision.reset_millis
        );
        Ok(decision)
    }
}

fn decide(policy: &QuotaPolicy, now: u64, snapshot: WindowSnapshot) -> Result<Decision, Error> {
    if snapshot.admitted
        && (snapshot.count == 0 || snapshot.count > policy.limit || snapshot.oldest_millis.is_none())
    {
        return Err(Error::StoreProtocol(format!(
            "store admitted a request with count {} (limit {}) and oldest event {:?}",
            snapshot.count, policy.limit, snapshot.oldest_millis
        )));
    }
    let reset_from = snapshot.oldest_millis.unwrap_or(now);
    Ok(Decision {
        admitted: snapshot.admitted,
        remaining: policy.limit.saturating_sub(snapshot.count),
        limit: policy.limit,
        reset_millis: reset_from.saturating_add(policy.window_millis),
        issued_at_millis: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::InMemoryWindowStore;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::Arc;

    const MINUTE: u64 = 60_000;

    fn engine(start: u64) -> (RateLimiterEngine<InMemoryWindowStore, ManualClock>, ManualClock) {
        let clock = ManualClock::new(start);
        let store = InMemoryWindowStore::builder().with_gc_interval(None).build();
        (RateLimiterEngine::with_clock(store, clock.clone()), clock)
    }

    #[actix_web::test]
    async fn test_first_limit_calls_admitted() {
        let (engine, clock) = engine(0);
        let policy = QuotaPolicy::new(100, MINUTE);
        for i in 0..100 {
            let decision = engine.check("KEY1", &policy).await.unwrap();
            assert!(decision.is_admitted());
            assert_eq!(decision.remaining, 99 - i);
            assert_eq!(decision.limit, 100);
        }
        clock.set(500);
        let decision = engine.check("KEY1", &policy).await.unwrap();
        assert!(decision.is_rejected());
        assert_eq!(decision.remaining, 0);
    }

    #[actix_web::test]
    async fn test_new_key() {
        let (engine, _) = engine(1_000);
        let decision = engine
            .check("never-seen", &QuotaPolicy::new(10, MINUTE))
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision {
                admitted: true,
                remaining: 9,
                limit: 10,
                reset_millis: 1_000 + MINUTE,
                issued_at_millis: 1_000,
            }
        );
    }

    #[actix_web::test]
    async fn test_window_slides() {
        let (engine, clock) = engine(0);
        let policy = QuotaPolicy::new(100, MINUTE);
        // Call 1 at t=0, calls 2..100 at t=1..99
        for t in 0..100 {
            clock.set(t);
            assert!(engine.check("KEY1", &policy).await.unwrap().admitted);
        }
        clock.set(500);
        assert!(engine.check("KEY1", &policy).await.unwrap().is_rejected());
        // Events at or before now - window have left: t=0 and t=1
        clock.set(MINUTE + 1);
        let decision = engine.check("KEY1", &policy).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_millis, 2 + MINUTE);
    }

    #[actix_web::test]
    async fn test_no_burst_at_boundary() {
        let (engine, clock) = engine(0);
        let policy = QuotaPolicy::new(10, MINUTE);
        clock.set(MINUTE - 1);
        for _ in 0..10 {
            assert!(engine.check("KEY1", &policy).await.unwrap().admitted);
        }
        // A fixed window would reset here and admit another 10
        clock.set(MINUTE + 1);
        for _ in 0..10 {
            assert!(engine.check("KEY1", &policy).await.unwrap().is_rejected());
        }
        // Only once the first burst has left the window is there room again
        clock.set(2 * MINUTE - 1);
        assert!(engine.check("KEY1", &policy).await.unwrap().admitted);
    }

    #[actix_web::test]
    async fn test_rejection_does_not_consume_a_slot() {
        let (engine, clock) = engine(0);
        let policy = QuotaPolicy::new(3, MINUTE);
        for _ in 0..3 {
            engine.check("KEY1", &policy).await.unwrap();
        }
        for _ in 0..50 {
            let decision = engine.check("KEY1", &policy).await.unwrap();
            assert!(decision.is_rejected());
            assert_eq!(decision.remaining, 0);
        }
        // Had the rejections been recorded, the window would still be full
        clock.set(MINUTE);
        let decision = engine.check("KEY1", &policy).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 2);
    }

    #[actix_web::test]
    async fn test_reset_millis() {
        let (engine, clock) = engine(10_000);
        let policy = QuotaPolicy::new(3, MINUTE);
        for _ in 0..3 {
            engine.check("KEY1", &policy).await.unwrap();
            clock.advance(1_000);
        }
        let decision = engine.check("KEY1", &policy).await.unwrap();
        assert!(decision.is_rejected());
        assert_eq!(decision.reset_millis, 10_000 + MINUTE);
        assert_eq!(decision.issued_at_millis, 13_000);
        assert_eq!(decision.millis_until_reset(), MINUTE - 3_000);
        assert_eq!(decision.seconds_until_reset(), 57);
    }

    #[actix_web::test]
    async fn test_keys_are_independent() {
        let (engine, _) = engine(0);
        let policy = QuotaPolicy::new(2, MINUTE);
        for _ in 0..5 {
            engine.check("KEY_A", &policy).await.unwrap();
        }
        assert!(engine.check("KEY_A", &policy).await.unwrap().is_rejected());
        let decision = engine.check("KEY_B", &policy).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 1);
    }

    #[actix_web::test]
    async fn test_policy_change_applies_immediately() {
        let (engine, clock) = engine(0);
        for _ in 0..5 {
            engine
                .check("KEY1", &QuotaPolicy::new(10, MINUTE))
                .await
                .unwrap();
        }
        // Lowering the limit below the recorded count rejects straight away
        let decision = engine
            .check("KEY1", &QuotaPolicy::new(3, MINUTE))
            .await
            .unwrap();
        assert!(decision.is_rejected());
        assert_eq!(decision.remaining, 0);
        // Shrinking the window reinterprets the recorded events against it
        clock.set(1_000);
        let decision = engine
            .check("KEY1", &QuotaPolicy::new(3, 1_000))
            .await
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 2);
    }

    #[actix_web::test]
    async fn test_invalid_policy() {
        let (engine, _) = engine(0);
        for policy in [QuotaPolicy::new(0, MINUTE), QuotaPolicy::new(5, 0)] {
            assert!(matches!(
                engine.check("KEY1", &policy).await,
                Err(Error::InvalidPolicy { .. })
            ));
        }
    }

    #[derive(Clone)]
    struct FixedStore(Arc<dyn Fn() -> Result<WindowSnapshot, StoreError> + Send + Sync>);

    #[async_trait]
    impl WindowStore for FixedStore {
        async fn execute(
            &self,
            _key: &str,
            _limit: u64,
            _window_millis: u64,
            _now_millis: u64,
        ) -> Result<WindowSnapshot, StoreError> {
            (self.0)()
        }
    }

    #[actix_web::test]
    async fn test_store_errors_are_surfaced() {
        let policy = QuotaPolicy::new(5, MINUTE);

        let engine = RateLimiterEngine::new(FixedStore(Arc::new(|| {
            Err(StoreError::Timeout(std::time::Duration::from_millis(50)))
        })));
        assert!(engine.check("KEY1", &policy).await.unwrap_err().is_store_unavailable());

        let engine = RateLimiterEngine::new(FixedStore(Arc::new(|| {
            Err(StoreError::Protocol("garbage".to_string()))
        })));
        assert!(matches!(
            engine.check("KEY1", &policy).await,
            Err(Error::StoreProtocol(_))
        ));
    }

    #[actix_web::test]
    async fn test_inconsistent_snapshot_is_protocol_error() {
        let policy = QuotaPolicy::new(5, MINUTE);
        let engine = RateLimiterEngine::new(FixedStore(Arc::new(|| {
            Ok(WindowSnapshot {
                admitted: true,
                count: 6,
                oldest_millis: Some(0),
            })
        })));
        assert!(matches!(
            engine.check("KEY1", &policy).await,
            Err(Error::StoreProtocol(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let (engine, _) = engine(0);
        let engine = Arc::new(engine);
        let policy = QuotaPolicy::new(50, MINUTE);
        let handles: Vec<_> = (0..400)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.check("KEY1", &policy).await.unwrap() })
            })
            .collect();
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }
}
