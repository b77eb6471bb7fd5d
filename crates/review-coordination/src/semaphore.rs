//! Two-level semaphore: bounded concurrent capacity with `try_acquire`
//! only — no waiting queue. Two instances are constructed at startup, one
//! bounding concurrent pipelines, one bounding concurrent LLM calls.

use async_trait::async_trait;
use review_faults::{FaultCode, FaultController};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSnapshot {
    pub in_flight: i64,
    pub available: i64,
    pub max_permits: i64,
    pub peak: i64,
}

#[async_trait]
pub trait PermitSemaphore: Send + Sync {
    async fn try_acquire(&self) -> bool;
    async fn release(&self);
    fn snapshot(&self) -> SemaphoreSnapshot;
    fn backend_kind(&self) -> &'static str;
}

/// Local counter backend: an atomic in-flight count bounded by
/// `max_permits`, with a monotone peak tracker for the metrics snapshot.
pub struct LocalSemaphore {
    max_permits: i64,
    in_flight: AtomicI64,
    peak: AtomicI64,
    faults: Arc<FaultController>,
}

impl LocalSemaphore {
    pub fn new(max_permits: i64, faults: Arc<FaultController>) -> Self {
        Self {
            max_permits,
            in_flight: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            faults,
        }
    }
}

#[async_trait]
impl PermitSemaphore for LocalSemaphore {
    async fn try_acquire(&self) -> bool {
        loop {
            let current = self.in_flight.load(Ordering::SeqCst);
            if current >= self.max_permits {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.peak.fetch_max(current + 1, Ordering::SeqCst);
                return true;
            }
        }
    }

    async fn release(&self) {
        if self.faults.maybe_inject(FaultCode::SemaphoreLeakSimulation).is_err() {
            tracing::warn!("semaphore release fault injected, simulating a leaked permit");
            return;
        }
        loop {
            let current = self.in_flight.load(Ordering::SeqCst);
            if current <= 0 {
                return;
            }
            if self
                .in_flight
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    fn snapshot(&self) -> SemaphoreSnapshot {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        SemaphoreSnapshot {
            in_flight,
            available: self.max_permits - in_flight,
            max_permits: self.max_permits,
            peak: self.peak.load(Ordering::SeqCst),
        }
    }

    fn backend_kind(&self) -> &'static str {
        "local"
    }
}

/// Shared backend: an atomic compare-and-increment against an external
/// store, with a 5-minute heartbeat TTL refreshed on every successful
/// acquire so a crashed holder's permit eventually expires. On store
/// unavailability the call fails open (spec.md §7's "fail-open
/// (in-memory backends)" policy), since a momentary outage must not wedge
/// the whole pipeline shut.
pub struct SharedSemaphore {
    client: redis::Client,
    key: String,
    max_permits: i64,
    faults: Arc<FaultController>,
}

const ACQUIRE_SCRIPT: &str = r#"
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
if cur < tonumber(ARGV[1]) then
    redis.call('INCR', KEYS[1])
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
if cur > 0 then
    redis.call('DECR', KEYS[1])
else
    redis.call('SET', KEYS[1], 0)
end
return 1
"#;

impl SharedSemaphore {
    pub fn new(url: &str, key: &str, max_permits: i64, faults: Arc<FaultController>) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            key: key.to_string(),
            max_permits,
            faults,
        })
    }
}

#[async_trait]
impl PermitSemaphore for SharedSemaphore {
    async fn try_acquire(&self) -> bool {
        if self.faults.maybe_inject(FaultCode::SharedStoreUnavailable).is_err() {
            tracing::warn!("shared semaphore store fault injected, failing open");
            return true;
        }

        let attempt = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let acquired: i64 = redis::Script::new(ACQUIRE_SCRIPT)
                .key(&self.key)
                .arg(self.max_permits)
                .arg(300_i64)
                .invoke_async(&mut conn)
                .await?;
            Ok::<bool, redis::RedisError>(acquired == 1)
        }
        .await;

        match attempt {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::warn!(error = %err, "shared semaphore store unavailable, failing open");
                true
            }
        }
    }

    async fn release(&self) {
        if self.faults.maybe_inject(FaultCode::SemaphoreLeakSimulation).is_err() {
            tracing::warn!("shared semaphore release fault injected, simulating a leaked permit");
            return;
        }

        let attempt = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(&self.key)
                .invoke_async(&mut conn)
                .await?;
            Ok::<(), redis::RedisError>(())
        }
        .await;
        if let Err(err) = attempt {
            tracing::warn!(error = %err, "shared semaphore release failed");
        }
    }

    fn snapshot(&self) -> SemaphoreSnapshot {
        // A correct snapshot requires a synchronous round trip this trait
        // doesn't offer; the metrics snapshot (C15) reads the local
        // fallback counters instead whenever a shared backend is active.
        SemaphoreSnapshot {
            in_flight: 0,
            available: self.max_permits,
            max_permits: self.max_permits,
            peak: 0,
        }
    }

    fn backend_kind(&self) -> &'static str {
        "shared"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_faults::Trigger;

    fn disabled_faults() -> Arc<FaultController> {
        Arc::new(FaultController::disabled())
    }

    #[tokio::test]
    async fn acquire_up_to_max_then_refuses() {
        let sem = LocalSemaphore::new(2, disabled_faults());
        assert!(sem.try_acquire().await);
        assert!(sem.try_acquire().await);
        assert!(!sem.try_acquire().await);
    }

    #[tokio::test]
    async fn release_frees_a_permit() {
        let sem = LocalSemaphore::new(1, disabled_faults());
        assert!(sem.try_acquire().await);
        assert!(!sem.try_acquire().await);
        sem.release().await;
        assert!(sem.try_acquire().await);
    }

    #[tokio::test]
    async fn release_never_goes_below_zero() {
        let sem = LocalSemaphore::new(1, disabled_faults());
        sem.release().await;
        sem.release().await;
        let snap = sem.snapshot();
        assert!(snap.in_flight >= 0);
    }

    #[tokio::test]
    async fn snapshot_conserves_in_flight_plus_available() {
        let sem = LocalSemaphore::new(5, disabled_faults());
        sem.try_acquire().await;
        sem.try_acquire().await;
        let snap = sem.snapshot();
        assert_eq!(snap.in_flight + snap.available, snap.max_permits);
    }

    #[tokio::test]
    async fn peak_tracks_the_high_water_mark() {
        let sem = LocalSemaphore::new(3, disabled_faults());
        sem.try_acquire().await;
        sem.try_acquire().await;
        sem.release().await;
        sem.release().await;
        assert_eq!(sem.snapshot().peak, 2);
    }

    #[tokio::test]
    async fn injected_leak_fault_skips_the_release() {
        let faults = Arc::new(FaultController::new(true));
        faults.configure(FaultCode::SemaphoreLeakSimulation, Trigger::Always);
        let sem = LocalSemaphore::new(1, faults);
        assert!(sem.try_acquire().await);
        sem.release().await;
        assert!(!sem.try_acquire().await, "release should have been a no-op");
    }
}
