//! Idempotency guard: `key -> first-seen` mapping with a TTL, de-duplicating
//! externally-retried webhooks before a pipeline execution is ever created.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use review_faults::{FaultCode, FaultController};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const LOCAL_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStatus {
    New,
    DuplicateRecent { first_seen_at: Option<DateTime<Utc>> },
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    async fn check_and_mark(&self, key: &str) -> IdempotencyStatus;
    fn size(&self) -> usize;
    fn backend_kind(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct Entry {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    count: u64,
}

/// In-memory backend: a FIFO-evicted map with a lazy TTL sweep performed
/// on every call, mirroring the teacher's preference for a single
/// `Mutex`-guarded struct over external actor machinery for process-local
/// state (see `bpi-merkle`'s plain owned-data API).
pub struct LocalIdempotencyGuard {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, Entry>>,
    order: Mutex<VecDeque<String>>,
}

impl LocalIdempotencyGuard {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
        }
    }

    fn sweep_expired(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        let ttl = self.ttl;
        entries.retain(|_, e| {
            now.signed_duration_since(e.first_seen).num_milliseconds() < ttl.as_millis() as i64
        });
    }
}

impl Default for LocalIdempotencyGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, LOCAL_MAX_ENTRIES)
    }
}

#[async_trait]
impl IdempotencyGuard for LocalIdempotencyGuard {
    async fn check_and_mark(&self, key: &str) -> IdempotencyStatus {
        let now = Utc::now();
        self.sweep_expired(now);

        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get_mut(key) {
            existing.last_seen = now;
            existing.count += 1;
            return IdempotencyStatus::DuplicateRecent {
                first_seen_at: Some(existing.first_seen),
            };
        }

        if entries.len() >= self.max_entries {
            let mut order = self.order.lock().unwrap();
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                first_seen: now,
                last_seen: now,
                count: 1,
            },
        );
        self.order.lock().unwrap().push_back(key.to_string());
        IdempotencyStatus::New
    }

    fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn backend_kind(&self) -> &'static str {
        "local"
    }
}

/// Shared backend: atomic set-if-absent against an external store (Redis),
/// with TTL in seconds. `first_seen_at` is approximate, derived from the
/// remaining TTL rather than a stored timestamp. On store unavailability
/// the guard fails open and reports `New` — spec.md §4.7 — so a momentary
/// outage never blocks webhook processing, it only risks a double-review.
pub struct SharedIdempotencyGuard {
    client: redis::Client,
    ttl: Duration,
    faults: Arc<FaultController>,
}

impl SharedIdempotencyGuard {
    pub fn new(url: &str, ttl: Duration, faults: Arc<FaultController>) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            ttl,
            faults,
        })
    }
}

#[async_trait]
impl IdempotencyGuard for SharedIdempotencyGuard {
    async fn check_and_mark(&self, key: &str) -> IdempotencyStatus {
        use redis::AsyncCommands;

        if self.faults.maybe_inject(FaultCode::SharedStoreUnavailable).is_err() {
            tracing::warn!("shared idempotency store fault injected, failing open");
            return IdempotencyStatus::New;
        }

        let attempt = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let set: bool = conn
                .set_nx(format!("idem:{key}"), Utc::now().timestamp_millis())
                .await?;
            if set {
                let _: () = conn
                    .expire(format!("idem:{key}"), self.ttl.as_secs() as i64)
                    .await?;
                Ok::<IdempotencyStatus, redis::RedisError>(IdempotencyStatus::New)
            } else {
                let ttl_remaining: i64 = conn.ttl(format!("idem:{key}")).await.unwrap_or(-1);
                let first_seen_at = if ttl_remaining >= 0 {
                    Some(Utc::now() - chrono::Duration::seconds(self.ttl.as_secs() as i64 - ttl_remaining))
                } else {
                    None
                };
                Ok(IdempotencyStatus::DuplicateRecent { first_seen_at })
            }
        }
        .await;

        match attempt {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(error = %err, "shared idempotency store unavailable, failing open");
                IdempotencyStatus::New
            }
        }
    }

    fn size(&self) -> usize {
        0
    }

    fn backend_kind(&self) -> &'static str {
        "shared"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_is_new_second_is_duplicate() {
        let guard = LocalIdempotencyGuard::default();
        let status1 = guard.check_and_mark("k1").await;
        assert_eq!(status1, IdempotencyStatus::New);
        let status2 = guard.check_and_mark("k1").await;
        assert!(matches!(status2, IdempotencyStatus::DuplicateRecent { .. }));
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let guard = LocalIdempotencyGuard::default();
        assert_eq!(guard.check_and_mark("a").await, IdempotencyStatus::New);
        assert_eq!(guard.check_and_mark("b").await, IdempotencyStatus::New);
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_new_again() {
        let guard = LocalIdempotencyGuard::new(Duration::from_millis(10), 10);
        guard.check_and_mark("k").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = guard.check_and_mark("k").await;
        assert_eq!(status, IdempotencyStatus::New);
    }

    #[tokio::test]
    async fn fifo_eviction_keeps_size_bounded() {
        let guard = LocalIdempotencyGuard::new(DEFAULT_TTL, 3);
        for i in 0..10 {
            guard.check_and_mark(&format!("k{i}")).await;
        }
        assert!(guard.size() <= 3);
    }
}
