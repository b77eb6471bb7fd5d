//! Read-only observability snapshot. Counters are lock-free atomics
//! updated by the orchestrator as an execution proceeds; the snapshot
//! function only aggregates, it never mutates.

use prometheus::{Counter, Registry};
use review_coordination::{PermitSemaphore, SemaphoreSnapshot as CoordinationSnapshot};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    SingleInstance,
    Distributed,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedStoreStatus {
    pub enabled: bool,
    pub healthy: bool,
    pub mode: StoreMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemaphoreStatus {
    pub in_flight: i64,
    pub peak: i64,
    pub available: i64,
    pub waiting: u64,
}

impl From<CoordinationSnapshot> for SemaphoreStatus {
    fn from(s: CoordinationSnapshot) -> Self {
        Self {
            in_flight: s.in_flight,
            peak: s.peak,
            available: s.available,
            waiting: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdempotencyStatus {
    pub size: usize,
    pub max_entries: usize,
    pub ttl_seconds: u64,
    pub backend_kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub shared_store: SharedStoreStatus,
    pub path_counters: Vec<(String, u64)>,
    pub load_shed_count: u64,
    pub duplicate_count: u64,
    pub llm_invocation_count: u64,
    pub llm_fallback_count: u64,
    pub llm_fallback_rate: f64,
    pub pipeline_semaphore: SemaphoreStatus,
    pub llm_semaphore: SemaphoreStatus,
    pub idempotency: IdempotencyStatus,
}

/// Process-wide counters plus a Prometheus registry they're mirrored into.
/// The orchestrator holds one instance in an `Arc` and calls the
/// `record_*` methods from every code path that needs to move a counter;
/// `snapshot` is the only reader.
pub struct MetricsRegistry {
    started_at: Instant,
    path_counters: Vec<(&'static str, AtomicU64)>,
    load_shed_count: AtomicU64,
    duplicate_count: AtomicU64,
    llm_invocation_count: AtomicU64,
    llm_fallback_count: AtomicU64,
    registry: Registry,
    prom_load_shed: Counter,
    prom_duplicate: Counter,
    prom_llm_invocations: Counter,
    prom_llm_fallbacks: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let prom_load_shed =
            Counter::new("review_load_shed_total", "Webhooks rejected for lack of a pipeline permit").unwrap();
        let prom_duplicate =
            Counter::new("review_duplicate_total", "Webhooks rejected as idempotent duplicates").unwrap();
        let prom_llm_invocations =
            Counter::new("review_llm_invocations_total", "LLM collaborator calls attempted").unwrap();
        let prom_llm_fallbacks =
            Counter::new("review_llm_fallbacks_total", "Reviews produced by the deterministic fallback").unwrap();

        registry.register(Box::new(prom_load_shed.clone())).unwrap();
        registry.register(Box::new(prom_duplicate.clone())).unwrap();
        registry.register(Box::new(prom_llm_invocations.clone())).unwrap();
        registry.register(Box::new(prom_llm_fallbacks.clone())).unwrap();

        Arc::new(Self {
            started_at: Instant::now(),
            path_counters: review_checks::VALID_PATHS
                .iter()
                .map(|p| (*p, AtomicU64::new(0)))
                .collect(),
            load_shed_count: AtomicU64::new(0),
            duplicate_count: AtomicU64::new(0),
            llm_invocation_count: AtomicU64::new(0),
            llm_fallback_count: AtomicU64::new(0),
            registry,
            prom_load_shed,
            prom_duplicate,
            prom_llm_invocations,
            prom_llm_fallbacks,
        })
    }

    pub fn record_path(&self, path: &str) {
        if let Some((_, counter)) = self.path_counters.iter().find(|(p, _)| *p == path) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_load_shed(&self) {
        self.load_shed_count.fetch_add(1, Ordering::Relaxed);
        self.prom_load_shed.inc();
    }

    pub fn record_duplicate(&self) {
        self.duplicate_count.fetch_add(1, Ordering::Relaxed);
        self.prom_duplicate.inc();
    }

    pub fn record_llm_invocation(&self) {
        self.llm_invocation_count.fetch_add(1, Ordering::Relaxed);
        self.prom_llm_invocations.inc();
    }

    pub fn record_llm_fallback(&self) {
        self.llm_fallback_count.fetch_add(1, Ordering::Relaxed);
        self.prom_llm_fallbacks.inc();
    }

    pub fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(
        &self,
        shared_store: SharedStoreStatus,
        pipeline_semaphore: &dyn PermitSemaphore,
        llm_semaphore: &dyn PermitSemaphore,
        idempotency: IdempotencyStatus,
    ) -> MetricsSnapshot {
        let invocations = self.llm_invocation_count.load(Ordering::Relaxed);
        let fallbacks = self.llm_fallback_count.load(Ordering::Relaxed);
        let fallback_rate = if invocations == 0 {
            0.0
        } else {
            fallbacks as f64 / invocations as f64
        };

        MetricsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            shared_store,
            path_counters: self
                .path_counters
                .iter()
                .map(|(p, c)| (p.to_string(), c.load(Ordering::Relaxed)))
                .collect(),
            load_shed_count: self.load_shed_count.load(Ordering::Relaxed),
            duplicate_count: self.duplicate_count.load(Ordering::Relaxed),
            llm_invocation_count: invocations,
            llm_fallback_count: fallbacks,
            llm_fallback_rate: fallback_rate,
            pipeline_semaphore: pipeline_semaphore.snapshot().into(),
            llm_semaphore: llm_semaphore.snapshot().into(),
            idempotency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_coordination::LocalSemaphore;
    use review_faults::FaultController;

    fn disabled_faults() -> Arc<FaultController> {
        Arc::new(FaultController::disabled())
    }

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = MetricsRegistry::new();
        metrics.record_load_shed();
        metrics.record_duplicate();
        metrics.record_llm_invocation();
        metrics.record_llm_fallback();

        let pipeline = LocalSemaphore::new(10, disabled_faults());
        let llm = LocalSemaphore::new(3, disabled_faults());
        let snapshot = metrics.snapshot(
            SharedStoreStatus { enabled: false, healthy: true, mode: StoreMode::SingleInstance },
            &pipeline,
            &llm,
            IdempotencyStatus { size: 0, max_entries: 1000, ttl_seconds: 3600, backend_kind: "local" },
        );

        assert_eq!(snapshot.load_shed_count, 1);
        assert_eq!(snapshot.duplicate_count, 1);
        assert_eq!(snapshot.llm_invocation_count, 1);
        assert_eq!(snapshot.llm_fallback_count, 1);
        assert_eq!(snapshot.llm_fallback_rate, 1.0);
    }

    #[test]
    fn fallback_rate_is_zero_with_no_invocations() {
        let metrics = MetricsRegistry::new();
        let pipeline = LocalSemaphore::new(10, disabled_faults());
        let llm = LocalSemaphore::new(3, disabled_faults());
        let snapshot = metrics.snapshot(
            SharedStoreStatus { enabled: false, healthy: true, mode: StoreMode::SingleInstance },
            &pipeline,
            &llm,
            IdempotencyStatus { size: 0, max_entries: 1000, ttl_seconds: 3600, backend_kind: "local" },
        );
        assert_eq!(snapshot.llm_fallback_rate, 0.0);
    }

    #[test]
    fn path_counters_cover_every_valid_path() {
        let metrics = MetricsRegistry::new();
        for path in review_checks::VALID_PATHS {
            metrics.record_path(path);
        }
        let pipeline = LocalSemaphore::new(10, disabled_faults());
        let llm = LocalSemaphore::new(3, disabled_faults());
        let snapshot = metrics.snapshot(
            SharedStoreStatus { enabled: false, healthy: true, mode: StoreMode::SingleInstance },
            &pipeline,
            &llm,
            IdempotencyStatus { size: 0, max_entries: 1000, ttl_seconds: 3600, backend_kind: "local" },
        );
        assert_eq!(snapshot.path_counters.len(), review_checks::VALID_PATHS.len());
        assert!(snapshot.path_counters.iter().all(|(_, n)| *n == 1));
    }
}
