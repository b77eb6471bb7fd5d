//! Distributed coordination primitives shared by the orchestrator: an
//! idempotency guard that de-duplicates retried webhook deliveries, and a
//! two-level semaphore bounding concurrent pipelines and concurrent LLM
//! calls. Each has a local in-process backend and an optional shared
//! (Redis-backed) backend selected at startup from configuration.

pub mod idempotency;
pub mod semaphore;

pub use idempotency::{
    IdempotencyGuard, IdempotencyStatus, LocalIdempotencyGuard, SharedIdempotencyGuard,
    DEFAULT_TTL, LOCAL_MAX_ENTRIES,
};
pub use semaphore::{LocalSemaphore, PermitSemaphore, SemaphoreSnapshot, SharedSemaphore};
