//! Shared application state handed to every axum handler.

use review_contract::ExecutionContract;
use review_orchestrator::Pipeline;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub contract: Arc<ExecutionContract>,
    pub idempotency_ttl_seconds: u64,
}
