//! HTTP surface: webhook intake, health, metrics, decision history, and
//! attestation verification endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use review_canon::{sha256_hex, ProofStep, Side};
use review_orchestrator::{EventContext, Outcome};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/decisions", get(decisions))
        .route("/verify/:review_id", get(verify))
        .route("/merkle/root", get(merkle_root))
        .route("/merkle/proof/:review_id", get(merkle_proof))
        .route("/merkle/verify", post(merkle_verify))
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    action: String,
    pull_request: WebhookPullRequest,
    repository: WebhookRepository,
    #[serde(default)]
    installation: Option<WebhookInstallation>,
}

#[derive(Debug, Deserialize)]
struct WebhookPullRequest {
    number: u64,
    head: WebhookHead,
}

#[derive(Debug, Deserialize)]
struct WebhookHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct WebhookRepository {
    name: String,
    owner: WebhookOwner,
}

#[derive(Debug, Deserialize)]
struct WebhookOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WebhookInstallation {
    id: u64,
}

const ADMITTED_ACTIONS: [&str; 2] = ["opened", "synchronize"];

/// Accepts a `pull_request` webhook and drives it through the pipeline.
/// Signature verification transport and the repository-hosting API
/// client are out of scope; this handler trusts the `X-Delivery` header
/// for the idempotency key and the JSON body for PR coordinates.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    if !ADMITTED_ACTIONS.contains(&payload.action.as_str()) {
        return (
            StatusCode::ACCEPTED,
            Json(json!({ "message": "action not admitted", "action": payload.action })),
        );
    }

    let delivery_id = headers
        .get("X-Delivery")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| sha256_hex(format!("{}{}", payload.repository.name, payload.pull_request.number).as_bytes()));

    let ctx = EventContext {
        owner: payload.repository.owner.login,
        repo: payload.repository.name,
        pr_number: payload.pull_request.number,
        installation_id: payload
            .installation
            .map(|i| i.id.to_string())
            .unwrap_or_default(),
        head_commit_id: payload.pull_request.head.sha,
        delivery_id,
    };
    let idempotency_key = ctx.idempotency_key("review");

    match state.pipeline.handle_webhook(ctx).await {
        Outcome::Decided(record) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": "processed",
                "review_id": record.review_id,
                "idempotency_key": idempotency_key,
            })),
        ),
        Outcome::Skipped { reason } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": reason,
                "review_id": Value::Null,
                "idempotency_key": idempotency_key,
            })),
        ),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let idempotency = state.pipeline.idempotency_status(state.idempotency_ttl_seconds);
    let shared_store = review_metrics::SharedStoreStatus {
        enabled: state.pipeline.shared_store_enabled,
        healthy: state.pipeline.shared_store_healthy,
        mode: if !state.pipeline.shared_store_enabled {
            review_metrics::StoreMode::SingleInstance
        } else if state.pipeline.shared_store_healthy {
            review_metrics::StoreMode::Distributed
        } else {
            review_metrics::StoreMode::Degraded
        },
    };
    let snapshot = state.pipeline.metrics.snapshot(
        shared_store,
        state.pipeline.pipeline_permits.as_ref(),
        state.pipeline.llm_permits.as_ref(),
        idempotency,
    );
    Json(snapshot)
}

#[derive(Debug, Deserialize)]
struct DecisionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DecisionView {
    review_id: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    repo_full_name: String,
    pr_number: u64,
    decision_path: String,
    final_state: String,
    verdict: Option<review_llm::Verdict>,
    comment_posted: bool,
    formally_valid: bool,
    execution_proof_hash: String,
    ledger_hash: String,
}

impl From<&review_decision::DecisionRecord> for DecisionView {
    fn from(r: &review_decision::DecisionRecord) -> Self {
        Self {
            review_id: r.review_id.clone(),
            timestamp: r.timestamp,
            repo_full_name: format!("{}/{}", r.pr.owner, r.pr.repo),
            pr_number: r.pr.number,
            decision_path: r.decision_path.clone(),
            final_state: r.final_state.as_str().to_string(),
            verdict: r.verdict,
            comment_posted: r.comment_posted,
            formally_valid: r.formally_valid,
            execution_proof_hash: r.execution_proof_hash.clone(),
            ledger_hash: r.ledger_hash.clone(),
        }
    }
}

async fn decisions(State(state): State<AppState>, Query(q): Query<DecisionsQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let records = state.pipeline.history.get_recent(limit);
    let views: Vec<DecisionView> = records.iter().map(DecisionView::from).collect();
    Json(json!({
        "decisions": views,
        "meta": { "limit": limit, "count": views.len() },
    }))
}

fn find_record(state: &AppState, review_id: &str) -> Option<review_decision::DecisionRecord> {
    state
        .pipeline
        .history
        .get_recent(usize::MAX)
        .into_iter()
        .find(|r| r.review_id == review_id)
}

async fn verify(State(state): State<AppState>, Path(review_id): Path<String>) -> impl IntoResponse {
    match find_record(&state, &review_id) {
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown review_id" }))),
        Some(record) => match review_attestation::verify_proof(&record) {
            Ok(()) => (
                StatusCode::OK,
                Json(json!({
                    "valid": true,
                    "review_id": record.review_id,
                    "execution_proof_hash": record.execution_proof_hash,
                })),
            ),
            Err(e) => (
                StatusCode::CONFLICT,
                Json(json!({ "valid": false, "review_id": record.review_id, "error": e.to_string() })),
            ),
        },
    }
}

fn ordered_proof_hashes(state: &AppState) -> Vec<(String, String)> {
    let ledger = state.pipeline.ledger.lock().unwrap();
    ledger
        .entries()
        .iter()
        .map(|e| (e.review_id.clone(), e.execution_proof_hash.clone()))
        .collect()
}

async fn merkle_root(State(state): State<AppState>) -> impl IntoResponse {
    let hashes: Vec<String> = ordered_proof_hashes(&state).into_iter().map(|(_, h)| h).collect();
    match review_attestation::merkle_root(&hashes) {
        Ok(root) => (
            StatusCode::OK,
            Json(json!({ "root": root, "leaf_count": hashes.len(), "algorithm": "sha256-merkle-v1" })),
        ),
        Err(_) => (StatusCode::NOT_FOUND, Json(json!({ "error": "ledger is empty" }))),
    }
}

async fn merkle_proof(State(state): State<AppState>, Path(review_id): Path<String>) -> impl IntoResponse {
    let pairs = ordered_proof_hashes(&state);
    let Some(index) = pairs.iter().position(|(id, _)| id == &review_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown review_id" })));
    };
    let hashes: Vec<String> = pairs.into_iter().map(|(_, h)| h).collect();
    match review_attestation::merkle_proof(&hashes, index) {
        Ok(proof) => (
            StatusCode::OK,
            Json(json!({
                "review_id": review_id,
                "execution_proof_hash": proof.leaf_hash,
                "proof": proof.steps,
                "root": review_attestation::merkle_root(&hashes).unwrap_or_default(),
                "algorithm": "sha256-merkle-v1",
            })),
        ),
        Err(_) => (StatusCode::NOT_FOUND, Json(json!({ "error": "index out of range" }))),
    }
}

#[derive(Debug, Deserialize)]
struct MerkleVerifyRequest {
    leaf_hash: String,
    proof: Vec<ProofStep>,
    root: String,
}

fn recompute_root(leaf: &str, steps: &[ProofStep]) -> String {
    let mut current = leaf.to_string();
    for step in steps {
        current = match step.position {
            Side::Right => sha256_hex(format!("{current}|{}", step.hash).as_bytes()),
            Side::Left => sha256_hex(format!("{}|{current}", step.hash).as_bytes()),
        };
    }
    current
}

async fn merkle_verify(Json(req): Json<MerkleVerifyRequest>) -> impl IntoResponse {
    let recomputed = recompute_root(&req.leaf_hash, &req.proof);
    let valid = recomputed == req.root;
    let status = if valid { StatusCode::OK } else { StatusCode::CONFLICT };
    (status, Json(json!({ "valid": valid, "recomputed_root": recomputed })))
}
