//! Binary entry point: boots the execution contract, wires the pipeline's
//! collaborators, and serves the HTTP surface.

mod collaborators;
mod config;
mod routes;
mod state;

use anyhow::{anyhow, Result};
use clap::Parser;
use review_checks::{invariant_schema, postcondition_schema};
use review_contract::{diagnostic_dump, has_fatal, validate, ExecutionContract, CONTRACT_VERSION};
use review_coordination::{LocalIdempotencyGuard, LocalSemaphore, SharedIdempotencyGuard, SharedSemaphore};
use review_decision::{DecisionHistory, LOCAL_HISTORY_BOUND, SHARED_HISTORY_BOUND};
use review_faults::FaultController;
use review_fsm::fsm_schema;
use review_metrics::MetricsRegistry;
use review_orchestrator::{LimitFilter, Pipeline};
use review_precheck::HeuristicClassifier;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::collaborators::{HttpCommentPublisher, HttpDiffFetcher, UnconfiguredLlmClient};
use crate::config::ReviewServiceConfig;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "review-service")]
#[command(about = "Auditable pull-request review pipeline")]
struct Cli {
    /// Overrides PORT from the environment.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the declared execution contract. Created on first run.
    #[arg(long, default_value = "contract.json")]
    contract_path: PathBuf,

    /// Repository-hosting and LLM provider base URLs, left unconfigured
    /// by default since their wire protocols are out of scope.
    #[arg(long)]
    repo_api_base: Option<String>,
}

fn decision_schema_hash() -> String {
    const FIELDS: &[&str] = &[
        "review_id", "timestamp", "pr", "decision_path", "gate_reason", "ai_invoked",
        "ai_blocked", "fallback_used", "fallback_reason", "verdict", "comment_posted",
        "processing_time_ms", "instance_mode", "injected_faults", "invariants",
        "state_transitions", "final_state", "postconditions", "formally_valid",
        "contract_version", "contract_hash", "execution_proof_hash", "ledger_hash",
        "previous_ledger_hash",
    ];
    review_canon::sha256_hex(FIELDS.join(",").as_bytes())
}

fn build_current_contract() -> ExecutionContract {
    ExecutionContract::build(
        CONTRACT_VERSION,
        fsm_schema(),
        invariant_schema(),
        postcondition_schema(),
        decision_schema_hash(),
        chrono::Utc::now(),
    )
}

/// Loads the declared-active contract from disk, or, on first boot,
/// persists the freshly-built current contract as the declared baseline.
fn load_or_init_active_contract(path: &PathBuf, current: &ExecutionContract) -> Result<ExecutionContract> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(_) => {
            info!(path = %path.display(), "no declared contract found, adopting current schema as the baseline");
            std::fs::write(path, serde_json::to_string_pretty(current)?)?;
            Ok(current.clone())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut svc_config = ReviewServiceConfig::from_env();
    if let Some(port) = cli.port {
        svc_config.port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(format!("review_service={0},review_orchestrator={0}", svc_config.log_level))
        .init();

    info!("starting review-service");

    let current_contract = build_current_contract();
    let active_contract = load_or_init_active_contract(&cli.contract_path, &current_contract)?;
    let violations = validate(&current_contract, &active_contract);
    if has_fatal(&violations) {
        eprintln!("{}", diagnostic_dump(&current_contract, &active_contract, &violations));
        error!("execution contract validation failed, refusing to start");
        std::process::exit(1);
    }
    for v in &violations {
        warn!(severity = %v.severity, "{}", v.message);
    }

    let faults = Arc::new(FaultController::new(svc_config.faults_enabled));
    for (code, trigger) in &svc_config.fault_triggers {
        faults.configure(*code, *trigger);
    }

    let shared_store_enabled = svc_config.shared_store_url.is_some();
    let (idempotency, pipeline_permits, llm_permits, shared_store_healthy, history, instance_mode): (
        Box<dyn review_coordination::IdempotencyGuard>,
        Box<dyn review_coordination::PermitSemaphore>,
        Box<dyn review_coordination::PermitSemaphore>,
        bool,
        DecisionHistory,
        &str,
    ) = if let Some(url) = &svc_config.shared_store_url {
        match (
            SharedIdempotencyGuard::new(url, svc_config.idempotency_ttl, faults.clone()),
            SharedSemaphore::new(url, "review:pipeline", svc_config.pipeline_permits, faults.clone()),
            SharedSemaphore::new(url, "review:llm", svc_config.llm_permits, faults.clone()),
        ) {
            (Ok(idem), Ok(pipe), Ok(llm)) => (
                Box::new(idem),
                Box::new(pipe),
                Box::new(llm),
                true,
                DecisionHistory::new(SHARED_HISTORY_BOUND),
                "distributed",
            ),
            _ => {
                warn!("shared store configured but unreachable at startup, running degraded");
                (
                    Box::new(LocalIdempotencyGuard::new(svc_config.idempotency_ttl, review_coordination::LOCAL_MAX_ENTRIES)),
                    Box::new(LocalSemaphore::new(svc_config.pipeline_permits, faults.clone())),
                    Box::new(LocalSemaphore::new(svc_config.llm_permits, faults.clone())),
                    false,
                    DecisionHistory::new(LOCAL_HISTORY_BOUND),
                    "degraded",
                )
            }
        }
    } else {
        (
            Box::new(LocalIdempotencyGuard::new(svc_config.idempotency_ttl, review_coordination::LOCAL_MAX_ENTRIES)),
            Box::new(LocalSemaphore::new(svc_config.pipeline_permits, faults.clone())),
            Box::new(LocalSemaphore::new(svc_config.llm_permits, faults.clone())),
            false,
            DecisionHistory::new(LOCAL_HISTORY_BOUND),
            "single-instance",
        )
    };

    let repo_api_base = cli.repo_api_base.unwrap_or_else(|| "https://api.example-scm.invalid".to_string());

    let pipeline = Arc::new(Pipeline {
        idempotency,
        pipeline_permits,
        llm_permits,
        diff_fetcher: Box::new(HttpDiffFetcher::new(repo_api_base.clone())),
        filter: Box::new(LimitFilter),
        classifier: Box::new(HeuristicClassifier),
        llm_client: Box::new(UnconfiguredLlmClient),
        comment_publisher: Box::new(HttpCommentPublisher::new(repo_api_base)),
        faults,
        metrics: MetricsRegistry::new(),
        history,
        ledger: std::sync::Mutex::new(review_attestation::Ledger::new()),
        contract_version: current_contract.version.clone(),
        contract_hash: current_contract.contract_hash.clone(),
        instance_mode: instance_mode.to_string(),
        shared_store_enabled,
        shared_store_healthy,
    });

    let app_state = AppState {
        pipeline,
        contract: Arc::new(current_contract),
        idempotency_ttl_seconds: svc_config.idempotency_ttl.as_secs(),
    };

    let app = routes::router()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", svc_config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("failed to bind {addr}: {e}"))?;
    info!(%addr, "review-service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("review-service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install terminate handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
