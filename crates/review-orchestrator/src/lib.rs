//! Orchestrator: drives one state-machine execution per admitted webhook
//! from `RECEIVED` to a terminal state, issuing invariant checks along the
//! way and guaranteeing exactly one decision record per admission.
//!
//! External collaborators a real deployment would plug in (diff fetch,
//! repository-hosting comment API) are represented as traits; their wire
//! details are explicitly out of scope of this pipeline.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use review_attestation::{compute_proof_hash, Ledger};
use review_checks::{
    check_postconditions, enforce, safe_check, InvariantContext, PostconditionContext,
    SemaphoreSnapshot as CheckSemaphoreSnapshot, Verdict as CheckVerdict, Violation,
};
use review_coordination::{IdempotencyGuard, IdempotencyStatus, PermitSemaphore};
use review_metrics::IdempotencyStatus as MetricsIdempotencyStatus;
use review_contract::{PipelineState, Severity};
use review_decision::{
    DecisionBuilder, DecisionHistory, DecisionRecord, DecisionTrace, PrCoords,
    StateTransitionSummary,
};
use review_faults::{FaultCode, FaultController};
use review_fsm::StateMachine;
use review_llm::{generate_review, LlmClient, ReviewTrace, Verdict as LlmVerdict};
use review_metrics::MetricsRegistry;
use review_precheck::{gate, DiffFile, GateDecision, RiskClassifier};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct EventContext {
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub installation_id: String,
    pub head_commit_id: String,
    pub delivery_id: String,
}

impl EventContext {
    pub fn idempotency_key(&self, action: &str) -> String {
        format!(
            "{}|{}/{}|{}|{}|{}",
            self.delivery_id, self.owner, self.repo, self.pr_number, action, self.head_commit_id
        )
    }

    fn pr_coords(&self) -> PrCoords {
        PrCoords {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            number: self.pr_number,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiffFetchError {
    #[error("diff extraction failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait DiffFetcher: Send + Sync {
    async fn fetch_diff(&self, ctx: &EventContext) -> Result<Vec<DiffFile>, DiffFetchError>;
}

#[async_trait]
pub trait CommentPublisher: Send + Sync {
    async fn publish(&self, ctx: &EventContext, body: &str) -> Result<(), String>;
}

/// Drops files the pre-check rule set has no business looking at (for
/// instance, generated or vendored files). The teacher's own rule set is
/// out of scope; this default keeps everything.
pub trait DiffFilter: Send + Sync {
    fn filter(&self, files: Vec<DiffFile>) -> Vec<DiffFile>;
}

pub struct KeepAllFilter;
impl DiffFilter for KeepAllFilter {
    fn filter(&self, files: Vec<DiffFile>) -> Vec<DiffFile> {
        files
    }
}

/// Counts a unified diff hunk's added and removed lines, ignoring the
/// `+++`/`---` file headers.
fn changed_lines(content: &str) -> usize {
    content
        .lines()
        .filter(|l| {
            (l.starts_with('+') && !l.starts_with("+++")) || (l.starts_with('-') && !l.starts_with("---"))
        })
        .count()
}

/// Caps the diff at 50 files and 5000 total changed lines, taking files in
/// the order the fetcher returned them and dropping everything past
/// whichever limit is hit first.
pub struct LimitFilter;

impl LimitFilter {
    pub const MAX_FILES: usize = 50;
    pub const MAX_CHANGES: usize = 5000;
}

impl DiffFilter for LimitFilter {
    fn filter(&self, files: Vec<DiffFile>) -> Vec<DiffFile> {
        let mut kept = Vec::new();
        let mut total_changes = 0usize;
        for file in files {
            if kept.len() >= Self::MAX_FILES {
                break;
            }
            let changes = changed_lines(&file.content);
            if total_changes + changes > Self::MAX_CHANGES {
                break;
            }
            total_changes += changes;
            kept.push(file);
        }
        kept
    }
}

/// The outcome of a single webhook admission. `Skipped` covers both named
/// divergences that never create a state machine (duplicate, load-shed).
pub enum Outcome {
    Skipped { reason: &'static str },
    Decided(Box<DecisionRecord>),
}

pub struct Pipeline {
    pub idempotency: Box<dyn IdempotencyGuard>,
    pub pipeline_permits: Box<dyn PermitSemaphore>,
    pub llm_permits: Box<dyn PermitSemaphore>,
    pub diff_fetcher: Box<dyn DiffFetcher>,
    pub filter: Box<dyn DiffFilter>,
    pub classifier: Box<dyn RiskClassifier>,
    pub llm_client: Box<dyn LlmClient>,
    pub comment_publisher: Box<dyn CommentPublisher>,
    pub faults: std::sync::Arc<FaultController>,
    pub metrics: std::sync::Arc<MetricsRegistry>,
    pub history: DecisionHistory,
    pub ledger: Mutex<Ledger>,
    pub contract_version: String,
    pub contract_hash: String,
    pub instance_mode: String,
    pub shared_store_enabled: bool,
    pub shared_store_healthy: bool,
}

impl Pipeline {
    fn invariant_ctx(
        &self,
        sm: &StateMachine,
        previous: Option<PipelineState>,
        gate_allowed: Option<bool>,
        ai_invoked: Option<bool>,
        fallback: Option<&ReviewTrace>,
        verdict: Option<CheckVerdict>,
        decision_path: Option<&str>,
        about_to_invoke_llm: bool,
        about_to_post_comment: bool,
        comment_posted: Option<bool>,
    ) -> InvariantContext {
        InvariantContext {
            pipeline_semaphore: Some(to_check_snapshot(self.pipeline_permits.snapshot())),
            llm_semaphore: Some(to_check_snapshot(self.llm_permits.snapshot())),
            gate_allowed,
            ai_invoked,
            fallback_used: fallback.map(|f| f.fallback_used),
            fallback_reason: fallback.and_then(|f| f.fallback_reason.as_ref()).map(|r| r.trigger.to_string()),
            verdict,
            risk_count: None,
            decision_path: decision_path.map(|p| p.to_string()),
            current_state: Some(sm.current()),
            previous_state: previous,
            about_to_invoke_llm: Some(about_to_invoke_llm),
            about_to_post_comment: Some(about_to_post_comment),
            comment_posted,
            shared_store_enabled: Some(self.shared_store_enabled),
            shared_store_healthy: Some(self.shared_store_healthy),
            instance_mode: Some(self.instance_mode.clone()),
        }
    }

    fn checkpoint(&self, ctx: &InvariantContext, violations: &mut Vec<Violation>) {
        violations.extend(safe_check(ctx, None));
    }

    /// Runs one webhook from admission to a terminal decision. Returns
    /// `Outcome::Skipped` for duplicates and load-shed (no state machine,
    /// metrics only); otherwise guarantees a decision record.
    pub async fn handle_webhook(&self, event: EventContext) -> Outcome {
        let start = Instant::now();
        let key = event.idempotency_key("review");

        if matches!(
            self.idempotency.check_and_mark(&key).await,
            review_coordination::IdempotencyStatus::DuplicateRecent { .. }
        ) {
            self.metrics.record_duplicate();
            return Outcome::Skipped { reason: "duplicate" };
        }

        if !self.pipeline_permits.try_acquire().await {
            self.metrics.record_load_shed();
            return Outcome::Skipped { reason: "load_shed" };
        }

        let review_id = uuid::Uuid::new_v4().to_string();
        let outcome = AssertUnwindSafe(self.run_execution(event.clone(), review_id.clone(), start))
            .catch_unwind()
            .await;
        self.pipeline_permits.release().await;

        let record = match outcome {
            Ok(record) => record,
            Err(panic_payload) => {
                let message = panic_message(&panic_payload);
                tracing::error!(review_id = %review_id, panic = %message, "run_execution panicked, aborting to AbortedFatal");
                self.finish_fatal(&event, &review_id, start, message).await
            }
        };
        Outcome::Decided(Box::new(record))
    }

    /// Seals a decision record for an execution that never ran to a normal
    /// terminal state because of an uncaught internal error (e.g. a panic
    /// caught in `handle_webhook`). Drives the state machine directly from
    /// `RECEIVED` to `ABORTED_FATAL`, satisfying the "uncaught error in any
    /// non-terminal state" divergence branch without needing every
    /// intermediate transition to have actually run.
    async fn finish_fatal(
        &self,
        event: &EventContext,
        review_id: &str,
        start: Instant,
        message: String,
    ) -> DecisionRecord {
        let mut sm = StateMachine::new(PipelineState::Received);
        let _ = sm.transition(PipelineState::AbortedFatal, None);
        let violations = vec![Violation {
            id: "INTERNAL_PANIC".to_string(),
            description: format!("uncaught internal error: {message}"),
            severity: Severity::Fatal,
        }];
        self.finish(
            event,
            review_id,
            start,
            sm,
            violations,
            Vec::new(),
            "internal_panic".to_string(),
            String::new(),
            false,
            false,
            None,
            false,
            None,
        )
        .await
    }

    async fn run_execution(&self, event: EventContext, review_id: String, start: Instant) -> DecisionRecord {
        let mut sm = StateMachine::new(PipelineState::Received);
        let mut violations: Vec<Violation> = Vec::new();
        let mut injected_faults: Vec<String> = Vec::new();
        let mut ai_invoked = false;
        let mut ai_blocked = false;
        let mut fallback_trace: Option<ReviewTrace> = None;
        let mut comment_posted = false;
        let mut decision_path = String::new();
        let mut gate_reason = String::new();

        let mut advance = |sm: &mut StateMachine, to: PipelineState| {
            let from = sm.current();
            let _ = sm.transition(to, None);
            from
        };

        advance(&mut sm, PipelineState::DiffExtractionPending);
        self.checkpoint(
            &self.invariant_ctx(&sm, None, None, None, None, None, None, false, false, None),
            &mut violations,
        );

        let diff_files = match self.try_fetch_diff(&event, &mut injected_faults).await {
            Ok(files) => files,
            Err(_) => {
                advance(&mut sm, PipelineState::DiffExtractionFailed);
                advance(&mut sm, PipelineState::AbortedError);
                let _ = self
                    .comment_publisher
                    .publish(&event, "Unable to extract diff for this pull request.")
                    .await;
                decision_path = "error_exit".to_string();
                return self
                    .finish(
                        &event,
                        &review_id,
                        start,
                        sm,
                        violations,
                        injected_faults,
                        decision_path,
                        String::new(),
                        ai_invoked,
                        ai_blocked,
                        fallback_trace,
                        comment_posted,
                        None,
                    )
                    .await;
            }
        };

        advance(&mut sm, PipelineState::DiffExtracted);
        advance(&mut sm, PipelineState::FilteringPending);
        let filtered = self.filter.filter(diff_files);

        if filtered.is_empty() {
            advance(&mut sm, PipelineState::FilteredOut);
            advance(&mut sm, PipelineState::CompletedSilent);
            decision_path = "silent_exit_out".to_string();
            return self
                .finish(
                    &event, &review_id, start, sm, violations, injected_faults, decision_path,
                    gate_reason, ai_invoked, ai_blocked, fallback_trace, comment_posted, None,
                )
                .await;
        }

        advance(&mut sm, PipelineState::Filtered);
        advance(&mut sm, PipelineState::PrecheckPending);
        let bundle = self.classifier.classify(&filtered);
        advance(&mut sm, PipelineState::Prechecked);
        advance(&mut sm, PipelineState::AiGatingPending);

        let gate_outcome = gate(&bundle);
        gate_reason = gate_outcome.reason.to_string();
        self.checkpoint(
            &self.invariant_ctx(
                &sm, None, Some(gate_outcome.decision == GateDecision::Allow),
                None, None, None, None, false, false, None,
            ),
            &mut violations,
        );

        match gate_outcome.decision {
            GateDecision::Skip if gate_outcome.reason == "safe" => {
                advance(&mut sm, PipelineState::AiBlockedSafe);
                advance(&mut sm, PipelineState::CompletedSilent);
                decision_path = "silent_exit_safe".to_string();
                return self
                    .finish(
                        &event, &review_id, start, sm, violations, injected_faults, decision_path,
                        gate_reason, ai_invoked, ai_blocked, fallback_trace, comment_posted, None,
                    )
                    .await;
            }
            GateDecision::Skip => {
                ai_blocked = true;
                advance(&mut sm, PipelineState::AiBlockedManual);
                advance(&mut sm, PipelineState::ReviewReady);
                advance(&mut sm, PipelineState::CommentPending);
                comment_posted = self
                    .try_publish(&event, "Manual review required: high risk count exceeds automatic review threshold.")
                    .await;
                advance(&mut sm, if comment_posted { PipelineState::CommentPosted } else { PipelineState::CommentFailed });
                advance(&mut sm, PipelineState::CompletedWarning);
                decision_path = "manual_review_warning".to_string();
                return self
                    .finish(
                        &event, &review_id, start, sm, violations, injected_faults, decision_path,
                        gate_reason, ai_invoked, ai_blocked, fallback_trace, comment_posted, None,
                    )
                    .await;
            }
            GateDecision::Allow => {}
        }

        advance(&mut sm, PipelineState::AiApproved);
        advance(&mut sm, PipelineState::AiReviewPending);
        advance(&mut sm, PipelineState::AiInvoked);
        ai_invoked = true;
        self.metrics.record_llm_invocation();

        let trace = generate_review(
            self.llm_client.as_ref(),
            self.llm_permits.as_ref(),
            &self.faults,
            &bundle,
        )
        .await;

        let verdict = trace.output.verdict;
        if trace.fallback_used {
            self.metrics.record_llm_fallback();
            advance(&mut sm, PipelineState::FallbackPending);
            advance(&mut sm, PipelineState::FallbackGenerated);
            advance(&mut sm, PipelineState::ReviewReady);
            decision_path = match trace.fallback_reason.as_ref().map(|r| r.trigger) {
                Some("quality_rejection") => "ai_fallback_quality",
                _ => "ai_fallback_error",
            }
            .to_string();
        } else {
            advance(&mut sm, PipelineState::AiResponded);
            advance(&mut sm, PipelineState::AiValidated);
            advance(&mut sm, PipelineState::ReviewReady);
            decision_path = "ai_review".to_string();
        }
        fallback_trace = Some(trace);

        advance(&mut sm, PipelineState::CommentPending);
        let body = format_review_comment(fallback_trace.as_ref().unwrap());
        comment_posted = self.try_publish(&event, &body).await;
        advance(&mut sm, if comment_posted { PipelineState::CommentPosted } else { PipelineState::CommentFailed });

        let terminal = if !comment_posted {
            PipelineState::CompletedWarning
        } else if decision_path == "ai_review" {
            PipelineState::CompletedSuccess
        } else {
            PipelineState::CompletedWarning
        };
        advance(&mut sm, terminal);

        self.finish(
            &event, &review_id, start, sm, violations, injected_faults, decision_path,
            gate_reason, ai_invoked, ai_blocked, fallback_trace, comment_posted,
            Some(to_llm_check_verdict(verdict)),
        )
        .await
    }

    async fn try_fetch_diff(
        &self,
        event: &EventContext,
        injected: &mut Vec<String>,
    ) -> Result<Vec<DiffFile>, DiffFetchError> {
        if self.faults.maybe_inject(FaultCode::DiffExtractionFail).is_err() {
            injected.push(FaultCode::DiffExtractionFail.as_str().to_string());
            return Err(DiffFetchError::Failed("fault injected".into()));
        }
        self.diff_fetcher.fetch_diff(event).await
    }

    async fn try_publish(&self, event: &EventContext, body: &str) -> bool {
        if self.faults.maybe_inject(FaultCode::PublishCommentFailure).is_err() {
            return false;
        }
        self.comment_publisher.publish(event, body).await.is_ok()
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        event: &EventContext,
        review_id: &str,
        start: Instant,
        sm: StateMachine,
        mut violations: Vec<Violation>,
        injected_faults: Vec<String>,
        decision_path: String,
        gate_reason: String,
        ai_invoked: bool,
        ai_blocked: bool,
        fallback_trace: Option<ReviewTrace>,
        comment_posted: bool,
        verdict: Option<CheckVerdict>,
    ) -> DecisionRecord {
        let mut injected_faults = injected_faults;
        if self.faults.maybe_inject(FaultCode::MetricsWriteFailure).is_err() {
            injected_faults.push(FaultCode::MetricsWriteFailure.as_str().to_string());
            tracing::warn!("metrics write fault injected, skipping record_path");
        } else {
            self.metrics.record_path(&decision_path);
        }

        let final_state = sm.final_state_or_none().unwrap_or(PipelineState::AbortedFatal);
        let visited_states: HashSet<PipelineState> = std::iter::once(PipelineState::Received)
            .chain(sm.history().iter().map(|t| t.to))
            .collect();

        let pctx = PostconditionContext {
            final_state: Some(final_state),
            is_terminal: Some(sm.is_terminal()),
            decision_path: Some(decision_path.clone()),
            comment_posted: Some(comment_posted),
            verdict,
            ai_invoked: Some(ai_invoked),
            ai_blocked: Some(ai_blocked),
            fallback_used: fallback_trace.as_ref().map(|t| t.fallback_used),
            fallback_reason: fallback_trace
                .as_ref()
                .and_then(|t| t.fallback_reason.as_ref())
                .map(|r| r.trigger.to_string()),
            state_transitions: Some(sm.history().iter().map(|t| (t.from, t.to)).collect()),
            visited_states: Some(visited_states),
        };
        let postcondition_report = check_postconditions(&pctx);
        violations.extend(match enforce(&InvariantContext {
            pipeline_semaphore: Some(to_check_snapshot(self.pipeline_permits.snapshot())),
            llm_semaphore: Some(to_check_snapshot(self.llm_permits.snapshot())),
            gate_allowed: None,
            ai_invoked: Some(ai_invoked),
            fallback_used: fallback_trace.as_ref().map(|t| t.fallback_used),
            fallback_reason: None,
            verdict,
            risk_count: None,
            decision_path: Some(decision_path.clone()),
            current_state: Some(final_state),
            previous_state: None,
            about_to_invoke_llm: Some(false),
            about_to_post_comment: Some(false),
            comment_posted: Some(comment_posted),
            shared_store_enabled: Some(self.shared_store_enabled),
            shared_store_healthy: Some(self.shared_store_healthy),
            instance_mode: Some(self.instance_mode.clone()),
        }) {
            Ok(()) => Vec::new(),
            Err(v) => v,
        };

        let transitions: Vec<StateTransitionSummary> = sm
            .history()
            .iter()
            .map(|t| StateTransitionSummary { from: t.from, to: t.to })
            .collect();

        let trace = DecisionTrace {
            review_id: review_id.to_string(),
            timestamp: Utc::now(),
            pr: event.pr_coords(),
            decision_path,
            gate_reason,
            ai_invoked,
            ai_blocked,
            fallback_used: fallback_trace.as_ref().map(|t| t.fallback_used).unwrap_or(false),
            fallback_reason: fallback_trace
                .as_ref()
                .and_then(|t| t.fallback_reason.as_ref())
                .map(|r| format!("{}: {}", r.trigger, r.details)),
            risk_bundle: None,
            verdict: fallback_trace.as_ref().map(|t| t.output.verdict),
            comment_posted,
            processing_time_ms: start.elapsed().as_millis() as u64,
            instance_mode: self.instance_mode.clone(),
            injected_faults,
            state_transitions: transitions,
            final_state,
        };

        let builder = DecisionBuilder::new(
            trace,
            violations,
            postcondition_report,
            self.contract_version.clone(),
            self.contract_hash.clone(),
        );
        let unsealed = builder.build_unsealed();
        let proof_hash = compute_proof_hash(&unsealed);

        let (previous_ledger_hash, entry) = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger
                .append(&proof_hash, review_id, Utc::now())
                .unwrap_or_else(|_| {
                    (
                        review_attestation::GENESIS.to_string(),
                        review_attestation::LedgerEntry {
                            previous_ledger_hash: review_attestation::GENESIS.to_string(),
                            execution_proof_hash: proof_hash.clone(),
                            review_id: review_id.to_string(),
                            timestamp: Utc::now(),
                            ledger_hash: proof_hash.clone(),
                        },
                    )
                })
        };

        let record = unsealed.seal(proof_hash, entry.ledger_hash, previous_ledger_hash);
        if self.faults.maybe_inject(FaultCode::DecisionWriteFailure).is_err() {
            tracing::warn!(review_id = %review_id, "decision write fault injected, skipping history push");
        } else {
            self.history.push(record.clone());
        }
        record
    }

    pub fn idempotency_status(&self, ttl_seconds: u64) -> MetricsIdempotencyStatus {
        MetricsIdempotencyStatus {
            size: self.idempotency.size(),
            max_entries: review_coordination::LOCAL_MAX_ENTRIES,
            ttl_seconds,
            backend_kind: self.idempotency.backend_kind(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn to_check_snapshot(s: review_coordination::SemaphoreSnapshot) -> CheckSemaphoreSnapshot {
    CheckSemaphoreSnapshot {
        in_flight: s.in_flight,
        available: s.available,
        max_permits: s.max_permits,
    }
}

fn to_llm_check_verdict(v: LlmVerdict) -> CheckVerdict {
    match v {
        LlmVerdict::Safe => CheckVerdict::Safe,
        LlmVerdict::SafeWithConditions => CheckVerdict::SafeWithConditions,
        LlmVerdict::RequiresChanges => CheckVerdict::RequiresChanges,
        LlmVerdict::HighRisk => CheckVerdict::HighRisk,
    }
}

fn format_review_comment(trace: &ReviewTrace) -> String {
    format!(
        "Verdict: {:?}\n\n{}\n\nRisks:\n{}",
        trace.output.verdict,
        trace.output.assessment,
        trace.output.risks.join("\n")
    )
}
