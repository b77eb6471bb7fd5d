//! Decision record assembly and the append-only recent-decision history
//! ring. The record is the single object that summarizes one execution and
//! is later sealed by an execution-proof hash and ledger hash (computed by
//! the attestation crate over this record's fields).

use chrono::{DateTime, Utc};
use review_checks::{PostconditionReport, Violation};
use review_contract::{PipelineState, Severity};
use review_llm::Verdict;
use review_precheck::RiskBundle;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const LOCAL_HISTORY_BOUND: usize = 100;
pub const SHARED_HISTORY_BOUND: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrCoords {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateTransitionSummary {
    pub from: PipelineState,
    pub to: PipelineState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantSummary {
    pub total: usize,
    pub warn: usize,
    pub error: usize,
    pub fatal: usize,
    pub violation_ids: Vec<String>,
}

impl InvariantSummary {
    pub fn from_violations(violations: &[Violation]) -> Self {
        let mut warn = 0;
        let mut error = 0;
        let mut fatal = 0;
        let mut ids: Vec<String> = Vec::new();
        for v in violations {
            match v.severity {
                Severity::Warn => warn += 1,
                Severity::Error => error += 1,
                Severity::Fatal => fatal += 1,
            }
            ids.push(v.id.clone());
        }
        ids.sort();
        Self {
            total: violations.len(),
            warn,
            error,
            fatal,
            violation_ids: ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostconditionSummary {
    pub total_checked: usize,
    pub passed: bool,
    pub violation_count: usize,
    pub violation_ids: Vec<String>,
}

impl PostconditionSummary {
    pub fn from_report(report: &PostconditionReport) -> Self {
        let mut ids: Vec<String> = report.violations.iter().map(|v| v.id.clone()).collect();
        ids.sort();
        Self {
            total_checked: report.total_checked,
            passed: report.violations.is_empty(),
            violation_count: report.violations.len(),
            violation_ids: ids,
        }
    }
}

/// Everything gathered while driving an execution, prior to invariant and
/// postcondition evaluation. The orchestrator fills this in as it runs.
#[derive(Debug, Clone)]
pub struct DecisionTrace {
    pub review_id: String,
    pub timestamp: DateTime<Utc>,
    pub pr: PrCoords,
    pub decision_path: String,
    pub gate_reason: String,
    pub ai_invoked: bool,
    pub ai_blocked: bool,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
    pub risk_bundle: Option<RiskBundle>,
    pub verdict: Option<Verdict>,
    pub comment_posted: bool,
    pub processing_time_ms: u64,
    pub instance_mode: String,
    pub injected_faults: Vec<String>,
    pub state_transitions: Vec<StateTransitionSummary>,
    pub final_state: PipelineState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub review_id: String,
    pub timestamp: DateTime<Utc>,
    pub pr: PrCoords,
    pub decision_path: String,
    pub gate_reason: String,
    pub ai_invoked: bool,
    pub ai_blocked: bool,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
    pub verdict: Option<Verdict>,
    pub comment_posted: bool,
    pub processing_time_ms: u64,
    pub instance_mode: String,
    pub injected_faults: Vec<String>,
    pub invariants: InvariantSummary,
    pub state_transitions: Vec<StateTransitionSummary>,
    pub final_state: PipelineState,
    pub postconditions: PostconditionSummary,
    pub formally_valid: bool,
    pub contract_version: String,
    pub contract_hash: String,
    pub execution_proof_hash: String,
    pub ledger_hash: String,
    pub previous_ledger_hash: String,
}

/// Assembles a record in the order spec.md §4.12 names: trace fields,
/// then invariant summary, then state history (already in trace), then
/// postcondition result, then `formally_valid`, then contract identity.
/// Proof and ledger hashes are filled in afterward by the caller once
/// computed — this builder exists precisely at the attestation boundary.
pub struct DecisionBuilder {
    trace: DecisionTrace,
    invariant_violations: Vec<Violation>,
    postcondition_report: PostconditionReport,
    contract_version: String,
    contract_hash: String,
}

impl DecisionBuilder {
    pub fn new(
        trace: DecisionTrace,
        invariant_violations: Vec<Violation>,
        postcondition_report: PostconditionReport,
        contract_version: String,
        contract_hash: String,
    ) -> Self {
        Self {
            trace,
            invariant_violations,
            postcondition_report,
            contract_version,
            contract_hash,
        }
    }

    /// Builds the record sans attestation fields; those are populated by
    /// `with_attestation` once the proof and ledger hashes exist.
    pub fn build_unsealed(&self) -> UnsealedDecision {
        let invariants = InvariantSummary::from_violations(&self.invariant_violations);
        let postconditions = PostconditionSummary::from_report(&self.postcondition_report);
        let no_severe = |v: &Violation| !matches!(v.severity, Severity::Error | Severity::Fatal);
        let formally_valid = self.invariant_violations.iter().all(no_severe)
            && self.postcondition_report.violations.iter().all(no_severe);

        UnsealedDecision {
            review_id: self.trace.review_id.clone(),
            timestamp: self.trace.timestamp,
            pr: self.trace.pr.clone(),
            decision_path: self.trace.decision_path.clone(),
            gate_reason: self.trace.gate_reason.clone(),
            ai_invoked: self.trace.ai_invoked,
            ai_blocked: self.trace.ai_blocked,
            fallback_used: self.trace.fallback_used,
            fallback_reason: self.trace.fallback_reason.clone(),
            verdict: self.trace.verdict,
            comment_posted: self.trace.comment_posted,
            processing_time_ms: self.trace.processing_time_ms,
            instance_mode: self.trace.instance_mode.clone(),
            injected_faults: self.trace.injected_faults.clone(),
            invariants,
            state_transitions: self.trace.state_transitions.clone(),
            final_state: self.trace.final_state,
            postconditions,
            formally_valid,
            contract_version: self.contract_version.clone(),
            contract_hash: self.contract_hash.clone(),
        }
    }
}

/// A fully-assembled record missing only the three attestation fields,
/// which require the record's own canonical form to compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealedDecision {
    pub review_id: String,
    pub timestamp: DateTime<Utc>,
    pub pr: PrCoords,
    pub decision_path: String,
    pub gate_reason: String,
    pub ai_invoked: bool,
    pub ai_blocked: bool,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
    pub verdict: Option<Verdict>,
    pub comment_posted: bool,
    pub processing_time_ms: u64,
    pub instance_mode: String,
    pub injected_faults: Vec<String>,
    pub invariants: InvariantSummary,
    pub state_transitions: Vec<StateTransitionSummary>,
    pub final_state: PipelineState,
    pub postconditions: PostconditionSummary,
    pub formally_valid: bool,
    pub contract_version: String,
    pub contract_hash: String,
}

impl UnsealedDecision {
    pub fn seal(
        self,
        execution_proof_hash: String,
        ledger_hash: String,
        previous_ledger_hash: String,
    ) -> DecisionRecord {
        DecisionRecord {
            review_id: self.review_id,
            timestamp: self.timestamp,
            pr: self.pr,
            decision_path: self.decision_path,
            gate_reason: self.gate_reason,
            ai_invoked: self.ai_invoked,
            ai_blocked: self.ai_blocked,
            fallback_used: self.fallback_used,
            fallback_reason: self.fallback_reason,
            verdict: self.verdict,
            comment_posted: self.comment_posted,
            processing_time_ms: self.processing_time_ms,
            instance_mode: self.instance_mode,
            injected_faults: self.injected_faults,
            invariants: self.invariants,
            state_transitions: self.state_transitions,
            final_state: self.final_state,
            postconditions: self.postconditions,
            formally_valid: self.formally_valid,
            contract_version: self.contract_version,
            contract_hash: self.contract_hash,
            execution_proof_hash,
            ledger_hash,
            previous_ledger_hash,
        }
    }
}

/// Append-only ring of recent decisions. Reads and writes are best-effort:
/// spec.md §4.12 is explicit that decision persistence must never
/// propagate a failure, so this type exposes no `Result`-returning API at
/// all — a push simply evicts the oldest entry once full.
pub struct DecisionHistory {
    bound: usize,
    entries: Mutex<VecDeque<DecisionRecord>>,
}

impl DecisionHistory {
    pub fn new(bound: usize) -> Self {
        Self {
            bound,
            entries: Mutex::new(VecDeque::with_capacity(bound)),
        }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_HISTORY_BOUND)
    }

    pub fn shared_bound() -> Self {
        Self::new(SHARED_HISTORY_BOUND)
    }

    pub fn push(&self, record: DecisionRecord) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.bound {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Newest-first, capped at `n`.
    pub fn get_recent(&self, n: usize) -> Vec<DecisionRecord> {
        let entries = self.entries.lock().unwrap();
        entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_checks::PostconditionReport;

    fn sample_trace() -> DecisionTrace {
        DecisionTrace {
            review_id: "rev-1".into(),
            timestamp: Utc::now(),
            pr: PrCoords { owner: "acme".into(), repo: "widgets".into(), number: 42 },
            decision_path: "ai_review".into(),
            gate_reason: "allow".into(),
            ai_invoked: true,
            ai_blocked: false,
            fallback_used: false,
            fallback_reason: None,
            risk_bundle: None,
            verdict: Some(Verdict::RequiresChanges),
            comment_posted: true,
            processing_time_ms: 120,
            instance_mode: "single-instance".into(),
            injected_faults: Vec::new(),
            state_transitions: vec![StateTransitionSummary {
                from: PipelineState::Received,
                to: PipelineState::DiffExtractionPending,
            }],
            final_state: PipelineState::CompletedSuccess,
        }
    }

    fn empty_report() -> PostconditionReport {
        PostconditionReport { total_checked: 14, passed: 14, violations: Vec::new() }
    }

    #[test]
    fn unsealed_decision_is_formally_valid_with_no_violations() {
        let builder = DecisionBuilder::new(
            sample_trace(),
            Vec::new(),
            empty_report(),
            "1.0.0".into(),
            "abc123".into(),
        );
        let unsealed = builder.build_unsealed();
        assert!(unsealed.formally_valid);
    }

    #[test]
    fn fatal_violation_makes_the_decision_not_formally_valid() {
        let violations = vec![Violation {
            id: "X".into(),
            description: "bad".into(),
            severity: Severity::Fatal,
        }];
        let builder = DecisionBuilder::new(
            sample_trace(),
            violations,
            empty_report(),
            "1.0.0".into(),
            "abc123".into(),
        );
        assert!(!builder.build_unsealed().formally_valid);
    }

    #[test]
    fn sealing_attaches_attestation_fields() {
        let builder = DecisionBuilder::new(
            sample_trace(),
            Vec::new(),
            empty_report(),
            "1.0.0".into(),
            "abc123".into(),
        );
        let record = builder
            .build_unsealed()
            .seal("proofhash".into(), "ledgerhash".into(), "GENESIS".into());
        assert_eq!(record.execution_proof_hash, "proofhash");
        assert_eq!(record.previous_ledger_hash, "GENESIS");
    }

    #[test]
    fn history_evicts_oldest_beyond_bound() {
        let history = DecisionHistory::new(2);
        for i in 0..5 {
            let builder = DecisionBuilder::new(
                sample_trace(),
                Vec::new(),
                empty_report(),
                "1.0.0".into(),
                "abc123".into(),
            );
            let record = builder.build_unsealed().seal(format!("p{i}"), format!("l{i}"), "GENESIS".into());
            history.push(record);
        }
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn get_recent_returns_newest_first() {
        let history = DecisionHistory::new(10);
        for i in 0..3 {
            let builder = DecisionBuilder::new(
                sample_trace(),
                Vec::new(),
                empty_report(),
                "1.0.0".into(),
                "abc123".into(),
            );
            let record = builder.build_unsealed().seal(format!("p{i}"), format!("l{i}"), "GENESIS".into());
            history.push(record);
        }
        let recent = history.get_recent(10);
        assert_eq!(recent[0].execution_proof_hash, "p2");
        assert_eq!(recent[2].execution_proof_hash, "p0");
    }
}
