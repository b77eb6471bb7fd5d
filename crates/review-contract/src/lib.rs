//! Execution contract: the frozen schema of states, invariants, and
//! postconditions that the running binary is validated against at boot.
//!
//! Grounded on `bpi-merkle`/`bpi-enc`'s domain-hash-then-compare pattern:
//! a schema is introspected from live code, canonically hashed, and
//! checked against a declared value. Here the "declared value" is
//! [`ExecutionContract::active`], the contract this binary claims to
//! implement; mismatches are reported with [`ContractViolation`] the same
//! way `bpi-receipts::FinalityProof::verify` reports a boolean outcome
//! plus a `tracing` log line rather than panicking.

use review_canon::{canonical_hash, truncate_hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const CONTRACT_VERSION: &str = "1.0.0";

/// All 28 pipeline states, grouped here by the bands spec.md uses for
/// documentation purposes only — the transition table (owned by
/// `review-fsm`) is what actually governs movement between them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum PipelineState {
    Received,
    DiffExtractionPending,
    DiffExtracted,
    DiffExtractionFailed,
    FilteringPending,
    Filtered,
    FilteredOut,
    PrecheckPending,
    Prechecked,
    AiGatingPending,
    AiApproved,
    AiBlockedSafe,
    AiBlockedManual,
    AiReviewPending,
    AiInvoked,
    AiResponded,
    AiValidated,
    FallbackPending,
    FallbackGenerated,
    ReviewReady,
    CommentPending,
    CommentPosted,
    CommentFailed,
    CompletedSuccess,
    CompletedSilent,
    CompletedWarning,
    AbortedError,
    AbortedFatal,
}

impl PipelineState {
    pub const ALL: [PipelineState; 28] = [
        PipelineState::Received,
        PipelineState::DiffExtractionPending,
        PipelineState::DiffExtracted,
        PipelineState::DiffExtractionFailed,
        PipelineState::FilteringPending,
        PipelineState::Filtered,
        PipelineState::FilteredOut,
        PipelineState::PrecheckPending,
        PipelineState::Prechecked,
        PipelineState::AiGatingPending,
        PipelineState::AiApproved,
        PipelineState::AiBlockedSafe,
        PipelineState::AiBlockedManual,
        PipelineState::AiReviewPending,
        PipelineState::AiInvoked,
        PipelineState::AiResponded,
        PipelineState::AiValidated,
        PipelineState::FallbackPending,
        PipelineState::FallbackGenerated,
        PipelineState::ReviewReady,
        PipelineState::CommentPending,
        PipelineState::CommentPosted,
        PipelineState::CommentFailed,
        PipelineState::CompletedSuccess,
        PipelineState::CompletedSilent,
        PipelineState::CompletedWarning,
        PipelineState::AbortedError,
        PipelineState::AbortedFatal,
    ];

    pub const TERMINAL: [PipelineState; 5] = [
        PipelineState::CompletedSuccess,
        PipelineState::CompletedSilent,
        PipelineState::CompletedWarning,
        PipelineState::AbortedError,
        PipelineState::AbortedFatal,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "RECEIVED",
            PipelineState::DiffExtractionPending => "DIFF_EXTRACTION_PENDING",
            PipelineState::DiffExtracted => "DIFF_EXTRACTED",
            PipelineState::DiffExtractionFailed => "DIFF_EXTRACTION_FAILED",
            PipelineState::FilteringPending => "FILTERING_PENDING",
            PipelineState::Filtered => "FILTERED",
            PipelineState::FilteredOut => "FILTERED_OUT",
            PipelineState::PrecheckPending => "PRECHECK_PENDING",
            PipelineState::Prechecked => "PRECHECKED",
            PipelineState::AiGatingPending => "AI_GATING_PENDING",
            PipelineState::AiApproved => "AI_APPROVED",
            PipelineState::AiBlockedSafe => "AI_BLOCKED_SAFE",
            PipelineState::AiBlockedManual => "AI_BLOCKED_MANUAL",
            PipelineState::AiReviewPending => "AI_REVIEW_PENDING",
            PipelineState::AiInvoked => "AI_INVOKED",
            PipelineState::AiResponded => "AI_RESPONDED",
            PipelineState::AiValidated => "AI_VALIDATED",
            PipelineState::FallbackPending => "FALLBACK_PENDING",
            PipelineState::FallbackGenerated => "FALLBACK_GENERATED",
            PipelineState::ReviewReady => "REVIEW_READY",
            PipelineState::CommentPending => "COMMENT_PENDING",
            PipelineState::CommentPosted => "COMMENT_POSTED",
            PipelineState::CommentFailed => "COMMENT_FAILED",
            PipelineState::CompletedSuccess => "COMPLETED_SUCCESS",
            PipelineState::CompletedSilent => "COMPLETED_SILENT",
            PipelineState::CompletedWarning => "COMPLETED_WARNING",
            PipelineState::AbortedError => "ABORTED_ERROR",
            PipelineState::AbortedFatal => "ABORTED_FATAL",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity classification shared by invariants and postconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmSchema {
    pub states: Vec<String>,
    pub terminal_states: Vec<String>,
    pub state_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantSchema {
    pub ids: Vec<String>,
    pub count: usize,
    pub severity_map: BTreeMap<String, Severity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostconditionSchema {
    pub ids: Vec<String>,
    pub count: usize,
    pub severity_map: BTreeMap<String, Severity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContract {
    pub version: String,
    pub fsm_schema: FsmSchema,
    pub invariant_schema: InvariantSchema,
    pub postcondition_schema: PostconditionSchema,
    pub decision_schema_hash: String,
    pub contract_hash: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub immutable: bool,
}

impl ExecutionContract {
    /// Build a contract from live schemas, deriving `contract_hash` as the
    /// canonical hash of the four sub-schemas plus version, truncated to
    /// 16 hex chars.
    pub fn build(
        version: &str,
        fsm_schema: FsmSchema,
        invariant_schema: InvariantSchema,
        postcondition_schema: PostconditionSchema,
        decision_schema_hash: String,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        #[derive(Serialize)]
        struct HashInput<'a> {
            version: &'a str,
            fsm_schema: &'a FsmSchema,
            invariant_schema: &'a InvariantSchema,
            postcondition_schema: &'a PostconditionSchema,
            decision_schema_hash: &'a str,
        }
        let input = HashInput {
            version,
            fsm_schema: &fsm_schema,
            invariant_schema: &invariant_schema,
            postcondition_schema: &postcondition_schema,
            decision_schema_hash: &decision_schema_hash,
        };
        let full = canonical_hash(&input).expect("contract schema always serializes");
        let contract_hash = truncate_hash(&full, 16);
        Self {
            version: version.to_string(),
            fsm_schema,
            invariant_schema,
            postcondition_schema,
            decision_schema_hash,
            contract_hash,
            created_at,
            immutable: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{severity}: {message}")]
pub struct ContractViolation {
    pub severity: Severity,
    pub message: String,
}

fn fatal(message: impl Into<String>) -> ContractViolation {
    ContractViolation {
        severity: Severity::Fatal,
        message: message.into(),
    }
}

fn error(message: impl Into<String>) -> ContractViolation {
    ContractViolation {
        severity: Severity::Error,
        message: message.into(),
    }
}

/// Rebuild the contract from live code (`current`) and compare it against
/// the declared active contract. Returns every violation found; an empty
/// vec means the binary matches what it claims to implement.
pub fn validate(current: &ExecutionContract, active: &ExecutionContract) -> Vec<ContractViolation> {
    let mut violations = Vec::new();

    if current.version != active.version {
        violations.push(fatal(format!(
            "contract version mismatch: active={} current={}",
            active.version, current.version
        )));
    }

    let cur_states: std::collections::BTreeSet<_> = current.fsm_schema.states.iter().collect();
    let act_states: std::collections::BTreeSet<_> = active.fsm_schema.states.iter().collect();
    for added in cur_states.difference(&act_states) {
        violations.push(fatal(format!("state added without contract bump: {added}")));
    }
    for removed in act_states.difference(&cur_states) {
        violations.push(fatal(format!(
            "state removed without contract bump: {removed}"
        )));
    }

    if current.invariant_schema.count != active.invariant_schema.count
        || current.invariant_schema.ids != active.invariant_schema.ids
    {
        violations.push(fatal("invariant id/count set changed"));
    }
    for (id, sev) in &current.invariant_schema.severity_map {
        if active.invariant_schema.severity_map.get(id) != Some(sev) {
            violations.push(error(format!("invariant {id} severity changed")));
        }
    }

    if current.postcondition_schema.count != active.postcondition_schema.count
        || current.postcondition_schema.ids != active.postcondition_schema.ids
    {
        violations.push(fatal("postcondition id/count set changed"));
    }
    for (id, sev) in &current.postcondition_schema.severity_map {
        if active.postcondition_schema.severity_map.get(id) != Some(sev) {
            violations.push(error(format!("postcondition {id} severity changed")));
        }
    }

    if current.decision_schema_hash != active.decision_schema_hash {
        violations.push(fatal("decision schema hash mismatch"));
    }

    if current.contract_hash != active.contract_hash && violations.is_empty() {
        violations.push(fatal(
            "contract hash mismatch with no structural diff found — bump CONTRACT_VERSION",
        ));
    }

    violations
}

pub fn has_fatal(violations: &[ContractViolation]) -> bool {
    violations.iter().any(|v| v.severity == Severity::Fatal)
}

/// Render the diagnostic dump the validator prints on a fatal mismatch.
pub fn diagnostic_dump(
    current: &ExecutionContract,
    active: &ExecutionContract,
    violations: &[ContractViolation],
) -> String {
    let mut out = String::new();
    out.push_str("EXECUTION CONTRACT VALIDATION FAILED\n");
    out.push_str(&format!("  expected contract_hash: {}\n", active.contract_hash));
    out.push_str(&format!("  current  contract_hash: {}\n", current.contract_hash));
    for v in violations {
        out.push_str(&format!("  [{}] {}\n", v.severity, v.message));
    }
    out.push_str("Bump CONTRACT_VERSION and regenerate the active contract if this change is intentional.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn schema() -> (FsmSchema, InvariantSchema, PostconditionSchema) {
        let fsm = FsmSchema {
            states: PipelineState::ALL.iter().map(|s| s.to_string()).collect(),
            terminal_states: PipelineState::TERMINAL.iter().map(|s| s.to_string()).collect(),
            state_count: PipelineState::ALL.len(),
        };
        let mut sev = BTreeMap::new();
        sev.insert("INV_A".to_string(), Severity::Warn);
        let invariants = InvariantSchema {
            ids: vec!["INV_A".to_string()],
            count: 1,
            severity_map: sev,
        };
        let mut psev = BTreeMap::new();
        psev.insert("POST_A".to_string(), Severity::Fatal);
        let postconditions = PostconditionSchema {
            ids: vec!["POST_A".to_string()],
            count: 1,
            severity_map: psev,
        };
        (fsm, invariants, postconditions)
    }

    #[test]
    fn identical_schemas_validate_clean() {
        let (fsm, inv, post) = schema();
        let c1 = ExecutionContract::build(
            CONTRACT_VERSION,
            fsm.clone(),
            inv.clone(),
            post.clone(),
            "deadbeef".into(),
            Utc::now(),
        );
        let c2 = ExecutionContract::build(
            CONTRACT_VERSION,
            fsm,
            inv,
            post,
            "deadbeef".into(),
            Utc::now(),
        );
        assert_eq!(c1.contract_hash, c2.contract_hash);
        assert!(validate(&c2, &c1).is_empty());
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let (fsm, inv, post) = schema();
        let active = ExecutionContract::build(
            "1.0.0",
            fsm.clone(),
            inv.clone(),
            post.clone(),
            "h".into(),
            Utc::now(),
        );
        let current = ExecutionContract::build("1.0.1", fsm, inv, post, "h".into(), Utc::now());
        let violations = validate(&current, &active);
        assert!(has_fatal(&violations));
    }

    #[test]
    fn state_removed_is_fatal() {
        let (fsm, inv, post) = schema();
        let active = ExecutionContract::build(
            CONTRACT_VERSION,
            fsm,
            inv.clone(),
            post.clone(),
            "h".into(),
            Utc::now(),
        );
        let mut fewer_states = active.fsm_schema.clone();
        fewer_states.states.pop();
        let current = ExecutionContract::build(
            CONTRACT_VERSION,
            fewer_states,
            inv,
            post,
            "h".into(),
            Utc::now(),
        );
        let violations = validate(&current, &active);
        assert!(has_fatal(&violations));
    }

    #[test]
    fn hash_is_pure_function_of_inputs() {
        let (fsm, inv, post) = schema();
        let c1 = ExecutionContract::build(
            CONTRACT_VERSION,
            fsm.clone(),
            inv.clone(),
            post.clone(),
            "h".into(),
            Utc::now(),
        );
        std::thread::sleep(std::time::Duration::from_millis(2));
        let c2 = ExecutionContract::build(CONTRACT_VERSION, fsm, inv, post, "h".into(), Utc::now());
        assert_eq!(c1.contract_hash, c2.contract_hash, "created_at must not affect hash");
    }
}
