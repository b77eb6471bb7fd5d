//! Invariant checker (evaluated throughout an execution) and postcondition
//! checker (evaluated once at the terminal state). Same shape, same
//! registry pattern, following spec.md §4.4/§4.5: a named predicate over a
//! context snapshot with optional fields, where a missing field makes the
//! predicate vacuously true so partial contexts validate targeted subsets.

use review_contract::{InvariantSchema, PipelineState, PostconditionSchema, Severity};
use std::collections::{BTreeMap, HashSet};

/// The review verdict an LLM (or the deterministic fallback) assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Safe,
    SafeWithConditions,
    RequiresChanges,
    HighRisk,
}

#[derive(Debug, Clone, Default)]
pub struct SemaphoreSnapshot {
    pub in_flight: i64,
    pub available: i64,
    pub max_permits: i64,
}

/// Context carried through an execution for invariant checks. Every field
/// is optional; a predicate that reads an absent field returns `true`.
#[derive(Debug, Clone, Default)]
pub struct InvariantContext {
    pub pipeline_semaphore: Option<SemaphoreSnapshot>,
    pub llm_semaphore: Option<SemaphoreSnapshot>,
    pub gate_allowed: Option<bool>,
    pub ai_invoked: Option<bool>,
    pub fallback_used: Option<bool>,
    pub fallback_reason: Option<String>,
    pub verdict: Option<Verdict>,
    pub risk_count: Option<usize>,
    pub decision_path: Option<String>,
    pub current_state: Option<PipelineState>,
    pub previous_state: Option<PipelineState>,
    pub about_to_invoke_llm: Option<bool>,
    pub about_to_post_comment: Option<bool>,
    pub comment_posted: Option<bool>,
    pub shared_store_enabled: Option<bool>,
    pub shared_store_healthy: Option<bool>,
    pub instance_mode: Option<String>,
}

pub const VALID_PATHS: &[&str] = &[
    "silent_exit_safe",
    "silent_exit_out",
    "manual_review_warning",
    "ai_review",
    "ai_fallback_quality",
    "ai_fallback_error",
    "error_exit",
];

type InvariantPredicate = fn(&InvariantContext) -> bool;

pub struct InvariantDef {
    pub id: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub predicate: InvariantPredicate,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    pub id: String,
    pub description: String,
    pub severity: Severity,
}

fn invariant_registry() -> Vec<InvariantDef> {
    vec![
        InvariantDef {
            id: "SEMAPHORE_PERMITS_NON_NEGATIVE",
            description: "semaphore in-flight and available counts never go negative",
            severity: Severity::Fatal,
            predicate: |ctx| {
                [&ctx.pipeline_semaphore, &ctx.llm_semaphore]
                    .iter()
                    .filter_map(|s| s.as_ref())
                    .all(|s| s.in_flight >= 0 && s.available >= 0)
            },
        },
        InvariantDef {
            id: "SEMAPHORE_PIPELINE_CONSERVED",
            description: "pipeline semaphore in_flight + available == max_permits",
            severity: Severity::Error,
            predicate: |ctx| match &ctx.pipeline_semaphore {
                Some(s) => s.in_flight + s.available == s.max_permits,
                None => true,
            },
        },
        InvariantDef {
            id: "SEMAPHORE_LLM_CONSERVED",
            description: "llm semaphore in_flight + available == max_permits",
            severity: Severity::Error,
            predicate: |ctx| match &ctx.llm_semaphore {
                Some(s) => s.in_flight + s.available == s.max_permits,
                None => true,
            },
        },
        InvariantDef {
            id: "GATE_RESPECTED",
            description: "the LLM is only invoked when the gate allowed it",
            severity: Severity::Fatal,
            predicate: |ctx| match (ctx.ai_invoked, ctx.gate_allowed) {
                (Some(true), Some(allowed)) => allowed,
                _ => true,
            },
        },
        InvariantDef {
            id: "GATE_BLOCKS_AI",
            description: "a skip decision from the gate never results in an AI invocation",
            severity: Severity::Fatal,
            predicate: |ctx| match (ctx.gate_allowed, ctx.ai_invoked) {
                (Some(false), Some(invoked)) => !invoked,
                _ => true,
            },
        },
        InvariantDef {
            id: "FALLBACK_HAS_REASON",
            description: "fallback_used implies a recorded fallback_reason",
            severity: Severity::Error,
            predicate: |ctx| match ctx.fallback_used {
                Some(true) => ctx.fallback_reason.is_some(),
                _ => true,
            },
        },
        InvariantDef {
            id: "VERDICT_RISKS_CONSISTENT",
            description: "verdict=safe has no risks, verdict=high_risk has at least one",
            severity: Severity::Warn,
            predicate: |ctx| match (ctx.verdict, ctx.risk_count) {
                (Some(Verdict::Safe), Some(n)) => n == 0,
                (Some(Verdict::HighRisk), Some(n)) => n > 0,
                _ => true,
            },
        },
        InvariantDef {
            id: "SILENT_EXIT_NO_COMMENT",
            description: "a silent-exit decision path never posts a comment",
            severity: Severity::Fatal,
            predicate: |ctx| match (&ctx.decision_path, ctx.about_to_post_comment) {
                (Some(path), Some(true)) if path.starts_with("silent_exit") => false,
                _ => true,
            },
        },
        InvariantDef {
            id: "PATH_IS_VALID",
            description: "decision_path is one of the enumerated decision paths",
            severity: Severity::Error,
            predicate: |ctx| match &ctx.decision_path {
                Some(path) => VALID_PATHS.contains(&path.as_str()),
                None => true,
            },
        },
        InvariantDef {
            id: "AI_INVOCATION_PRECONDITION",
            description: "the LLM is only invoked from AI_APPROVED or AI_REVIEW_PENDING",
            severity: Severity::Fatal,
            predicate: |ctx| match (ctx.about_to_invoke_llm, ctx.current_state) {
                (Some(true), Some(state)) => {
                    matches!(state, PipelineState::AiApproved | PipelineState::AiReviewPending)
                }
                _ => true,
            },
        },
        InvariantDef {
            id: "COMMENT_POST_PRECONDITION",
            description: "a comment is only published from COMMENT_PENDING",
            severity: Severity::Fatal,
            predicate: |ctx| match (ctx.about_to_post_comment, ctx.current_state) {
                (Some(true), Some(state)) => state == PipelineState::CommentPending,
                _ => true,
            },
        },
        InvariantDef {
            id: "TERMINAL_ABSORPTION",
            description: "a terminal previous_state never differs from current_state",
            severity: Severity::Fatal,
            predicate: |ctx| match (ctx.previous_state, ctx.current_state) {
                (Some(prev), Some(cur)) if prev.is_terminal() => prev == cur,
                _ => true,
            },
        },
        InvariantDef {
            id: "INSTANCE_MODE_CONSISTENT",
            description: "instance_mode matches shared-store enabled/healthy flags",
            severity: Severity::Error,
            predicate: |ctx| match (
                ctx.instance_mode.as_deref(),
                ctx.shared_store_enabled,
                ctx.shared_store_healthy,
            ) {
                (Some("single-instance"), Some(enabled), _) => !enabled,
                (Some("distributed"), Some(enabled), Some(healthy)) => enabled && healthy,
                (Some("degraded"), Some(enabled), Some(healthy)) => enabled && !healthy,
                _ => true,
            },
        },
        InvariantDef {
            id: "DECISION_COMMENT_CONSISTENT",
            description: "manual_review_warning eventually posts a comment; silent paths never do",
            severity: Severity::Error,
            predicate: |ctx| match (&ctx.decision_path, ctx.comment_posted) {
                (Some(path), Some(posted)) if path.starts_with("silent_exit") => !posted,
                _ => true,
            },
        },
    ]
}

pub fn invariant_schema() -> InvariantSchema {
    let registry = invariant_registry();
    let mut ids: Vec<String> = registry.iter().map(|d| d.id.to_string()).collect();
    ids.sort();
    let severity_map: BTreeMap<String, Severity> = registry
        .iter()
        .map(|d| (d.id.to_string(), d.severity))
        .collect();
    InvariantSchema {
        count: ids.len(),
        ids,
        severity_map,
    }
}

/// Evaluate every invariant (or just `ids`, if given) against `ctx` and
/// return the violations. Never panics: a predicate is a plain `fn`, so
/// there is nothing to catch, matching spec.md's "safe (non-throwing)
/// check mode" by construction rather than by catching unwinds.
pub fn safe_check(ctx: &InvariantContext, ids: Option<&[&str]>) -> Vec<Violation> {
    invariant_registry()
        .into_iter()
        .filter(|d| ids.map(|ids| ids.contains(&d.id)).unwrap_or(true))
        .filter(|d| !(d.predicate)(ctx))
        .map(|d| Violation {
            id: d.id.to_string(),
            description: d.description.to_string(),
            severity: d.severity,
        })
        .collect()
}

pub fn enforce(ctx: &InvariantContext) -> Result<(), Vec<Violation>> {
    let violations = safe_check(ctx, None);
    if violations.iter().any(|v| v.severity == Severity::Fatal) {
        Err(violations)
    } else {
        Ok(())
    }
}

/// Terminal-state context for postcondition evaluation.
#[derive(Debug, Clone, Default)]
pub struct PostconditionContext {
    pub final_state: Option<PipelineState>,
    pub is_terminal: Option<bool>,
    pub decision_path: Option<String>,
    pub comment_posted: Option<bool>,
    pub verdict: Option<Verdict>,
    pub ai_invoked: Option<bool>,
    pub ai_blocked: Option<bool>,
    pub fallback_used: Option<bool>,
    pub fallback_reason: Option<String>,
    pub state_transitions: Option<Vec<(PipelineState, PipelineState)>>,
    pub visited_states: Option<HashSet<PipelineState>>,
}

type PostconditionPredicate = fn(&PostconditionContext) -> bool;

pub struct PostconditionDef {
    pub id: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub predicate: PostconditionPredicate,
}

fn postcondition_registry() -> Vec<PostconditionDef> {
    vec![
        PostconditionDef {
            id: "SUCCESS_REQUIRES_COMMENT",
            description: "COMPLETED_SUCCESS implies a comment was posted",
            severity: Severity::Fatal,
            predicate: |ctx| match ctx.final_state {
                Some(PipelineState::CompletedSuccess) => ctx.comment_posted == Some(true),
                _ => true,
            },
        },
        PostconditionDef {
            id: "SUCCESS_REQUIRES_VERDICT",
            description: "COMPLETED_SUCCESS implies a verdict was recorded",
            severity: Severity::Fatal,
            predicate: |ctx| match ctx.final_state {
                Some(PipelineState::CompletedSuccess) => ctx.verdict.is_some(),
                _ => true,
            },
        },
        PostconditionDef {
            id: "SILENT_EXIT_NO_COMMENT",
            description: "COMPLETED_SILENT implies no comment was posted",
            severity: Severity::Fatal,
            predicate: |ctx| match ctx.final_state {
                Some(PipelineState::CompletedSilent) => ctx.comment_posted != Some(true),
                _ => true,
            },
        },
        PostconditionDef {
            id: "SILENT_EXIT_NO_LLM",
            description: "COMPLETED_SILENT implies the LLM was never invoked",
            severity: Severity::Fatal,
            predicate: |ctx| match ctx.final_state {
                Some(PipelineState::CompletedSilent) => ctx.ai_invoked != Some(true),
                _ => true,
            },
        },
        PostconditionDef {
            id: "MANUAL_WARNING_HAS_COMMENT",
            description: "COMPLETED_WARNING from a manual-review path implies a comment was posted",
            severity: Severity::Error,
            predicate: |ctx| match (ctx.final_state, ctx.ai_blocked) {
                (Some(PipelineState::CompletedWarning), Some(true)) => {
                    ctx.comment_posted == Some(true)
                }
                _ => true,
            },
        },
        PostconditionDef {
            id: "FALLBACK_REQUIRES_REASON",
            description: "fallback_used implies fallback_reason is present",
            severity: Severity::Error,
            predicate: |ctx| match ctx.fallback_used {
                Some(true) => ctx.fallback_reason.is_some(),
                _ => true,
            },
        },
        PostconditionDef {
            id: "ERROR_PATHS_NOT_SUCCESS",
            description: "ABORTED_* final states never report COMPLETED_SUCCESS semantics",
            severity: Severity::Fatal,
            predicate: |ctx| match ctx.final_state {
                Some(PipelineState::AbortedError) | Some(PipelineState::AbortedFatal) => {
                    ctx.comment_posted != Some(true) || ctx.verdict.is_none()
                }
                _ => true,
            },
        },
        PostconditionDef {
            id: "TERMINAL_STATE_REACHED",
            description: "every execution must end in a terminal state",
            severity: Severity::Fatal,
            predicate: |ctx| ctx.is_terminal.unwrap_or(true),
        },
        PostconditionDef {
            id: "REVIEW_READY_BEFORE_COMMENT",
            description: "a comment is never posted without first visiting REVIEW_READY",
            severity: Severity::Fatal,
            predicate: |ctx| match (&ctx.visited_states, ctx.comment_posted) {
                (Some(visited), Some(true)) => visited.contains(&PipelineState::ReviewReady),
                _ => true,
            },
        },
        PostconditionDef {
            id: "AI_APPROVED_BEFORE_INVOCATION",
            description: "the LLM is never invoked without first visiting AI_APPROVED",
            severity: Severity::Fatal,
            predicate: |ctx| match (&ctx.visited_states, ctx.ai_invoked) {
                (Some(visited), Some(true)) => visited.contains(&PipelineState::AiApproved),
                _ => true,
            },
        },
        PostconditionDef {
            id: "NON_EMPTY_TRANSITION_HISTORY",
            description: "every execution records at least one transition",
            severity: Severity::Error,
            predicate: |ctx| match &ctx.state_transitions {
                Some(t) => !t.is_empty(),
                None => true,
            },
        },
        PostconditionDef {
            id: "PATH_FINAL_STATE_CONSISTENT",
            description: "decision_path matches the band of the final state",
            severity: Severity::Error,
            predicate: |ctx| match (&ctx.decision_path, ctx.final_state) {
                (Some(path), Some(PipelineState::CompletedSuccess)) => path == "ai_review",
                (Some(path), Some(PipelineState::CompletedSilent)) => {
                    path.starts_with("silent_exit")
                }
                (Some(path), Some(PipelineState::CompletedWarning)) => {
                    path == "manual_review_warning"
                        || path == "ai_fallback_quality"
                        || path == "ai_fallback_error"
                }
                _ => true,
            },
        },
        PostconditionDef {
            id: "COMMENT_POSTED_HAS_VERDICT_OR_WARNING",
            description: "a posted comment implies either a verdict or a manual-warning path",
            severity: Severity::Warn,
            predicate: |ctx| match ctx.comment_posted {
                Some(true) => {
                    ctx.verdict.is_some()
                        || ctx.decision_path.as_deref() == Some("manual_review_warning")
                }
                _ => true,
            },
        },
        PostconditionDef {
            id: "WARNING_PATH_NOT_SILENT",
            description: "COMPLETED_WARNING never pairs with a silent-exit decision path",
            severity: Severity::Error,
            predicate: |ctx| match (ctx.final_state, &ctx.decision_path) {
                (Some(PipelineState::CompletedWarning), Some(path)) => {
                    !path.starts_with("silent_exit")
                }
                _ => true,
            },
        },
    ]
}

pub fn postcondition_schema() -> PostconditionSchema {
    let registry = postcondition_registry();
    let mut ids: Vec<String> = registry.iter().map(|d| d.id.to_string()).collect();
    ids.sort();
    let severity_map: BTreeMap<String, Severity> = registry
        .iter()
        .map(|d| (d.id.to_string(), d.severity))
        .collect();
    PostconditionSchema {
        count: ids.len(),
        ids,
        severity_map,
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PostconditionReport {
    pub total_checked: usize,
    pub passed: usize,
    pub violations: Vec<Violation>,
}

pub fn check_postconditions(ctx: &PostconditionContext) -> PostconditionReport {
    let registry = postcondition_registry();
    let violations: Vec<Violation> = registry
        .iter()
        .filter(|d| !(d.predicate)(ctx))
        .map(|d| Violation {
            id: d.id.to_string(),
            description: d.description.to_string(),
            severity: d.severity,
        })
        .collect();
    PostconditionReport {
        total_checked: registry.len(),
        passed: registry.len() - violations.len(),
        violations,
    }
}

/// `formally_valid` is the negation of "any error/fatal violation across
/// invariants and postconditions combined" (spec.md §4.5).
pub fn formally_valid(invariant_violations: &[Violation], postcondition_violations: &[Violation]) -> bool {
    !invariant_violations
        .iter()
        .chain(postcondition_violations)
        .any(|v| matches!(v.severity, Severity::Error | Severity::Fatal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourteen_invariants_and_postconditions() {
        assert_eq!(invariant_schema().count, 14);
        assert_eq!(postcondition_schema().count, 14);
    }

    #[test]
    fn missing_fields_are_vacuously_true() {
        let ctx = InvariantContext::default();
        assert!(safe_check(&ctx, None).is_empty());
    }

    #[test]
    fn gate_respected_catches_violation() {
        let ctx = InvariantContext {
            ai_invoked: Some(true),
            gate_allowed: Some(false),
            ..Default::default()
        };
        let violations = safe_check(&ctx, Some(&["GATE_RESPECTED"]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].id, "GATE_RESPECTED");
    }

    #[test]
    fn semaphore_conservation_flags_leak() {
        let ctx = InvariantContext {
            pipeline_semaphore: Some(SemaphoreSnapshot {
                in_flight: 3,
                available: 6,
                max_permits: 10,
            }),
            ..Default::default()
        };
        let violations = safe_check(&ctx, Some(&["SEMAPHORE_PIPELINE_CONSERVED"]));
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn enforce_errors_only_on_fatal() {
        let ctx = InvariantContext {
            verdict: Some(Verdict::Safe),
            risk_count: Some(2),
            ..Default::default()
        };
        // VERDICT_RISKS_CONSISTENT is only Warn severity, so enforce passes.
        assert!(enforce(&ctx).is_ok());
    }

    #[test]
    fn success_requires_comment_and_verdict() {
        let ctx = PostconditionContext {
            final_state: Some(PipelineState::CompletedSuccess),
            comment_posted: Some(false),
            verdict: None,
            ..Default::default()
        };
        let report = check_postconditions(&ctx);
        let ids: Vec<_> = report.violations.iter().map(|v| v.id.as_str()).collect();
        assert!(ids.contains(&"SUCCESS_REQUIRES_COMMENT"));
        assert!(ids.contains(&"SUCCESS_REQUIRES_VERDICT"));
        assert!(!formally_valid(&[], &report.violations));
    }

    #[test]
    fn silent_exit_clean_terminal_passes() {
        let mut visited = HashSet::new();
        visited.insert(PipelineState::FilteredOut);
        let ctx = PostconditionContext {
            final_state: Some(PipelineState::CompletedSilent),
            is_terminal: Some(true),
            decision_path: Some("silent_exit_out".to_string()),
            comment_posted: Some(false),
            ai_invoked: Some(false),
            state_transitions: Some(vec![(PipelineState::Received, PipelineState::FilteredOut)]),
            visited_states: Some(visited),
            ..Default::default()
        };
        let report = check_postconditions(&ctx);
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert!(formally_valid(&[], &report.violations));
    }
}
