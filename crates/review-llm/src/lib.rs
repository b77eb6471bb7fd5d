//! LLM review collaborator. Owns the `generate_review` contract from
//! spec.md §4.10: prompt assembly, permit-gated external call, reply
//! validation, quality-gating, and the deterministic fallback path that
//! keeps the pipeline live when the collaborator fails in any way. The
//! HTTP client that actually talks to a model provider is out of scope
//! (spec.md's "EXPLICITLY OUT OF SCOPE" list) and is represented here as a
//! pluggable trait.

use async_trait::async_trait;
use review_coordination::PermitSemaphore;
use review_faults::{FaultCode, FaultController};
use review_precheck::{Confidence, RiskBundle, RiskCategory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const CALL_TEMPERATURE: f64 = 0.0;
pub const MAX_OUTPUT_TOKENS: u32 = 2048;
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_RETRIES: u32 = 1;

const BOILERPLATE_PHRASES: &[&str] = &[
    "looks good",
    "lgtm",
    "no issues found",
    "code is fine",
    "seems okay",
    "appears correct",
    "looks fine to me",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Safe,
    SafeWithConditions,
    RequiresChanges,
    HighRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub assessment: String,
    pub risks: Vec<String>,
    pub assumptions: Vec<String>,
    pub tradeoffs: Vec<String>,
    pub failure_modes: Vec<String>,
    pub recommendations: Vec<String>,
    pub verdict: Verdict,
}

impl ReviewOutput {
    fn total_items(&self) -> usize {
        self.risks.len()
            + self.assumptions.len()
            + self.tradeoffs.len()
            + self.failure_modes.len()
            + self.recommendations.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackReason {
    pub trigger: &'static str,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewTrace {
    pub output: ReviewOutput,
    pub fallback_used: bool,
    pub fallback_reason: Option<FallbackReason>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm call timed out")]
    Timeout,
    #[error("llm permit refused")]
    PermitRefused,
    #[error("llm reply was not valid JSON: {0}")]
    ParseFailure(String),
    #[error("llm reply failed validation: {0}")]
    ValidationFailure(String),
    #[error("llm reply failed quality gate: {0}")]
    QualityRejection(String),
    #[error("fault injected: {0}")]
    Fault(#[from] review_faults::FaultInjection),
}

/// The pluggable external call. A production implementation wraps an HTTP
/// client; this crate ships no such implementation since the client's
/// wire details are out of scope.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

pub fn build_prompts(bundle: &RiskBundle) -> (String, String) {
    let system = "You are a precise, conservative code reviewer. Respond with a single \
        JSON object containing assessment, risks, assumptions, tradeoffs, failure_modes, \
        recommendations, and verdict."
        .to_string();

    let mut user = String::from("Pre-check risk signals:\n");
    for (category, signal) in &bundle.signals {
        if signal.detected {
            user.push_str(&format!(
                "- {}: confidence={:?}, locations={:?}\n",
                category.as_str(),
                signal.confidence,
                signal.locations
            ));
        }
    }
    user.push_str(&format!(
        "high={} medium={} low={}\n",
        bundle.high_count, bundle.medium_count, bundle.low_count
    ));
    (system, user)
}

fn validate_reply(raw: &str) -> Result<ReviewOutput, LlmError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| LlmError::ParseFailure(e.to_string()))?;

    let output: ReviewOutput = serde_json::from_value(value)
        .map_err(|e| LlmError::ValidationFailure(e.to_string()))?;

    Ok(output)
}

fn quality_gate(output: &ReviewOutput) -> Result<(), LlmError> {
    let lower = output.assessment.to_lowercase();
    if BOILERPLATE_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Err(LlmError::QualityRejection("boilerplate phrase".into()));
    }
    if output.assessment.len() < 20 {
        return Err(LlmError::QualityRejection("assessment too short".into()));
    }
    if output.total_items() == 0 {
        return Err(LlmError::QualityRejection("no items across any category".into()));
    }
    if output.verdict == Verdict::Safe && !output.risks.is_empty() {
        return Err(LlmError::QualityRejection("safe verdict with non-empty risks".into()));
    }
    if output.verdict == Verdict::HighRisk && output.risks.is_empty() {
        return Err(LlmError::QualityRejection("high_risk verdict with empty risks".into()));
    }
    Ok(())
}

fn deterministic_verdict(bundle: &RiskBundle) -> Verdict {
    if bundle.high_count >= 3 {
        Verdict::HighRisk
    } else if bundle.high_count >= 1 {
        Verdict::RequiresChanges
    } else {
        Verdict::SafeWithConditions
    }
}

fn fallback_review(bundle: &RiskBundle, trigger: &'static str, details: String) -> ReviewTrace {
    let verdict = deterministic_verdict(bundle);
    let risks: Vec<String> = bundle
        .critical_categories
        .iter()
        .map(|c| format!("potential risk in {}", c.as_str()))
        .collect();

    let assessment = if risks.is_empty() {
        "Automated fallback review: no critical categories detected, manual confirmation recommended.".to_string()
    } else {
        format!(
            "Automated fallback review: {} critical categor{} detected, manual confirmation recommended.",
            risks.len(),
            if risks.len() == 1 { "y" } else { "ies" }
        )
    };

    ReviewTrace {
        output: ReviewOutput {
            assessment,
            risks,
            assumptions: Vec::new(),
            tradeoffs: Vec::new(),
            failure_modes: Vec::new(),
            recommendations: vec!["manual review required".to_string()],
            verdict,
        },
        fallback_used: true,
        fallback_reason: Some(FallbackReason { trigger, details }),
    }
}

/// Runs the full C10 contract: acquire the LLM permit, call the client with
/// one retry under a hard timeout, validate and quality-gate the reply,
/// and fall back deterministically on any failure. The permit is always
/// released, regardless of exit path.
pub async fn generate_review(
    client: &dyn LlmClient,
    llm_permits: &dyn PermitSemaphore,
    faults: &FaultController,
    bundle: &RiskBundle,
) -> ReviewTrace {
    if !llm_permits.try_acquire().await {
        return fallback_review(bundle, "permit_refused", "llm permit unavailable".into());
    }

    let trace = run_call_with_retry(client, faults, bundle).await;
    llm_permits.release().await;
    trace
}

async fn run_call_with_retry(
    client: &dyn LlmClient,
    faults: &FaultController,
    bundle: &RiskBundle,
) -> ReviewTrace {
    let (system_prompt, user_prompt) = build_prompts(bundle);

    for attempt in 0..=MAX_RETRIES {
        let result = attempt_call(client, faults, &system_prompt, &user_prompt).await;
        match result {
            Ok(output) => return ReviewTrace { output, fallback_used: false, fallback_reason: None },
            Err(err) if attempt < MAX_RETRIES => {
                tracing::warn!(error = %err, attempt, "llm call failed, retrying");
                continue;
            }
            Err(err) => {
                return fallback_review(bundle, trigger_for(&err), err.to_string());
            }
        }
    }
    unreachable!("loop always returns within MAX_RETRIES + 1 iterations")
}

fn trigger_for(err: &LlmError) -> &'static str {
    match err {
        LlmError::Timeout => "timeout",
        LlmError::PermitRefused => "permit_refused",
        LlmError::ParseFailure(_) => "parse_failure",
        LlmError::ValidationFailure(_) => "validation_failure",
        LlmError::QualityRejection(_) => "quality_rejection",
        LlmError::Fault(_) => "fault_injected",
    }
}

async fn attempt_call(
    client: &dyn LlmClient,
    faults: &FaultController,
    system_prompt: &str,
    user_prompt: &str,
) -> Result<ReviewOutput, LlmError> {
    faults.maybe_inject(FaultCode::LlmTimeout)?;
    faults.maybe_inject(FaultCode::LlmMalformedResponse)?;

    let raw = tokio::time::timeout(CALL_TIMEOUT, client.call(system_prompt, user_prompt))
        .await
        .map_err(|_| LlmError::Timeout)??;

    let output = validate_reply(&raw)?;
    quality_gate(&output)?;
    Ok(output)
}

/// A trivial client used only for tests and as a wiring placeholder;
/// always returns a fixed, well-formed reply.
pub struct EchoClient {
    pub reply: Arc<str>,
}

#[async_trait]
impl LlmClient for EchoClient {
    async fn call(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
        Ok(self.reply.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_coordination::LocalSemaphore;
    use std::collections::BTreeMap;

    fn empty_bundle() -> RiskBundle {
        RiskBundle {
            signals: BTreeMap::new(),
            high_count: 0,
            medium_count: 0,
            low_count: 0,
            critical_categories: Vec::new(),
        }
    }

    fn high_risk_bundle(n: usize) -> RiskBundle {
        let mut bundle = empty_bundle();
        bundle.high_count = n;
        bundle.critical_categories = vec![RiskCategory::CriticalPath; n.min(1)];
        bundle
    }

    #[tokio::test]
    async fn valid_reply_is_accepted_without_fallback() {
        let reply = serde_json::json!({
            "assessment": "This change touches authentication and needs careful review.",
            "risks": ["token leakage"],
            "assumptions": [],
            "tradeoffs": [],
            "failure_modes": [],
            "recommendations": ["add tests"],
            "verdict": "requires_changes"
        })
        .to_string();
        let client = EchoClient { reply: reply.into() };
        let permits = LocalSemaphore::new(3, Arc::new(FaultController::disabled()));
        let faults = FaultController::disabled();
        let trace = generate_review(&client, &permits, &faults, &empty_bundle()).await;
        assert!(!trace.fallback_used);
        assert_eq!(trace.output.verdict, Verdict::RequiresChanges);
    }

    #[tokio::test]
    async fn malformed_json_falls_back() {
        let client = EchoClient { reply: "not json".into() };
        let permits = LocalSemaphore::new(3, Arc::new(FaultController::disabled()));
        let faults = FaultController::disabled();
        let trace = generate_review(&client, &permits, &faults, &high_risk_bundle(3)).await;
        assert!(trace.fallback_used);
        assert_eq!(trace.output.verdict, Verdict::HighRisk);
        assert_eq!(trace.fallback_reason.unwrap().trigger, "parse_failure");
    }

    #[tokio::test]
    async fn boilerplate_assessment_triggers_quality_fallback() {
        let reply = serde_json::json!({
            "assessment": "looks good",
            "risks": [],
            "assumptions": [],
            "tradeoffs": [],
            "failure_modes": [],
            "recommendations": [],
            "verdict": "safe"
        })
        .to_string();
        let client = EchoClient { reply: reply.into() };
        let permits = LocalSemaphore::new(3, Arc::new(FaultController::disabled()));
        let faults = FaultController::disabled();
        let trace = generate_review(&client, &permits, &faults, &empty_bundle()).await;
        assert!(trace.fallback_used);
        assert_eq!(trace.fallback_reason.unwrap().trigger, "quality_rejection");
    }

    #[tokio::test]
    async fn safe_verdict_with_risks_is_rejected() {
        let reply = serde_json::json!({
            "assessment": "A sufficiently long assessment describing the change in detail.",
            "risks": ["something"],
            "assumptions": [],
            "tradeoffs": [],
            "failure_modes": [],
            "recommendations": [],
            "verdict": "safe"
        })
        .to_string();
        let client = EchoClient { reply: reply.into() };
        let permits = LocalSemaphore::new(3, Arc::new(FaultController::disabled()));
        let faults = FaultController::disabled();
        let trace = generate_review(&client, &permits, &faults, &empty_bundle()).await;
        assert!(trace.fallback_used);
    }

    #[tokio::test]
    async fn refused_permit_falls_back_immediately() {
        let client = EchoClient { reply: "irrelevant".into() };
        let permits = LocalSemaphore::new(0, Arc::new(FaultController::disabled()));
        let faults = FaultController::disabled();
        let trace = generate_review(&client, &permits, &faults, &high_risk_bundle(1)).await;
        assert!(trace.fallback_used);
        assert_eq!(trace.fallback_reason.unwrap().trigger, "permit_refused");
    }

    #[tokio::test]
    async fn permit_is_released_after_successful_call() {
        let reply = serde_json::json!({
            "assessment": "A sufficiently long, non-boilerplate assessment of the change.",
            "risks": [],
            "assumptions": [],
            "tradeoffs": [],
            "failure_modes": [],
            "recommendations": ["add tests"],
            "verdict": "safe_with_conditions"
        })
        .to_string();
        let client = EchoClient { reply: reply.into() };
        let permits = LocalSemaphore::new(1, Arc::new(FaultController::disabled()));
        let faults = FaultController::disabled();
        generate_review(&client, &permits, &faults, &empty_bundle()).await;
        assert!(permits.try_acquire().await);
    }

    #[test]
    fn deterministic_verdict_thresholds_match_contract() {
        assert_eq!(deterministic_verdict(&high_risk_bundle(3)), Verdict::HighRisk);
        assert_eq!(deterministic_verdict(&high_risk_bundle(1)), Verdict::RequiresChanges);
        assert_eq!(deterministic_verdict(&high_risk_bundle(0)), Verdict::SafeWithConditions);
    }
}
