//! Fault injection controller: named, configurable failure points that
//! sensitive call sites invoke unconditionally. When disabled (the
//! default) every call is a no-op; chaos tests enable specific codes with
//! `always`, `never`, or a probability to drive the same code paths a
//! real outage would take.

use rand::Rng;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCode {
    DiffExtractionFail,
    LlmTimeout,
    LlmMalformedResponse,
    SharedStoreUnavailable,
    SemaphoreLeakSimulation,
    DecisionWriteFailure,
    MetricsWriteFailure,
    PublishCommentFailure,
}

impl FaultCode {
    pub const ALL: [FaultCode; 8] = [
        FaultCode::DiffExtractionFail,
        FaultCode::LlmTimeout,
        FaultCode::LlmMalformedResponse,
        FaultCode::SharedStoreUnavailable,
        FaultCode::SemaphoreLeakSimulation,
        FaultCode::DecisionWriteFailure,
        FaultCode::MetricsWriteFailure,
        FaultCode::PublishCommentFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::DiffExtractionFail => "DIFF_EXTRACTION_FAIL",
            FaultCode::LlmTimeout => "LLM_TIMEOUT",
            FaultCode::LlmMalformedResponse => "LLM_MALFORMED_RESPONSE",
            FaultCode::SharedStoreUnavailable => "SHARED_STORE_UNAVAILABLE",
            FaultCode::SemaphoreLeakSimulation => "SEMAPHORE_LEAK_SIMULATION",
            FaultCode::DecisionWriteFailure => "DECISION_WRITE_FAILURE",
            FaultCode::MetricsWriteFailure => "METRICS_WRITE_FAILURE",
            FaultCode::PublishCommentFailure => "PUBLISH_COMMENT_FAILURE",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Trigger {
    Always,
    Never,
    Probability(f64),
}

#[derive(Debug, Error)]
#[error("fault injected: {0}")]
pub struct FaultInjection(pub String);

/// Process-wide fault controller. Cheap to clone (an `Arc` inside would be
/// natural for the orchestrator's shared context, but the controller is
/// itself just a lock around a small map, mirroring how
/// `review-coordination`'s in-memory backends guard their state).
pub struct FaultController {
    enabled: bool,
    triggers: RwLock<HashMap<FaultCode, Trigger>>,
}

impl FaultController {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            triggers: RwLock::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn configure(&self, code: FaultCode, trigger: Trigger) {
        self.triggers.write().unwrap().insert(code, trigger);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Evaluate `code`'s trigger and either return `Ok(())` or a
    /// [`FaultInjection`] error the caller should treat exactly like the
    /// real failure it mirrors.
    pub fn maybe_inject(&self, code: FaultCode) -> Result<(), FaultInjection> {
        if !self.enabled {
            return Ok(());
        }
        let trigger = self
            .triggers
            .read()
            .unwrap()
            .get(&code)
            .copied()
            .unwrap_or(Trigger::Never);
        let fires = match trigger {
            Trigger::Always => true,
            Trigger::Never => false,
            Trigger::Probability(p) => rand::thread_rng().gen::<f64>() < p,
        };
        if fires {
            tracing::warn!(fault = code.as_str(), "fault injected");
            Err(FaultInjection(code.as_str().to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_controller_never_fires() {
        let c = FaultController::disabled();
        c.configure(FaultCode::LlmTimeout, Trigger::Always);
        assert!(c.maybe_inject(FaultCode::LlmTimeout).is_ok());
    }

    #[test]
    fn always_trigger_fires_every_time() {
        let c = FaultController::new(true);
        c.configure(FaultCode::PublishCommentFailure, Trigger::Always);
        for _ in 0..5 {
            assert!(c.maybe_inject(FaultCode::PublishCommentFailure).is_err());
        }
    }

    #[test]
    fn never_trigger_never_fires() {
        let c = FaultController::new(true);
        c.configure(FaultCode::DiffExtractionFail, Trigger::Never);
        for _ in 0..5 {
            assert!(c.maybe_inject(FaultCode::DiffExtractionFail).is_ok());
        }
    }

    #[test]
    fn unconfigured_code_defaults_to_never() {
        let c = FaultController::new(true);
        assert!(c.maybe_inject(FaultCode::MetricsWriteFailure).is_ok());
    }

    #[test]
    fn all_eight_codes_are_distinct() {
        let names: std::collections::HashSet<_> =
            FaultCode::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(names.len(), 8);
    }
}
