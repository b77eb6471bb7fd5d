//! The pipeline state machine: a static, total transition table plus a
//! per-execution history log.
//!
//! Grounded on the teacher's `MerkleTree`/`TransactionReceipt` style of
//! small owned structs with a narrow, explicit API (`new`, `hash`,
//! `verify`) — here `StateMachine::new`, `transition`, `safe_transition`,
//! `can_transition`. Terminal absorption is enforced the same way
//! `bpi-merkle`'s `MerkleError::IndexOutOfBounds` turns a programming
//! mistake into a typed error rather than a panic.

use chrono::{DateTime, Utc};
use review_contract::{FsmSchema, PipelineState};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{from} is terminal and cannot transition to {to}")]
    TerminalStateViolation {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: PipelineState,
        to: PipelineState,
    },
}

/// The allowed successors of `state`. Every non-terminal state also
/// allows `AbortedFatal`, modeling "uncaught error in any non-terminal
/// state" (spec.md §4.11) without repeating it in every arm below.
pub fn allowed_transitions(state: PipelineState) -> HashSet<PipelineState> {
    use PipelineState::*;
    let mut set: HashSet<PipelineState> = match state {
        Received => [DiffExtractionPending].into(),
        DiffExtractionPending => [DiffExtracted, DiffExtractionFailed].into(),
        DiffExtracted => [FilteringPending].into(),
        DiffExtractionFailed => [AbortedError].into(),
        FilteringPending => [Filtered, FilteredOut].into(),
        Filtered => [PrecheckPending].into(),
        FilteredOut => [CompletedSilent].into(),
        PrecheckPending => [Prechecked].into(),
        Prechecked => [AiGatingPending].into(),
        AiGatingPending => [AiApproved, AiBlockedSafe, AiBlockedManual].into(),
        AiApproved => [AiReviewPending].into(),
        AiBlockedSafe => [CompletedSilent].into(),
        AiBlockedManual => [ReviewReady].into(),
        AiReviewPending => [AiInvoked].into(),
        AiInvoked => [AiResponded, FallbackPending].into(),
        AiResponded => [AiValidated, FallbackPending].into(),
        AiValidated => [ReviewReady, FallbackPending].into(),
        FallbackPending => [FallbackGenerated].into(),
        FallbackGenerated => [ReviewReady].into(),
        ReviewReady => [CommentPending].into(),
        CommentPending => [CommentPosted, CommentFailed].into(),
        CommentPosted => [CompletedSuccess, CompletedWarning].into(),
        CommentFailed => [CompletedWarning].into(),
        CompletedSuccess | CompletedSilent | CompletedWarning | AbortedError | AbortedFatal => {
            HashSet::new()
        }
    };
    if !state.is_terminal() {
        set.insert(AbortedFatal);
    }
    set
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransitionRecord {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// One execution's walk through the pipeline states. Owned exclusively by
/// the orchestrator for the lifetime of a single webhook.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: PipelineState,
    history: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new(initial: PipelineState) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn final_state_or_none(&self) -> Option<PipelineState> {
        self.current.is_terminal().then_some(self.current)
    }

    pub fn can_transition(&self, to: PipelineState) -> bool {
        allowed_transitions(self.current).contains(&to)
    }

    pub fn require_state(&self, allowed: &[PipelineState]) -> bool {
        allowed.contains(&self.current)
    }

    /// Transition to `to`, recording the move. Fails on a disallowed
    /// transition, including any attempt to leave a terminal state.
    pub fn transition(
        &mut self,
        to: PipelineState,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::TerminalStateViolation {
                from: self.current,
                to,
            });
        }
        if !self.can_transition(to) {
            return Err(TransitionError::IllegalTransition {
                from: self.current,
                to,
            });
        }
        self.history.push(TransitionRecord {
            from: self.current,
            to,
            at: Utc::now(),
            reason,
        });
        self.current = to;
        Ok(())
    }

    /// Non-throwing variant: swallow the error, return whether it moved.
    pub fn safe_transition(&mut self, to: PipelineState, reason: Option<String>) -> bool {
        self.transition(to, reason).is_ok()
    }
}

/// Introspect the static transition table into the schema the execution
/// contract hashes. Every state's successor set is derived from the same
/// `allowed_transitions` function the state machine itself uses, so the
/// schema can never drift from actual behavior.
pub fn fsm_schema() -> FsmSchema {
    FsmSchema {
        states: PipelineState::ALL.iter().map(|s| s.to_string()).collect(),
        terminal_states: PipelineState::TERMINAL
            .iter()
            .map(|s| s.to_string())
            .collect(),
        state_count: PipelineState::ALL.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn happy_path_reaches_completed_success() {
        let mut m = StateMachine::new(Received);
        let path = [
            DiffExtractionPending,
            DiffExtracted,
            FilteringPending,
            Filtered,
            PrecheckPending,
            Prechecked,
            AiGatingPending,
            AiApproved,
            AiReviewPending,
            AiInvoked,
            AiResponded,
            AiValidated,
            ReviewReady,
            CommentPending,
            CommentPosted,
            CompletedSuccess,
        ];
        for state in path {
            m.transition(state, None).unwrap();
        }
        assert_eq!(m.current(), CompletedSuccess);
        assert!(m.is_terminal());
        assert_eq!(m.history().len(), path.len());
    }

    #[test]
    fn terminal_state_absorbs_further_transitions() {
        let mut m = StateMachine::new(CompletedSilent);
        let err = m.transition(Received, None).unwrap_err();
        assert!(matches!(err, TransitionError::TerminalStateViolation { .. }));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut m = StateMachine::new(Received);
        let err = m.transition(CompletedSuccess, None).unwrap_err();
        assert!(matches!(err, TransitionError::IllegalTransition { .. }));
    }

    #[test]
    fn every_nonterminal_state_can_abort_fatal() {
        for state in PipelineState::ALL {
            if !state.is_terminal() {
                assert!(allowed_transitions(state).contains(&AbortedFatal), "{state}");
            }
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for state in PipelineState::TERMINAL {
            assert!(allowed_transitions(state).is_empty());
        }
    }

    #[test]
    fn safe_transition_never_panics_on_illegal_move() {
        let mut m = StateMachine::new(CompletedSuccess);
        assert!(!m.safe_transition(Received, None));
    }

    #[test]
    fn schema_lists_all_28_states_and_5_terminal() {
        let schema = fsm_schema();
        assert_eq!(schema.state_count, 28);
        assert_eq!(schema.terminal_states.len(), 5);
    }
}
