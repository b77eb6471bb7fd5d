//! Cryptographic attestation: the execution-proof hash sealed into every
//! decision record, the hash-chained ledger those proofs append to, and a
//! Merkle index recomputed on demand over the chronological proof-hash
//! sequence. Verification is the only mechanism that detects tampering —
//! nothing here prevents a record from being edited at rest, it only
//! makes the edit detectable.

use chrono::{DateTime, Utc};
use review_canon::{merkle, sha256_hex, truncate_hash};
use review_decision::{DecisionRecord, UnsealedDecision};
use serde::Serialize;
use thiserror::Error;

pub const GENESIS: &str = "GENESIS";
const PROOF_HASH_LEN: usize = 32;

#[derive(Debug, Serialize)]
struct ProofFingerprint<'a> {
    contract_hash: &'a str,
    contract_version: &'a str,
    review_id: &'a str,
    pr: ProofPr<'a>,
    decision_path: &'a str,
    final_state: String,
    state_transitions: Vec<ProofTransition>,
    invariants: ProofInvariantSummary<'a>,
    postconditions: ProofPostconditionSummary<'a>,
    verdict: Option<String>,
    ai_invoked: bool,
    fallback_used: bool,
    comment_posted: bool,
    processing_time_ms: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ProofPr<'a> {
    owner: &'a str,
    repo: &'a str,
    number: u64,
}

#[derive(Debug, Serialize)]
struct ProofTransition {
    from: String,
    to: String,
}

#[derive(Debug, Serialize)]
struct ProofInvariantSummary<'a> {
    total: usize,
    warn: usize,
    error: usize,
    fatal: usize,
    violation_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct ProofPostconditionSummary<'a> {
    total_checked: usize,
    passed: bool,
    violation_count: usize,
    violation_ids: &'a [String],
}

/// Computes the 32-hex execution-proof hash over an unsealed decision's
/// canonical fingerprint. Pure function of the decision's content: calling
/// this twice on the same decision yields the same hash.
pub fn compute_proof_hash(decision: &UnsealedDecision) -> String {
    let fingerprint = ProofFingerprint {
        contract_hash: &decision.contract_hash,
        contract_version: &decision.contract_version,
        review_id: &decision.review_id,
        pr: ProofPr {
            owner: &decision.pr.owner,
            repo: &decision.pr.repo,
            number: decision.pr.number,
        },
        decision_path: &decision.decision_path,
        final_state: decision.final_state.as_str().to_string(),
        state_transitions: decision
            .state_transitions
            .iter()
            .map(|t| ProofTransition {
                from: t.from.as_str().to_string(),
                to: t.to.as_str().to_string(),
            })
            .collect(),
        invariants: ProofInvariantSummary {
            total: decision.invariants.total,
            warn: decision.invariants.warn,
            error: decision.invariants.error,
            fatal: decision.invariants.fatal,
            violation_ids: &decision.invariants.violation_ids,
        },
        postconditions: ProofPostconditionSummary {
            total_checked: decision.postconditions.total_checked,
            passed: decision.postconditions.passed,
            violation_count: decision.postconditions.violation_count,
            violation_ids: &decision.postconditions.violation_ids,
        },
        verdict: decision.verdict.map(|v| format!("{v:?}")),
        ai_invoked: decision.ai_invoked,
        fallback_used: decision.fallback_used,
        comment_posted: decision.comment_posted,
        processing_time_ms: decision.processing_time_ms,
        timestamp: decision.timestamp,
    };

    let full = review_canon::canonical_hash(&fingerprint).expect("fingerprint always serializes");
    truncate_hash(&full, PROOF_HASH_LEN)
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger entry generation failed: {0}")]
    LedgerGeneration(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub previous_ledger_hash: String,
    pub execution_proof_hash: String,
    pub review_id: String,
    pub timestamp: DateTime<Utc>,
    pub ledger_hash: String,
}

fn ledger_hash(prev: &str, proof: &str, review_id: &str, timestamp: &DateTime<Utc>) -> String {
    let material = format!("{prev}|{proof}|{review_id}|{}", timestamp.to_rfc3339());
    sha256_hex(material.as_bytes())
}

/// Hash-chained ledger of execution proofs. `last_hash` starts at
/// [`GENESIS`] and advances with each append.
pub struct Ledger {
    last_hash: String,
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            last_hash: GENESIS.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Appends one entry chaining `previous_ledger_hash` to the freshly
    /// computed `ledger_hash`, and advances `last_hash`. Returns the
    /// previous hash (needed by the caller to seal the decision record)
    /// and the new entry.
    pub fn append(
        &mut self,
        execution_proof_hash: &str,
        review_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(String, LedgerEntry), LedgerError> {
        if execution_proof_hash.is_empty() || review_id.is_empty() {
            return Err(LedgerError::LedgerGeneration(
                "proof hash and review id must be non-empty".into(),
            ));
        }
        let previous = self.last_hash.clone();
        let hash = ledger_hash(&previous, execution_proof_hash, review_id, &timestamp);
        let entry = LedgerEntry {
            previous_ledger_hash: previous.clone(),
            execution_proof_hash: execution_proof_hash.to_string(),
            review_id: review_id.to_string(),
            timestamp,
            ledger_hash: hash.clone(),
        };
        self.entries.push(entry.clone());
        self.last_hash = hash;
        Ok((previous, entry))
    }

    /// Recomputes every entry's hash from its stored fields and compares
    /// against the stored chain. Returns `Ok(())` if intact, or the index
    /// of the first broken link.
    pub fn verify_chain(&self) -> Result<(), usize> {
        let mut expected_prev = GENESIS.to_string();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.previous_ledger_hash != expected_prev {
                return Err(i);
            }
            let recomputed = ledger_hash(
                &entry.previous_ledger_hash,
                &entry.execution_proof_hash,
                &entry.review_id,
                &entry.timestamp,
            );
            if recomputed != entry.ledger_hash {
                return Err(i);
            }
            expected_prev = entry.ledger_hash.clone();
        }
        Ok(())
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("execution proof hash mismatch: stored {stored}, recomputed {recomputed}")]
    ProofMismatch { stored: String, recomputed: String },
}

/// Recomputes the proof hash from a sealed decision record and compares
/// it to the stored one. The only way tampering with a stored record is
/// detected (spec.md §4.13).
pub fn verify_proof(record: &DecisionRecord) -> Result<(), VerificationError> {
    let unsealed = UnsealedDecision {
        review_id: record.review_id.clone(),
        timestamp: record.timestamp,
        pr: record.pr.clone(),
        decision_path: record.decision_path.clone(),
        gate_reason: record.gate_reason.clone(),
        ai_invoked: record.ai_invoked,
        ai_blocked: record.ai_blocked,
        fallback_used: record.fallback_used,
        fallback_reason: record.fallback_reason.clone(),
        verdict: record.verdict,
        comment_posted: record.comment_posted,
        processing_time_ms: record.processing_time_ms,
        instance_mode: record.instance_mode.clone(),
        injected_faults: record.injected_faults.clone(),
        invariants: record.invariants.clone(),
        state_transitions: record.state_transitions.clone(),
        final_state: record.final_state,
        postconditions: record.postconditions.clone(),
        formally_valid: record.formally_valid,
        contract_version: record.contract_version.clone(),
        contract_hash: record.contract_hash.clone(),
    };
    let recomputed = compute_proof_hash(&unsealed);
    if recomputed == record.execution_proof_hash {
        Ok(())
    } else {
        Err(VerificationError::ProofMismatch {
            stored: record.execution_proof_hash.clone(),
            recomputed,
        })
    }
}

/// Builds a Merkle tree over a chronological (oldest-first) sequence of
/// execution-proof hashes. Recomputed on demand rather than maintained
/// incrementally, per spec.md §4.14.
pub fn merkle_root(proof_hashes: &[String]) -> Result<String, merkle::MerkleError> {
    merkle::root(proof_hashes)
}

pub fn merkle_proof(
    proof_hashes: &[String],
    index: usize,
) -> Result<merkle::MerkleProof, merkle::MerkleError> {
    merkle::proof(proof_hashes, index)
}

pub fn merkle_verify(leaf: &str, steps: &[merkle::ProofStep], root: &str) -> bool {
    merkle::verify(leaf, steps, root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_decision::{InvariantSummary, PostconditionSummary, PrCoords, StateTransitionSummary};
    use review_contract::PipelineState;

    fn sample_unsealed() -> UnsealedDecision {
        UnsealedDecision {
            review_id: "rev-1".into(),
            timestamp: Utc::now(),
            pr: PrCoords { owner: "acme".into(), repo: "widgets".into(), number: 1 },
            decision_path: "ai_review".into(),
            gate_reason: "allow".into(),
            ai_invoked: true,
            ai_blocked: false,
            fallback_used: false,
            fallback_reason: None,
            verdict: None,
            comment_posted: true,
            processing_time_ms: 50,
            instance_mode: "single-instance".into(),
            injected_faults: Vec::new(),
            invariants: InvariantSummary {
                total: 14,
                warn: 0,
                error: 0,
                fatal: 0,
                violation_ids: Vec::new(),
            },
            state_transitions: vec![StateTransitionSummary {
                from: PipelineState::Received,
                to: PipelineState::DiffExtractionPending,
            }],
            final_state: PipelineState::CompletedSuccess,
            postconditions: PostconditionSummary {
                total_checked: 14,
                passed: true,
                violation_count: 0,
                violation_ids: Vec::new(),
            },
            formally_valid: true,
            contract_version: "1.0.0".into(),
            contract_hash: "abc123".into(),
        }
    }

    #[test]
    fn proof_hash_is_32_hex_chars() {
        let hash = compute_proof_hash(&sample_unsealed());
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn proof_hash_is_pure_function_of_content() {
        let a = compute_proof_hash(&sample_unsealed());
        let b = compute_proof_hash(&sample_unsealed());
        assert_eq!(a, b);
    }

    #[test]
    fn ledger_starts_at_genesis_and_chains_forward() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.last_hash(), GENESIS);
        let (prev1, _) = ledger.append("proof1", "rev-1", Utc::now()).unwrap();
        assert_eq!(prev1, GENESIS);
        let (prev2, _) = ledger.append("proof2", "rev-2", Utc::now()).unwrap();
        assert_eq!(prev2, ledger.entries()[0].ledger_hash);
        assert!(ledger.verify_chain().is_ok());
    }

    #[test]
    fn tampered_entry_breaks_chain_verification() {
        let mut ledger = Ledger::new();
        ledger.append("proof1", "rev-1", Utc::now()).unwrap();
        ledger.append("proof2", "rev-2", Utc::now()).unwrap();
        ledger.entries[0].execution_proof_hash = "tampered".into();
        assert_eq!(ledger.verify_chain(), Err(0));
    }

    #[test]
    fn verify_proof_detects_field_tampering() {
        let unsealed = sample_unsealed();
        let proof = compute_proof_hash(&unsealed);
        let mut record = unsealed.seal(proof, "ledgerhash".into(), GENESIS.into());
        assert!(verify_proof(&record).is_ok());
        record.comment_posted = !record.comment_posted;
        assert!(verify_proof(&record).is_err());
    }

    #[test]
    fn merkle_round_trips_over_proof_hashes() {
        let hashes: Vec<String> = (0..4).map(|i| sha256_hex(format!("h{i}").as_bytes())).collect();
        let root = merkle_root(&hashes).unwrap();
        let proof = merkle_proof(&hashes, 2).unwrap();
        assert!(merkle_verify(&proof.leaf_hash, &proof.steps, &root));
    }

    #[test]
    fn empty_hash_list_is_explicit_failure() {
        assert!(merkle_root(&[]).is_err());
    }
}
