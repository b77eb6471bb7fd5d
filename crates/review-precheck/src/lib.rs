//! Risk pre-check and deterministic gate. The actual pattern-matching rule
//! set that scans a diff is treated as a pluggable classifier (spec.md's
//! "EXPLICITLY OUT OF SCOPE" list names "the regex pre-check rule set"
//! itself); this crate owns the signal shape, the gate rule applied to it,
//! and a default classifier that file-name/content heuristics can satisfy
//! without pulling in a real regex engine dependency.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskCategory {
    PublicApi,
    StateMutation,
    Authentication,
    Persistence,
    Concurrency,
    ErrorHandling,
    Networking,
    Dependencies,
    CriticalPath,
    SecurityBoundaries,
}

impl RiskCategory {
    pub const ALL: [RiskCategory; 10] = [
        RiskCategory::PublicApi,
        RiskCategory::StateMutation,
        RiskCategory::Authentication,
        RiskCategory::Persistence,
        RiskCategory::Concurrency,
        RiskCategory::ErrorHandling,
        RiskCategory::Networking,
        RiskCategory::Dependencies,
        RiskCategory::CriticalPath,
        RiskCategory::SecurityBoundaries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::PublicApi => "public-api",
            RiskCategory::StateMutation => "state-mutation",
            RiskCategory::Authentication => "authentication",
            RiskCategory::Persistence => "persistence",
            RiskCategory::Concurrency => "concurrency",
            RiskCategory::ErrorHandling => "error-handling",
            RiskCategory::Networking => "networking",
            RiskCategory::Dependencies => "dependencies",
            RiskCategory::CriticalPath => "critical-path",
            RiskCategory::SecurityBoundaries => "security-boundaries",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategorySignal {
    pub detected: bool,
    pub confidence: Option<Confidence>,
    pub locations: Vec<String>,
    pub examples: Vec<String>,
}

/// A file touched by the change, as seen by the classifier. Content is an
/// opaque string; a real deployment's classifier may read only a diff hunk
/// rather than the whole file, but the shape here is classifier-agnostic.
#[derive(Debug, Clone)]
pub struct DiffFile {
    pub path: String,
    pub content: String,
}

/// The per-category signal bundle plus its derived counters, exactly the
/// shape the gate and the decision record both consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBundle {
    pub signals: BTreeMap<RiskCategory, CategorySignal>,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    pub critical_categories: Vec<RiskCategory>,
}

impl RiskBundle {
    fn from_signals(signals: BTreeMap<RiskCategory, CategorySignal>) -> Self {
        let mut high_count = 0;
        let mut medium_count = 0;
        let mut low_count = 0;
        let mut critical_categories = Vec::new();

        for (category, signal) in &signals {
            if !signal.detected {
                continue;
            }
            match signal.confidence {
                Some(Confidence::High) => high_count += 1,
                Some(Confidence::Medium) => medium_count += 1,
                Some(Confidence::Low) => low_count += 1,
                None => {}
            }
            if *category == RiskCategory::CriticalPath && signal.detected {
                critical_categories.push(*category);
            } else if signal.detected && signal.confidence == Some(Confidence::High) {
                critical_categories.push(*category);
            }
        }

        Self {
            signals,
            high_count,
            medium_count,
            low_count,
            critical_categories,
        }
    }
}

pub trait RiskClassifier: Send + Sync {
    fn classify(&self, files: &[DiffFile]) -> RiskBundle;
}

/// Default heuristic classifier: keyword and path-pattern matching per
/// category, with a file-name-driven critical-path signal layered on top
/// regardless of content, mirroring spec.md §4.9's "file-name classifier
/// also supplies a critical-path signal."
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    fn scan(category: RiskCategory, files: &[DiffFile], keywords: &[&str]) -> CategorySignal {
        let mut locations = Vec::new();
        let mut examples = Vec::new();
        for file in files {
            for keyword in keywords {
                if file.content.contains(keyword) {
                    locations.push(file.path.clone());
                    examples.push(keyword.to_string());
                }
            }
        }
        let detected = !locations.is_empty();
        let confidence = if locations.len() >= 3 {
            Some(Confidence::High)
        } else if locations.len() >= 1 {
            Some(Confidence::Medium)
        } else {
            None
        };
        let _ = category;
        CategorySignal {
            detected,
            confidence,
            locations,
            examples,
        }
    }

    fn critical_path_signal(files: &[DiffFile]) -> CategorySignal {
        const CRITICAL_MARKERS: &[&str] = &["main.rs", "lib.rs", "auth", "payment", "migration"];
        let locations: Vec<String> = files
            .iter()
            .filter(|f| CRITICAL_MARKERS.iter().any(|m| f.path.contains(m)))
            .map(|f| f.path.clone())
            .collect();
        let detected = !locations.is_empty();
        CategorySignal {
            detected,
            confidence: detected.then_some(Confidence::High),
            locations,
            examples: Vec::new(),
        }
    }
}

impl RiskClassifier for HeuristicClassifier {
    fn classify(&self, files: &[DiffFile]) -> RiskBundle {
        let mut signals = BTreeMap::new();
        signals.insert(
            RiskCategory::PublicApi,
            Self::scan(RiskCategory::PublicApi, files, &["pub fn", "pub struct", "pub trait"]),
        );
        signals.insert(
            RiskCategory::StateMutation,
            Self::scan(RiskCategory::StateMutation, files, &["&mut self", "static mut", "RefCell"]),
        );
        signals.insert(
            RiskCategory::Authentication,
            Self::scan(RiskCategory::Authentication, files, &["password", "token", "auth", "credential"]),
        );
        signals.insert(
            RiskCategory::Persistence,
            Self::scan(RiskCategory::Persistence, files, &["INSERT INTO", "DELETE FROM", "migration", "sqlx::query"]),
        );
        signals.insert(
            RiskCategory::Concurrency,
            Self::scan(RiskCategory::Concurrency, files, &["Mutex", "Arc<", "tokio::spawn", "unsafe"]),
        );
        signals.insert(
            RiskCategory::ErrorHandling,
            Self::scan(RiskCategory::ErrorHandling, files, &["unwrap()", "expect(", "panic!"]),
        );
        signals.insert(
            RiskCategory::Networking,
            Self::scan(RiskCategory::Networking, files, &["reqwest", "TcpStream", "http://", "https://"]),
        );
        signals.insert(
            RiskCategory::Dependencies,
            Self::scan(RiskCategory::Dependencies, files, &["Cargo.toml", "[dependencies]"]),
        );
        signals.insert(RiskCategory::CriticalPath, Self::critical_path_signal(files));
        signals.insert(
            RiskCategory::SecurityBoundaries,
            Self::scan(RiskCategory::SecurityBoundaries, files, &["sanitize", "escape", "validate_input", "CORS"]),
        );
        RiskBundle::from_signals(signals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Skip,
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub decision: GateDecision,
    pub reason: &'static str,
}

/// The deterministic gate from spec.md §4.9, evaluated purely on the
/// bundle's derived counters so the same bundle always yields the same
/// decision regardless of when or how often it's evaluated.
pub fn gate(bundle: &RiskBundle) -> GateOutcome {
    if bundle.high_count == 0 && bundle.medium_count == 0 {
        return GateOutcome {
            decision: GateDecision::Skip,
            reason: "safe",
        };
    }
    if bundle.high_count > 5 {
        return GateOutcome {
            decision: GateDecision::Skip,
            reason: "manual review required",
        };
    }
    GateOutcome {
        decision: GateDecision::Allow,
        reason: "allow",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> DiffFile {
        DiffFile {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn empty_bundle_skips_safe() {
        let bundle = RiskBundle::from_signals(BTreeMap::new());
        let outcome = gate(&bundle);
        assert_eq!(outcome.decision, GateDecision::Skip);
        assert_eq!(outcome.reason, "safe");
    }

    #[test]
    fn more_than_five_high_skips_manual_review() {
        let mut signals = BTreeMap::new();
        for (i, category) in RiskCategory::ALL.iter().take(6).enumerate() {
            signals.insert(
                *category,
                CategorySignal {
                    detected: true,
                    confidence: Some(Confidence::High),
                    locations: vec![format!("f{i}.rs")],
                    examples: vec![],
                },
            );
        }
        let bundle = RiskBundle::from_signals(signals);
        assert_eq!(bundle.high_count, 6);
        let outcome = gate(&bundle);
        assert_eq!(outcome.decision, GateDecision::Skip);
        assert_eq!(outcome.reason, "manual review required");
    }

    #[test]
    fn moderate_risk_allows() {
        let mut signals = BTreeMap::new();
        signals.insert(
            RiskCategory::Authentication,
            CategorySignal {
                detected: true,
                confidence: Some(Confidence::Medium),
                locations: vec!["auth.rs".into()],
                examples: vec!["token".into()],
            },
        );
        let bundle = RiskBundle::from_signals(signals);
        let outcome = gate(&bundle);
        assert_eq!(outcome.decision, GateDecision::Allow);
    }

    #[test]
    fn heuristic_classifier_detects_authentication_keyword() {
        let classifier = HeuristicClassifier;
        let files = vec![file("src/auth.rs", "fn check(password: &str) -> bool { true }")];
        let bundle = classifier.classify(&files);
        assert!(bundle.signals[&RiskCategory::Authentication].detected);
    }

    #[test]
    fn critical_path_detected_by_filename_regardless_of_content() {
        let classifier = HeuristicClassifier;
        let files = vec![file("src/main.rs", "fn main() {}")];
        let bundle = classifier.classify(&files);
        assert!(bundle.signals[&RiskCategory::CriticalPath].detected);
        assert!(bundle.critical_categories.contains(&RiskCategory::CriticalPath));
    }

    #[test]
    fn gate_decision_is_a_pure_function_of_the_bundle() {
        let classifier = HeuristicClassifier;
        let files = vec![file("src/lib.rs", "pub fn run() {}")];
        let bundle1 = classifier.classify(&files);
        let bundle2 = classifier.classify(&files);
        assert_eq!(gate(&bundle1).decision, gate(&bundle2).decision);
    }
}
