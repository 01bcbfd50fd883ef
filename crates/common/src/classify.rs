//! Shared failure-classification taxonomy (§4.7 Debugger step 1, §4.8
//! IterativeLoop step 5: "classify the error with the same taxonomy the
//! Debugger uses"). Lives in `common` rather than duplicated in both the
//! `polyagent-agents` Debugger adapter and `polyagent-orchestrator`'s
//! `IterativeLoop`, which both need it and would otherwise need a
//! dependency edge on each other to share it.

use serde::{Deserialize, Serialize};

/// `TestFailure(kind)` taxonomy (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    MissingDependency,
    SpecMismatch,
    ImplementationBug,
    FlakyTest,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::MissingDependency => "missing_dependency",
            Self::SpecMismatch => "spec_mismatch",
            Self::ImplementationBug => "implementation_bug",
            Self::FlakyTest => "flaky_test",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure priority bucket for repair-task ordering (§4.8 step 5:
/// "Priority is 1 for syntax/import/contract issues, 2 for logic, 3 for
/// unknown").
impl FailureKind {
    pub fn repair_priority(&self) -> u8 {
        match self {
            Self::MissingDependency => 1,
            Self::SpecMismatch | Self::ImplementationBug => 2,
            Self::Timeout | Self::FlakyTest => 3,
        }
    }
}

/// Classification result with a confidence score (§4.7 step 1).
#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: FailureKind,
    pub confidence: f32,
}

/// Classify a failure from its error text/traceback. `implementation_bug`
/// is the default for anything that doesn't match a more specific
/// pattern (§4.7 step 1).
pub fn classify_failure(error_text: &str) -> Classification {
    let lower = error_text.to_lowercase();

    let rules: &[(&[&str], FailureKind, f32)] = &[
        (&["timed out", "timeout", "deadline exceeded"], FailureKind::Timeout, 0.9),
        (
            &["modulenotfounderror", "no module named", "importerror", "cannot find module", "unresolved import"],
            FailureKind::MissingDependency,
            0.85,
        ),
        (
            &["assertionerror", "assert_eq", "expected:", "assertion failed", "assert ", "does not match"],
            FailureKind::SpecMismatch,
            0.7,
        ),
    ];

    for (needles, kind, confidence) in rules {
        if needles.iter().any(|n| lower.contains(n)) {
            return Classification { kind: *kind, confidence: *confidence };
        }
    }

    Classification { kind: FailureKind::ImplementationBug, confidence: 0.4 }
}
