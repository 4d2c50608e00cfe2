use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use sift_blocks::Fingerprint;

// ── Typed ID wrappers ──────────────────────────────────────────────

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(NodeId);
typed_id!(FingerprintId);

// ── Test results ───────────────────────────────────────────────────

/// Outcome of one phase of a test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// Report for one phase (setup, call or teardown).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub outcome: Outcome,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
}

impl PhaseReport {
    pub fn passed(duration: f64) -> Self {
        Self {
            outcome: Outcome::Passed,
            duration,
        }
    }

    pub fn failed(duration: f64) -> Self {
        Self {
            outcome: Outcome::Failed,
            duration,
        }
    }
}

/// Per-phase results of one test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    #[serde(default)]
    pub setup: Option<PhaseReport>,
    #[serde(default)]
    pub call: Option<PhaseReport>,
    #[serde(default)]
    pub teardown: Option<PhaseReport>,
}

impl TestResult {
    /// A result whose call phase passed in `duration` seconds.
    pub fn passed(duration: f64) -> Self {
        Self {
            call: Some(PhaseReport::passed(duration)),
            ..Self::default()
        }
    }

    /// A result whose call phase failed in `duration` seconds.
    pub fn failed(duration: f64) -> Self {
        Self {
            call: Some(PhaseReport::failed(duration)),
            ..Self::default()
        }
    }

    fn phases(&self) -> impl Iterator<Item = &PhaseReport> {
        [&self.setup, &self.call, &self.teardown]
            .into_iter()
            .flatten()
    }

    /// Whether any phase failed.
    pub fn failed_any(&self) -> bool {
        self.phases().any(|p| p.outcome == Outcome::Failed)
    }

    /// Sum of all phase durations.
    pub fn total_duration(&self) -> f64 {
        self.phases().map(|p| p.duration).sum()
    }

    fn duration_of(phase: Option<&PhaseReport>) -> f64 {
        phase.map_or(0.0, |p| p.duration)
    }

    pub fn setup_duration(&self) -> f64 {
        Self::duration_of(self.setup.as_ref())
    }

    pub fn call_duration(&self) -> f64 {
        Self::duration_of(self.call.as_ref())
    }

    pub fn teardown_duration(&self) -> f64 {
        Self::duration_of(self.teardown.as_ref())
    }
}

/// One executed test as reported by a runner integration.
///
/// `files` maps a path (absolute or relative to the project root) to the line
/// numbers executed in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecution {
    pub name: String,
    #[serde(default)]
    pub files: BTreeMap<String, BTreeSet<usize>>,
    #[serde(default)]
    pub result: TestResult,
}

// ── Store records ──────────────────────────────────────────────────

/// A fingerprint of one file as observed by one test, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintRecord {
    pub file_name: String,
    pub fingerprint: Fingerprint,
    /// Seconds since the epoch, when the file existed.
    pub mtime: Option<f64>,
    /// Content hash (`fsha`) at the time of observation.
    pub checksum: Option<String>,
}

/// One stored fingerprint row with the aggregated failure count of the nodes
/// depending on it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileFingerprintRow {
    pub id: FingerprintId,
    pub file_name: String,
    pub fingerprint: Fingerprint,
    pub mtime: Option<f64>,
    pub checksum: Option<String>,
    pub failed_count: i64,
}

/// A node depending on a changed fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedFileData {
    pub file_name: String,
    pub node_name: String,
    pub fingerprint: Fingerprint,
    pub id: FingerprintId,
    pub failed: bool,
}

/// A stored test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub setup_duration: f64,
    pub call_duration: f64,
    pub teardown_duration: f64,
    pub failed: bool,
}

impl NodeRecord {
    pub fn total_duration(&self) -> f64 {
        self.setup_duration + self.call_duration + self.teardown_duration
    }
}

/// Refresh of the acceleration fields of one fingerprint row.
#[derive(Debug, Clone, PartialEq)]
pub struct MtimeUpdate {
    pub id: FingerprintId,
    pub mtime: f64,
    pub checksum: String,
}

/// Store-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Nodes in the current environment.
    pub nodes: u64,
    /// Fingerprint rows.
    pub fingerprints: u64,
    /// Node–fingerprint edges.
    pub edges: u64,
    /// Distinct file names with at least one fingerprint.
    pub files: u64,
    /// Database file size in bytes.
    pub db_size_bytes: u64,
}

// ── Stability ──────────────────────────────────────────────────────

/// Result of classifying every stored node and file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub stable_nodes: HashSet<String>,
    pub unstable_nodes: HashSet<String>,
    pub stable_files: HashSet<String>,
    pub unstable_files: HashSet<String>,
    pub changed_fingerprints: HashSet<FingerprintId>,
    /// Rows whose cached mtime/checksum were refreshed during classification.
    pub refreshed: usize,
}

impl StabilityReport {
    pub fn is_stable(&self, node_name: &str) -> bool {
        self.stable_nodes.contains(node_name)
    }
}

/// Partition of the candidate tests of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub must_run: Vec<String>,
    pub may_skip: Vec<String>,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    /// The run was aborted (keyboard interrupt, crash).
    pub interrupted: bool,
    /// Every collected test was considered: no filter, no partial collection.
    pub full_run: bool,
}

impl SessionOutcome {
    pub fn full() -> Self {
        Self {
            interrupted: false,
            full_run: true,
        }
    }

    pub fn partial() -> Self {
        Self {
            interrupted: false,
            full_run: false,
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            full_run: false,
        }
    }
}

/// Home file of a test: its node name up to the first `::`.
pub fn home_file(node_name: &str) -> &str {
    node_name.split("::").next().unwrap_or(node_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_file_splits_on_first_separator() {
        assert_eq!(home_file("tests/test_a.py::TestX::test_y"), "tests/test_a.py");
        assert_eq!(home_file("docs/usage.txt"), "docs/usage.txt");
    }

    #[test]
    fn any_failed_phase_marks_result_failed() {
        let result = TestResult {
            setup: Some(PhaseReport::passed(0.1)),
            call: Some(PhaseReport::passed(0.2)),
            teardown: Some(PhaseReport::failed(0.3)),
        };
        assert!(result.failed_any());
        assert!((result.total_duration() - 0.6).abs() < 1e-9);
        assert!(!TestResult::passed(1.0).failed_any());
        assert!(TestResult::default().total_duration().abs() < f64::EPSILON);
    }

    #[test]
    fn test_execution_deserializes_with_defaults() {
        let exec: TestExecution = serde_json::from_str(
            r#"{"name": "tests/test_a.py::test_f", "files": {"a.py": [3, 1]},
                "result": {"call": {"outcome": "failed", "duration": 0.5}}}"#,
        )
        .unwrap();
        assert_eq!(exec.files["a.py"].iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(exec.result.failed_any());
        assert!(exec.result.setup.is_none());

        let bare: TestExecution = serde_json::from_str(r#"{"name": "t"}"#).unwrap();
        assert!(bare.files.is_empty());
        assert!(!bare.result.failed_any());
    }
}
