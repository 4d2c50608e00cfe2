// The session engine: one instance per test session.
//
// A runner integration opens a session, asks which candidates may be skipped,
// feeds back each executed test's coverage, and finishes the session. Recorded
// tests are buffered and only written back by `finish`, so an interrupted
// session leaves the store as it found it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use sift_blocks::create_fingerprint;

use crate::config::SiftConfig;
use crate::error::StoreError;
use crate::source_tree::SourceTree;
use crate::stability;
use crate::store::FingerprintStore;
use crate::store::sqlite::{SqliteStore, StoreOptions};
use crate::types::{
    FingerprintRecord, Selection, SessionOutcome, StabilityReport, StoreStats, TestExecution,
    TestResult, home_file,
};

/// Metadata key of the last finished session's timestamp.
pub const LAST_RUN_KEY: &str = "last_run_at";

/// Metadata key of the dependency signature the stored tests ran against.
pub const PACKAGES_KEY: &str = "packages";

/// A recorded test waiting for write-back.
#[derive(Debug)]
struct PendingNode {
    name: String,
    records: Vec<FingerprintRecord>,
    result: TestResult,
}

/// Saving statistics accumulated between `select` and `finish`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Savings {
    tests_saved: usize,
    tests_all: usize,
    time_saved: f64,
    time_all: f64,
}

/// Long-lived engine state for one test session.
#[derive(Debug)]
pub struct Session {
    config: SiftConfig,
    store: Box<dyn FingerprintStore>,
    tree: SourceTree,
    omit: Vec<glob::Pattern>,
    report: Option<StabilityReport>,
    /// Candidates of the last `select`, the tests this run collected.
    collected: Option<Vec<String>>,
    savings: Savings,
    pending: Vec<PendingNode>,
}

impl Session {
    /// Open the store and source tree `config` describes.
    pub fn open(config: SiftConfig) -> crate::error::Result<Self> {
        let store = SqliteStore::open(&config.datafile_path(), &StoreOptions::from_config(&config))?;
        let tree = SourceTree::from_config(&config);
        Self::new(config, Box::new(store), tree)
    }

    /// Assemble a session from parts.
    pub fn new(
        config: SiftConfig,
        store: Box<dyn FingerprintStore>,
        tree: SourceTree,
    ) -> crate::error::Result<Self> {
        let omit = config.omit_patterns()?;
        Ok(Self {
            config,
            store,
            tree,
            omit,
            report: None,
            collected: None,
            savings: Savings::default(),
            pending: Vec::new(),
        })
    }

    pub fn config(&self) -> &SiftConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn FingerprintStore {
        self.store.as_ref()
    }

    pub fn stats(&self) -> crate::error::Result<StoreStats> {
        self.store.stats()
    }

    /// Classify every stored node, once per session. Every node is unstable
    /// when the dependency signature differs from the stored one.
    pub fn determine_stable(&mut self) -> crate::error::Result<&StabilityReport> {
        let report = match self.report.take() {
            Some(report) => report,
            None if self.packages_changed()? => stability::all_unstable(self.store.as_ref())?,
            None => stability::classify(self.store.as_ref(), &mut self.tree)?,
        };
        Ok(self.report.insert(report))
    }

    /// Whether `[session] packages` differs from what the stored tests ran
    /// against. A store without a stored signature has not changed.
    pub fn packages_changed(&self) -> crate::error::Result<bool> {
        let stored = self.store.fetch_attribute(PACKAGES_KEY, None)?;
        Ok(stored.is_some_and(|v| v.as_str() != Some(self.config.session.packages.as_str())))
    }

    /// Split `candidates` into tests that must run and tests that may be
    /// skipped. Unknown and unstable tests must run.
    pub fn select(&mut self, candidates: &[String]) -> crate::error::Result<Selection> {
        let select = self.config.session.select;
        let report = self.determine_stable()?.clone();
        let durations: HashMap<String, f64> = self
            .store
            .all_nodes()?
            .into_iter()
            .map(|n| {
                let total = n.total_duration();
                (n.name, total)
            })
            .collect();

        let mut selection = Selection::default();
        let mut savings = Savings {
            tests_all: candidates.len(),
            ..Savings::default()
        };
        for name in candidates {
            let duration = durations.get(name).copied().unwrap_or_default();
            savings.time_all += duration;
            if report.is_stable(name) {
                savings.tests_saved += 1;
                savings.time_saved += duration;
                if select {
                    selection.may_skip.push(name.clone());
                    continue;
                }
            }
            selection.must_run.push(name.clone());
        }

        info!(
            candidates = candidates.len(),
            must_run = selection.must_run.len(),
            may_skip = selection.may_skip.len(),
            select,
            "Selected tests"
        );
        self.collected = Some(candidates.to_vec());
        self.savings = savings;
        Ok(selection)
    }

    /// Fingerprint the files one executed test covered. The result is written
    /// back by [`Session::finish`].
    pub fn record(&mut self, execution: &TestExecution) -> crate::error::Result<()> {
        if !self.config.session.collect {
            debug!(test = %execution.name, "Collection disabled, not recording");
            return Ok(());
        }
        if self.config.store.read_only {
            return Err(StoreError::ReadOnly(format!("record {}", execution.name)).into());
        }

        let mut covered: HashMap<String, BTreeSet<usize>> = HashMap::new();
        for (path, lines) in &execution.files {
            match self.relative_name(path) {
                Some(name) => covered.entry(name).or_default().extend(lines),
                None => debug!(path = %path, "Ignoring file outside the project"),
            }
        }
        let home = home_file(&execution.name).to_string();
        covered.entry(home).or_default();

        let mut names: Vec<String> = covered.keys().cloned().collect();
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if self.is_omitted(&name) {
                continue;
            }
            if let Some(record) = self.fingerprint_record(&name, &covered[&name])? {
                records.push(record);
            }
        }

        debug!(test = %execution.name, files = records.len(), "Recorded test");
        self.pending.push(PendingNode {
            name: execution.name.clone(),
            records,
            result: execution.result.clone(),
        });
        Ok(())
    }

    /// Record results collected by parallel workers.
    pub fn record_batch(&mut self, executions: &[TestExecution]) -> crate::error::Result<()> {
        for execution in executions {
            self.record(execution)?;
        }
        info!(count = executions.len(), "Recorded test batch");
        Ok(())
    }

    /// End the session: write back recorded tests, one transaction each, and
    /// update saving statistics. After a dependency change, tests not rerun
    /// are dropped. After a full run, nodes that were not collected are
    /// dropped and unused fingerprints swept.
    pub fn finish(&mut self, outcome: SessionOutcome) -> crate::error::Result<()> {
        if outcome.interrupted {
            warn!(
                discarded = self.pending.len(),
                "Session interrupted, skipping write-back"
            );
            self.pending.clear();
            return Ok(());
        }
        if self.config.store.read_only {
            debug!("Read-only session, skipping write-back");
            return Ok(());
        }

        let packages_changed = self.packages_changed()?;
        let pending = std::mem::take(&mut self.pending);
        for node in &pending {
            self.store
                .insert_node_fingerprints(&node.name, &node.records, &node.result)?;
        }
        self.report = None;
        // Without collection nothing was rerun, so the stored signature stays.
        if self.config.session.collect {
            if packages_changed {
                let rerun: Vec<String> = pending.iter().map(|n| n.name.clone()).collect();
                let dropped = self.store.sync_db_fs_nodes(&rerun)?;
                info!(dropped, "Dependencies changed, dropped tests that were not rerun");
            }
            self.store.write_attribute(
                PACKAGES_KEY,
                &serde_json::Value::String(self.config.session.packages.clone()),
                None,
            )?;
        }

        let prefix = if self.config.session.select {
            ""
        } else {
            "potential_"
        };
        let keys = [
            format!("{prefix}tests_saved"),
            format!("{prefix}tests_all"),
            format!("{prefix}time_saved"),
            format!("{prefix}time_all"),
        ];
        #[allow(clippy::cast_precision_loss)]
        let values = [
            self.savings.tests_saved as f64,
            self.savings.tests_all as f64,
            self.savings.time_saved,
            self.savings.time_all,
        ];
        let deltas: Vec<(&str, f64)> = keys.iter().map(String::as_str).zip(values).collect();
        self.store.increment_attributes(&deltas, None)?;
        self.store.write_attribute(
            LAST_RUN_KEY,
            &serde_json::Value::String(Utc::now().to_rfc3339()),
            None,
        )?;

        if outcome.full_run {
            if let Some(collected) = &self.collected {
                self.store.sync_db_fs_nodes(collected)?;
            }
            self.store.remove_unused_fingerprints()?;
        }

        info!(
            written = pending.len(),
            tests_saved = self.savings.tests_saved,
            tests_all = self.savings.tests_all,
            full_run = outcome.full_run,
            "Session finished"
        );
        Ok(())
    }

    /// Files whose stored fingerprints all still hold.
    pub fn unchanged_files(&mut self) -> crate::error::Result<HashSet<String>> {
        Ok(self.determine_stable()?.stable_files.clone())
    }

    // ── Recording helpers ──────────────────────────────────────────

    fn fingerprint_record(
        &mut self,
        name: &str,
        lines: &BTreeSet<usize>,
    ) -> crate::error::Result<Option<FingerprintRecord>> {
        let Some(module) = self.tree.module(name)? else {
            debug!(file = name, "Ignoring missing file");
            return Ok(None);
        };
        let mtime = self.tree.mtime(name)?;
        let checksum = self.tree.checksum(name)?;
        Ok(Some(FingerprintRecord {
            file_name: name.to_string(),
            fingerprint: create_fingerprint(&module, lines.iter().copied()),
            mtime,
            checksum,
        }))
    }

    fn is_omitted(&self, name: &str) -> bool {
        self.omit.iter().any(|p| p.matches(name))
    }

    /// `path` relative to the root, `/`-separated; `None` outside the root.
    fn relative_name(&self, path: &str) -> Option<String> {
        relative_name(self.tree.root(), Path::new(path))
    }
}

/// Normalize `path` (absolute, or relative to `root`) to a `/`-separated
/// name relative to `root`. Paths escaping the root yield `None`.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative: PathBuf = if path.is_absolute() {
        match path.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                let canonical_root = std::fs::canonicalize(root).ok()?;
                let canonical_path = std::fs::canonicalize(path).ok()?;
                canonical_path.strip_prefix(&canonical_root).ok()?.to_path_buf()
            }
        }
    } else {
        path.to_path_buf()
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
