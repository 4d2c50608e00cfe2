use sift_blocks::Fingerprint;

use crate::types::{
    ChangedFileData, FileFingerprintRow, FingerprintId, FingerprintRecord, MtimeUpdate,
    NodeRecord, StoreStats, TestResult,
};

/// The fingerprint store abstraction. The session and classifier read and
/// write through this trait.
///
/// Node-scoped operations act on the environment the store was opened for.
pub trait FingerprintStore: std::fmt::Debug + Send + Sync {
    // ── Fingerprints ───────────────────────────────────────────────

    /// Intern `(file_name, fingerprint)` and return its id. An existing row
    /// only has its cached `mtime`/`checksum` refreshed.
    fn fetch_or_create_fingerprint(
        &self,
        file_name: &str,
        mtime: Option<f64>,
        checksum: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> crate::error::Result<FingerprintId>;

    /// Every fingerprint row with the summed `failed` flag of its nodes.
    fn filenames_fingerprints(&self) -> crate::error::Result<Vec<FileFingerprintRow>>;

    /// Nodes depending on the given fingerprints.
    fn get_changed_file_data(
        &self,
        ids: &[FingerprintId],
    ) -> crate::error::Result<Vec<ChangedFileData>>;

    /// Refresh cached `mtime`/`checksum` of existing rows.
    fn update_mtimes(&self, updates: &[MtimeUpdate]) -> crate::error::Result<()>;

    /// Delete fingerprint rows no node refers to. Returns count deleted.
    fn remove_unused_fingerprints(&self) -> crate::error::Result<u64>;

    // ── Nodes ──────────────────────────────────────────────────────

    /// Replace the node `node_name` and all of its edges in one transaction.
    fn insert_node_fingerprints(
        &self,
        node_name: &str,
        records: &[FingerprintRecord],
        result: &TestResult,
    ) -> crate::error::Result<()>;

    /// Every node of the environment.
    fn all_nodes(&self) -> crate::error::Result<Vec<NodeRecord>>;

    /// Delete nodes of the environment not named in `retain`. Returns count
    /// deleted.
    fn sync_db_fs_nodes(&self, retain: &[String]) -> crate::error::Result<u64>;

    /// Delete the named nodes. Returns count deleted.
    fn delete_nodes(&self, names: &[String]) -> crate::error::Result<u64>;

    // ── Metadata ───────────────────────────────────────────────────

    /// Write a JSON attribute, namespaced by the environment unless
    /// `environment` overrides it.
    fn write_attribute(
        &self,
        key: &str,
        value: &serde_json::Value,
        environment: Option<&str>,
    ) -> crate::error::Result<()>;

    /// Read a JSON attribute written by [`FingerprintStore::write_attribute`].
    fn fetch_attribute(
        &self,
        key: &str,
        environment: Option<&str>,
    ) -> crate::error::Result<Option<serde_json::Value>>;

    /// Add numeric deltas to attributes in one transaction. Absent or `null`
    /// attributes count as zero.
    fn increment_attributes(
        &self,
        deltas: &[(&str, f64)],
        environment: Option<&str>,
    ) -> crate::error::Result<()>;

    // ── Metrics ────────────────────────────────────────────────────

    fn stats(&self) -> crate::error::Result<StoreStats>;
}
