use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use sift_blocks::Fingerprint;

use crate::config::SiftConfig;
use crate::error::StoreError;
use crate::types::{
    ChangedFileData, FileFingerprintRow, FingerprintId, FingerprintRecord, MtimeUpdate, NodeId,
    NodeRecord, StoreStats, TestResult,
};

use super::FingerprintStore;
use super::schema;

/// Largest number of ids bound into one `IN (...)` list.
const MAX_BOUND_IDS: usize = 500;

/// How a store is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub environment: String,
    pub busy_timeout: Duration,
    pub read_only: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            busy_timeout: Duration::from_secs(60),
            read_only: false,
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &SiftConfig) -> Self {
        Self {
            environment: config.session.environment.clone(),
            busy_timeout: Duration::from_millis(config.store.busy_timeout_ms),
            read_only: config.store.read_only,
        }
    }
}

/// Memo key: one exact `fetch_or_create_fingerprint` input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FingerprintKey {
    file_name: String,
    blob: Vec<u8>,
    mtime_bits: Option<u64>,
    checksum: Option<String>,
}

impl FingerprintKey {
    fn new(file_name: &str, mtime: Option<f64>, checksum: Option<&str>, blob: Vec<u8>) -> Self {
        Self {
            file_name: file_name.to_string(),
            blob,
            mtime_bits: mtime.map(f64::to_bits),
            checksum: checksum.map(str::to_string),
        }
    }
}

/// SQLite-backed implementation of `FingerprintStore`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    environment: String,
    read_only: bool,
    memo: Mutex<HashMap<FingerprintKey, FingerprintId>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path, options: &StoreOptions) -> crate::error::Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        let store = Self::with_connection(conn, Some(path.to_path_buf()), options);
        store.initialize(options.busy_timeout)?;
        debug!(
            path = %path.display(),
            environment = %store.environment,
            read_only = store.read_only,
            "Opened fingerprint store"
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(options: &StoreOptions) -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        let store = Self::with_connection(conn, None, options);
        store.initialize(options.busy_timeout)?;
        Ok(store)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>, options: &StoreOptions) -> Self {
        Self {
            conn: Mutex::new(conn),
            db_path,
            environment: options.environment.clone(),
            read_only: options.read_only,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn initialize(&self, busy_timeout: Duration) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("sift store mutex poisoned");

        conn.busy_timeout(busy_timeout).map_err(StoreError::Sqlite)?;
        conn.execute_batch(schema::PRAGMAS_SQL)
            .map_err(StoreError::Sqlite)?;

        // WAL is ignored for in-memory databases
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");

        // The version must be checked before any DDL touches an older layout.
        match Self::stored_version(&conn)? {
            Some(found) if found == schema::DATA_VERSION.to_string() => {
                conn.execute_batch(schema::SCHEMA_SQL)
                    .map_err(StoreError::Sqlite)?;
            }
            Some(found) => {
                return Err(StoreError::VersionMismatch {
                    path: self.db_path.clone().unwrap_or_else(|| PathBuf::from(":memory:")),
                    found,
                    expected: schema::DATA_VERSION.to_string(),
                }
                .into());
            }
            None => {
                let tx = conn.unchecked_transaction().map_err(StoreError::Sqlite)?;
                tx.execute_batch(schema::SCHEMA_SQL)
                    .map_err(StoreError::Sqlite)?;
                tx.execute(
                    "INSERT INTO metadata (dataid, data) VALUES (?1, ?2)",
                    params![schema::DATA_VERSION_KEY, schema::DATA_VERSION.to_string()],
                )
                .map_err(StoreError::Sqlite)?;
                tx.commit().map_err(StoreError::Sqlite)?;
                info!(version = schema::DATA_VERSION, "Created fingerprint store schema");
            }
        }

        Ok(())
    }

    /// Raw stored version text, `None` for a fresh database.
    fn stored_version(conn: &Connection) -> crate::error::Result<Option<String>> {
        let has_metadata: bool = conn
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'metadata')",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        if !has_metadata {
            return Ok(None);
        }
        let version = conn
            .query_row(
                "SELECT data FROM metadata WHERE dataid = ?1",
                params![schema::DATA_VERSION_KEY],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(StoreError::Sqlite)?
            .flatten();
        Ok(version)
    }

    fn ensure_writable(&self, operation: &str) -> crate::error::Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly(operation.to_string()).into());
        }
        Ok(())
    }

    fn dataid(&self, key: &str, environment: Option<&str>) -> String {
        format!("{}:{key}", environment.unwrap_or(&self.environment))
    }

    fn clear_memo(&self) {
        self.memo.lock().expect("sift memo mutex poisoned").clear();
    }

    fn memoized(&self, key: &FingerprintKey) -> Option<FingerprintId> {
        self.memo
            .lock()
            .expect("sift memo mutex poisoned")
            .get(key)
            .copied()
    }

    /// Insert or refresh one fingerprint row on `conn`, returning its id.
    fn intern(conn: &Connection, key: &FingerprintKey) -> rusqlite::Result<i64> {
        let mtime = key.mtime_bits.map(f64::from_bits);
        conn.prepare_cached(
            "INSERT INTO fingerprint (file_name, fingerprint, mtime, checksum)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_name, fingerprint) DO UPDATE SET
                mtime = excluded.mtime,
                checksum = excluded.checksum",
        )?
        .execute(params![key.file_name, key.blob, mtime, key.checksum])?;

        // last_insert_rowid() is stale after ON CONFLICT DO UPDATE.
        conn.prepare_cached("SELECT id FROM fingerprint WHERE file_name = ?1 AND fingerprint = ?2")?
            .query_row(params![key.file_name, key.blob], |row| row.get(0))
    }

    /// Body of `insert_node_fingerprints`; returns the memo entries to publish
    /// once the transaction has committed.
    fn replace_node(
        &self,
        conn: &Connection,
        node_name: &str,
        records: &[FingerprintRecord],
        result: &TestResult,
    ) -> rusqlite::Result<Vec<(FingerprintKey, FingerprintId)>> {
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM node WHERE environment = ?1 AND name = ?2",
            params![self.environment, node_name],
        )?;
        tx.execute(
            "INSERT INTO node (environment, name, setup_duration, call_duration, teardown_duration, failed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.environment,
                node_name,
                result.setup_duration(),
                result.call_duration(),
                result.teardown_duration(),
                result.failed_any(),
            ],
        )?;
        let node_id = tx.last_insert_rowid();

        let mut fresh = Vec::new();
        let mut linked = HashSet::new();
        for record in records {
            let key = FingerprintKey::new(
                &record.file_name,
                record.mtime,
                record.checksum.as_deref(),
                record.fingerprint.to_blob(),
            );
            let id = match self.memoized(&key) {
                Some(id) => id,
                None => {
                    let id = FingerprintId(Self::intern(&tx, &key)?);
                    fresh.push((key, id));
                    id
                }
            };
            if linked.insert(id) {
                tx.prepare_cached(
                    "INSERT INTO node_fingerprint (node_id, fingerprint_id) VALUES (?1, ?2)",
                )?
                .execute(params![node_id, id.0])?;
            }
        }

        tx.commit()?;
        Ok(fresh)
    }

    fn decode(id: i64, blob: &[u8]) -> crate::error::Result<Fingerprint> {
        Fingerprint::from_blob(blob)
            .map_err(|source| StoreError::CorruptFingerprint { id, source }.into())
    }

    fn count(conn: &Connection, sql: &str, environment: Option<&str>) -> crate::error::Result<u64> {
        let count: i64 = match environment {
            Some(env) => conn.query_row(sql, params![env], |row| row.get(0)),
            None => conn.query_row(sql, [], |row| row.get(0)),
        }
        .map_err(StoreError::Sqlite)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl FingerprintStore for SqliteStore {
    // ── Fingerprints ───────────────────────────────────────────────

    fn fetch_or_create_fingerprint(
        &self,
        file_name: &str,
        mtime: Option<f64>,
        checksum: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> crate::error::Result<FingerprintId> {
        self.ensure_writable("fetch_or_create_fingerprint")?;
        let key = FingerprintKey::new(file_name, mtime, checksum, fingerprint.to_blob());
        if let Some(id) = self.memoized(&key) {
            return Ok(id);
        }

        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let id = FingerprintId(Self::intern(&conn, &key).map_err(StoreError::Sqlite)?);
        drop(conn);

        self.memo
            .lock()
            .expect("sift memo mutex poisoned")
            .insert(key, id);
        Ok(id)
    }

    fn filenames_fingerprints(&self) -> crate::error::Result<Vec<FileFingerprintRow>> {
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT f.id, f.file_name, f.fingerprint, f.mtime, f.checksum, SUM(n.failed)
                 FROM fingerprint f
                 JOIN node_fingerprint nf ON nf.fingerprint_id = f.id
                 JOIN node n ON n.id = nf.node_id
                 WHERE n.environment = ?1
                 GROUP BY f.id
                 ORDER BY f.file_name, f.id",
            )
            .map_err(StoreError::Sqlite)?;
        let raw = stmt
            .query_map(params![self.environment], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)?;

        raw.into_iter()
            .map(|(id, file_name, blob, mtime, checksum, failed_count)| {
                Ok(FileFingerprintRow {
                    id: FingerprintId(id),
                    file_name,
                    fingerprint: Self::decode(id, &blob)?,
                    mtime,
                    checksum,
                    failed_count,
                })
            })
            .collect()
    }

    fn get_changed_file_data(
        &self,
        ids: &[FingerprintId],
    ) -> crate::error::Result<Vec<ChangedFileData>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let mut changed = Vec::new();

        for chunk in ids.chunks(MAX_BOUND_IDS) {
            let placeholders: Vec<String> =
                (0..chunk.len()).map(|i| format!("?{}", i + 2)).collect();
            let sql = format!(
                "SELECT f.file_name, n.name, f.fingerprint, f.id, n.failed
                 FROM fingerprint f
                 JOIN node_fingerprint nf ON nf.fingerprint_id = f.id
                 JOIN node n ON n.id = nf.node_id
                 WHERE n.environment = ?1 AND f.id IN ({})",
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql).map_err(StoreError::Sqlite)?;
            let mut params_vec: Vec<&dyn rusqlite::types::ToSql> = vec![&self.environment];
            for id in chunk {
                params_vec.push(&id.0);
            }
            let raw = stmt
                .query_map(params_vec.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                })
                .map_err(StoreError::Sqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::Sqlite)?;

            for (file_name, node_name, blob, id, failed) in raw {
                changed.push(ChangedFileData {
                    file_name,
                    node_name,
                    fingerprint: Self::decode(id, &blob)?,
                    id: FingerprintId(id),
                    failed,
                });
            }
        }

        Ok(changed)
    }

    fn update_mtimes(&self, updates: &[MtimeUpdate]) -> crate::error::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        if self.read_only {
            debug!(count = updates.len(), "Read-only store, skipping mtime refresh");
            return Ok(());
        }
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(StoreError::Sqlite)?;
        {
            let mut stmt = tx
                .prepare_cached("UPDATE fingerprint SET mtime = ?1, checksum = ?2 WHERE id = ?3")
                .map_err(StoreError::Sqlite)?;
            for update in updates {
                stmt.execute(params![update.mtime, update.checksum, update.id.0])
                    .map_err(StoreError::Sqlite)?;
            }
        }
        tx.commit().map_err(StoreError::Sqlite)?;
        debug!(count = updates.len(), "Refreshed fingerprint mtimes");
        Ok(())
    }

    fn remove_unused_fingerprints(&self) -> crate::error::Result<u64> {
        self.ensure_writable("remove_unused_fingerprints")?;
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let removed = conn
            .execute(
                "DELETE FROM fingerprint
                 WHERE id NOT IN (SELECT fingerprint_id FROM node_fingerprint)",
                [],
            )
            .map_err(StoreError::Sqlite)?;
        drop(conn);
        self.clear_memo();
        info!(removed, "Removed unused fingerprints");
        Ok(removed as u64)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    fn insert_node_fingerprints(
        &self,
        node_name: &str,
        records: &[FingerprintRecord],
        result: &TestResult,
    ) -> crate::error::Result<()> {
        self.ensure_writable("insert_node_fingerprints")?;
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        match self.replace_node(&conn, node_name, records, result) {
            Ok(fresh) => {
                drop(conn);
                self.memo
                    .lock()
                    .expect("sift memo mutex poisoned")
                    .extend(fresh);
                debug!(node = node_name, files = records.len(), "Recorded node");
                Ok(())
            }
            Err(e) => {
                drop(conn);
                self.clear_memo();
                Err(StoreError::Sqlite(e).into())
            }
        }
    }

    fn all_nodes(&self) -> crate::error::Result<Vec<NodeRecord>> {
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, name, setup_duration, call_duration, teardown_duration, failed
                 FROM node WHERE environment = ?1 ORDER BY name",
            )
            .map_err(StoreError::Sqlite)?;
        let nodes = stmt
            .query_map(params![self.environment], |row| {
                Ok(NodeRecord {
                    id: NodeId(row.get(0)?),
                    name: row.get(1)?,
                    setup_duration: row.get(2)?,
                    call_duration: row.get(3)?,
                    teardown_duration: row.get(4)?,
                    failed: row.get(5)?,
                })
            })
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)?;
        Ok(nodes)
    }

    fn sync_db_fs_nodes(&self, retain: &[String]) -> crate::error::Result<u64> {
        self.ensure_writable("sync_db_fs_nodes")?;
        let retain: HashSet<&str> = retain.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .all_nodes()?
            .into_iter()
            .map(|n| n.name)
            .filter(|name| !retain.contains(name.as_str()))
            .collect();
        let removed = self.delete_nodes(&stale)?;
        if removed > 0 {
            info!(removed, "Removed nodes no longer collected");
        }
        Ok(removed)
    }

    fn delete_nodes(&self, names: &[String]) -> crate::error::Result<u64> {
        self.ensure_writable("delete_nodes")?;
        if names.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(StoreError::Sqlite)?;
        let mut removed = 0u64;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM node WHERE environment = ?1 AND name = ?2")
                .map_err(StoreError::Sqlite)?;
            for name in names {
                removed += stmt
                    .execute(params![self.environment, name])
                    .map_err(StoreError::Sqlite)? as u64;
            }
        }
        tx.commit().map_err(StoreError::Sqlite)?;
        Ok(removed)
    }

    // ── Metadata ───────────────────────────────────────────────────

    fn write_attribute(
        &self,
        key: &str,
        value: &serde_json::Value,
        environment: Option<&str>,
    ) -> crate::error::Result<()> {
        self.ensure_writable("write_attribute")?;
        let data = serde_json::to_string(value).map_err(StoreError::Serialization)?;
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO metadata (dataid, data) VALUES (?1, ?2)",
            params![self.dataid(key, environment), data],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    fn fetch_attribute(
        &self,
        key: &str,
        environment: Option<&str>,
    ) -> crate::error::Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let data: Option<Option<String>> = conn
            .query_row(
                "SELECT data FROM metadata WHERE dataid = ?1",
                params![self.dataid(key, environment)],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Sqlite)?;
        match data.flatten() {
            Some(text) => Ok(Some(
                serde_json::from_str(&text).map_err(StoreError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    fn increment_attributes(
        &self,
        deltas: &[(&str, f64)],
        environment: Option<&str>,
    ) -> crate::error::Result<()> {
        self.ensure_writable("increment_attributes")?;
        let conn = self.conn.lock().expect("sift store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(StoreError::Sqlite)?;
        for (key, delta) in deltas {
            let dataid = self.dataid(key, environment);
            let current: Option<Option<String>> = tx
                .query_row(
                    "SELECT data FROM metadata WHERE dataid = ?1",
                    params![dataid],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::Sqlite)?;
            let current = match current.flatten() {
                Some(text) => serde_json::from_str::<serde_json::Value>(&text)
                    .map_err(StoreError::Serialization)?
                    .as_f64()
                    .unwrap_or(0.0),
                None => 0.0,
            };
            let data = serde_json::to_string(&json_number(current + delta))
                .map_err(StoreError::Serialization)?;
            tx.execute(
                "INSERT OR REPLACE INTO metadata (dataid, data) VALUES (?1, ?2)",
                params![dataid, data],
            )
            .map_err(StoreError::Sqlite)?;
        }
        tx.commit().map_err(StoreError::Sqlite)?;
        Ok(())
    }

    // ── Metrics ────────────────────────────────────────────────────

    fn stats(&self) -> crate::error::Result<StoreStats> {
        let conn = self.conn.lock().expect("sift store mutex poisoned");

        let nodes = Self::count(
            &conn,
            "SELECT COUNT(*) FROM node WHERE environment = ?1",
            Some(&self.environment),
        )?;
        let fingerprints = Self::count(&conn, "SELECT COUNT(*) FROM fingerprint", None)?;
        let edges = Self::count(&conn, "SELECT COUNT(*) FROM node_fingerprint", None)?;
        let files = Self::count(
            &conn,
            "SELECT COUNT(DISTINCT file_name) FROM fingerprint",
            None,
        )?;

        let db_size_bytes = self
            .db_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len());

        Ok(StoreStats {
            nodes,
            fingerprints,
            edges,
            files,
            db_size_bytes,
        })
    }
}

/// Integral values stay JSON integers so counters read back as counts.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn json_number(value: f64) -> serde_json::Value {
    let truncated = value as i64;
    if truncated as f64 == value {
        serde_json::Value::from(truncated)
    } else {
        serde_json::Value::from(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::in_memory(&StoreOptions::default()).unwrap()
    }

    fn record(file: &str, checksums: &[i32]) -> FingerprintRecord {
        FingerprintRecord {
            file_name: file.to_string(),
            fingerprint: Fingerprint::new(checksums.to_vec()),
            mtime: Some(1_700_000_000.5),
            checksum: Some(format!("sha-of-{file}")),
        }
    }

    fn fingerprint_count(store: &SqliteStore) -> u64 {
        store.stats().unwrap().fingerprints
    }

    #[test]
    fn fresh_store_records_version() {
        let store = store();
        let version = store
            .fetch_attribute("__data_version", Some("default"))
            .unwrap();
        assert_eq!(version, Some(serde_json::json!(schema::DATA_VERSION)));
    }

    #[test]
    fn interning_is_idempotent() {
        let store = store();
        let fp = Fingerprint::new(vec![1, 2, 3]);
        let a = store
            .fetch_or_create_fingerprint("a.py", Some(1.0), Some("x"), &fp)
            .unwrap();
        let b = store
            .fetch_or_create_fingerprint("a.py", Some(2.0), Some("y"), &fp)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(fingerprint_count(&store), 1);

        let other = store
            .fetch_or_create_fingerprint("b.py", Some(1.0), Some("x"), &fp)
            .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn reinsertion_refreshes_cached_fields() {
        let store = store();
        let fp = Fingerprint::new(vec![7]);
        store
            .insert_node_fingerprints("t1", &[record("a.py", &[7])], &TestResult::passed(0.1))
            .unwrap();
        store
            .fetch_or_create_fingerprint("a.py", Some(99.0), Some("new"), &fp)
            .unwrap();
        let rows = store.filenames_fingerprints().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].mtime, Some(99.0));
        assert_eq!(rows[0].checksum.as_deref(), Some("new"));
    }

    #[test]
    fn identical_fingerprints_share_one_row() {
        let store = store();
        let records = [record("a.py", &[1, 2])];
        store
            .insert_node_fingerprints("t1", &records, &TestResult::passed(0.1))
            .unwrap();
        store
            .insert_node_fingerprints("t2", &records, &TestResult::passed(0.1))
            .unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.fingerprints, 1);
        assert_eq!(stats.edges, 2);
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.files, 1);
    }

    #[test]
    fn node_replace_cascades_edges() {
        let store = store();
        store
            .insert_node_fingerprints(
                "t1",
                &[record("a.py", &[1]), record("b.py", &[2])],
                &TestResult::passed(0.1),
            )
            .unwrap();
        store
            .insert_node_fingerprints("t1", &[record("a.py", &[3])], &TestResult::failed(0.2))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.edges, 1);
        assert_eq!(stats.fingerprints, 3, "orphans stay until swept");

        let nodes = store.all_nodes().unwrap();
        assert!(nodes[0].failed);
        assert!((nodes[0].call_duration - 0.2).abs() < 1e-9);
    }

    #[test]
    fn gc_removes_exactly_orphans() {
        let store = store();
        store
            .insert_node_fingerprints("t1", &[record("a.py", &[1])], &TestResult::passed(0.1))
            .unwrap();
        store
            .insert_node_fingerprints("t2", &[record("a.py", &[2])], &TestResult::passed(0.1))
            .unwrap();
        store.delete_nodes(&["t1".to_string()]).unwrap();

        assert_eq!(store.remove_unused_fingerprints().unwrap(), 1);
        let rows = store.filenames_fingerprints().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fingerprint.checksums(), &[2]);
        assert_eq!(store.remove_unused_fingerprints().unwrap(), 0);
    }

    #[test]
    fn memo_does_not_outlive_gc() {
        let store = store();
        let x = [record("a.py", &[1])];
        store
            .insert_node_fingerprints("t1", &x, &TestResult::passed(0.1))
            .unwrap();
        store
            .insert_node_fingerprints("t1", &[record("a.py", &[2])], &TestResult::passed(0.1))
            .unwrap();
        assert_eq!(store.remove_unused_fingerprints().unwrap(), 1);

        // Re-linking the swept fingerprint must create a fresh row.
        store
            .insert_node_fingerprints("t1", &x, &TestResult::passed(0.1))
            .unwrap();
        assert_eq!(store.stats().unwrap().edges, 1);
    }

    #[test]
    fn failed_counts_aggregate_per_fingerprint() {
        let store = store();
        let records = [record("a.py", &[1])];
        store
            .insert_node_fingerprints("t1", &records, &TestResult::failed(0.1))
            .unwrap();
        store
            .insert_node_fingerprints("t2", &records, &TestResult::failed(0.1))
            .unwrap();
        store
            .insert_node_fingerprints("t3", &records, &TestResult::passed(0.1))
            .unwrap();
        let rows = store.filenames_fingerprints().unwrap();
        assert_eq!(rows[0].failed_count, 2);
    }

    #[test]
    fn changed_file_data_lists_dependent_nodes() {
        let store = store();
        store
            .insert_node_fingerprints("t1", &[record("a.py", &[1])], &TestResult::passed(0.1))
            .unwrap();
        store
            .insert_node_fingerprints(
                "t2",
                &[record("a.py", &[1]), record("b.py", &[5])],
                &TestResult::failed(0.1),
            )
            .unwrap();
        let a_id = store
            .filenames_fingerprints()
            .unwrap()
            .into_iter()
            .find(|r| r.file_name == "a.py")
            .unwrap()
            .id;

        let mut changed = store.get_changed_file_data(&[a_id]).unwrap();
        changed.sort_by(|x, y| x.node_name.cmp(&y.node_name));
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].node_name, "t1");
        assert!(!changed[0].failed);
        assert_eq!(changed[1].node_name, "t2");
        assert!(changed[1].failed);
        assert_eq!(changed[1].fingerprint.checksums(), &[1]);
        assert!(store.get_changed_file_data(&[]).unwrap().is_empty());
    }

    #[test]
    fn environments_are_isolated() {
        let conn_store = store();
        conn_store
            .insert_node_fingerprints("t1", &[record("a.py", &[1])], &TestResult::passed(0.1))
            .unwrap();
        let other = SqliteStore {
            environment: "py39".to_string(),
            ..conn_store
        };
        assert!(other.all_nodes().unwrap().is_empty());
        assert!(other.filenames_fingerprints().unwrap().is_empty());
    }

    #[test]
    fn sync_keeps_only_retained_nodes() {
        let store = store();
        for name in ["t1", "t2", "t3"] {
            store
                .insert_node_fingerprints(name, &[record("a.py", &[1])], &TestResult::passed(0.1))
                .unwrap();
        }
        let removed = store
            .sync_db_fs_nodes(&["t1".to_string(), "t3".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        let names: Vec<String> = store.all_nodes().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["t1", "t3"]);
    }

    #[test]
    fn update_mtimes_refreshes_rows() {
        let store = store();
        store
            .insert_node_fingerprints("t1", &[record("a.py", &[1])], &TestResult::passed(0.1))
            .unwrap();
        let id = store.filenames_fingerprints().unwrap()[0].id;
        store
            .update_mtimes(&[MtimeUpdate {
                id,
                mtime: 42.0,
                checksum: "abc".into(),
            }])
            .unwrap();
        let row = &store.filenames_fingerprints().unwrap()[0];
        assert_eq!(row.mtime, Some(42.0));
        assert_eq!(row.checksum.as_deref(), Some("abc"));
    }

    #[test]
    fn attributes_are_namespaced_and_incremented() {
        let store = store();
        store
            .write_attribute("tests_saved", &serde_json::Value::Null, None)
            .unwrap();
        store
            .increment_attributes(&[("tests_saved", 3.0), ("time_saved", 1.5)], None)
            .unwrap();
        store
            .increment_attributes(&[("tests_saved", 2.0)], None)
            .unwrap();
        assert_eq!(
            store.fetch_attribute("tests_saved", None).unwrap(),
            Some(serde_json::json!(5))
        );
        assert_eq!(
            store.fetch_attribute("time_saved", None).unwrap(),
            Some(serde_json::json!(1.5))
        );
        assert_eq!(store.fetch_attribute("tests_saved", Some("ci")).unwrap(), None);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".siftdata");
        drop(SqliteStore::open(&path, &StoreOptions::default()).unwrap());

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE metadata SET data = '0' WHERE dataid = ?1",
            params![schema::DATA_VERSION_KEY],
        )
        .unwrap();
        drop(conn);

        let err = SqliteStore::open(&path, &StoreOptions::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(".siftdata"), "{message}");
        assert!(message.contains("Delete the file"), "{message}");
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".siftdata");
        {
            let store = SqliteStore::open(&path, &StoreOptions::default()).unwrap();
            store
                .insert_node_fingerprints("t1", &[record("a.py", &[1])], &TestResult::passed(0.1))
                .unwrap();
        }
        let store = SqliteStore::open(&path, &StoreOptions::default()).unwrap();
        assert_eq!(store.all_nodes().unwrap().len(), 1);
        assert!(store.stats().unwrap().db_size_bytes > 0);
    }

    #[test]
    fn read_only_rejects_node_writes_and_skips_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".siftdata");
        {
            let store = SqliteStore::open(&path, &StoreOptions::default()).unwrap();
            store
                .insert_node_fingerprints("t1", &[record("a.py", &[1])], &TestResult::passed(0.1))
                .unwrap();
        }
        let options = StoreOptions {
            read_only: true,
            ..StoreOptions::default()
        };
        let store = SqliteStore::open(&path, &options).unwrap();
        let err = store
            .insert_node_fingerprints("t2", &[], &TestResult::passed(0.1))
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));

        let id = store.filenames_fingerprints().unwrap()[0].id;
        store
            .update_mtimes(&[MtimeUpdate {
                id,
                mtime: 1.0,
                checksum: "changed".into(),
            }])
            .unwrap();
        assert_eq!(
            store.filenames_fingerprints().unwrap()[0].checksum.as_deref(),
            Some("sha-of-a.py")
        );
    }

    #[test]
    fn duplicate_records_link_once() {
        let store = store();
        let r = record("a.py", &[1]);
        store
            .insert_node_fingerprints("t1", &[r.clone(), r], &TestResult::passed(0.1))
            .unwrap();
        assert_eq!(store.stats().unwrap().edges, 1);
    }

    const FILES: [&str; 3] = ["a.py", "b.py", "pkg/c.py"];

    /// One node's coverage: (index into `FILES`, block checksums) pairs.
    fn node_entries() -> impl Strategy<Value = Vec<(usize, Vec<i32>)>> {
        prop::collection::vec(
            (0..FILES.len(), prop::collection::vec(-3i32..3, 0..3)),
            0..4,
        )
    }

    fn insert(store: &SqliteStore, name: &str, entries: &[(usize, Vec<i32>)]) {
        let records: Vec<FingerprintRecord> =
            entries.iter().map(|(f, c)| record(FILES[*f], c)).collect();
        store
            .insert_node_fingerprints(name, &records, &TestResult::passed(0.1))
            .unwrap();
    }

    fn distinct(entries: &[&Vec<(usize, Vec<i32>)>]) -> BTreeSet<(usize, Vec<i32>)> {
        entries.iter().flat_map(|e| e.iter().cloned()).collect()
    }

    proptest! {
        #[test]
        fn reinserting_nodes_interns_fingerprints(nodes in prop::collection::vec(node_entries(), 1..5)) {
            let store = store();
            for _ in 0..2 {
                for (i, entries) in nodes.iter().enumerate() {
                    insert(&store, &format!("t{i}"), entries);
                }
            }
            let all: Vec<_> = nodes.iter().collect();
            prop_assert_eq!(fingerprint_count(&store), distinct(&all).len() as u64);
            let edges: usize = nodes
                .iter()
                .map(|e| e.iter().collect::<BTreeSet<_>>().len())
                .sum();
            prop_assert_eq!(store.stats().unwrap().edges, edges as u64);
        }

        #[test]
        fn gc_keeps_exactly_the_referenced_fingerprints(
            nodes in prop::collection::vec(node_entries(), 1..6),
            deleted in prop::collection::vec(any::<bool>(), 6),
        ) {
            let store = store();
            for (i, entries) in nodes.iter().enumerate() {
                insert(&store, &format!("t{i}"), entries);
            }
            let doomed: Vec<String> = (0..nodes.len())
                .filter(|i| deleted[*i])
                .map(|i| format!("t{i}"))
                .collect();
            store.delete_nodes(&doomed).unwrap();
            store.remove_unused_fingerprints().unwrap();

            let kept: Vec<_> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !deleted[*i])
                .map(|(_, e)| e)
                .collect();
            let expected = distinct(&kept);
            prop_assert_eq!(fingerprint_count(&store), expected.len() as u64);

            let rows: BTreeSet<(String, Vec<i32>)> = store
                .filenames_fingerprints()
                .unwrap()
                .into_iter()
                .map(|r| (r.file_name, r.fingerprint.checksums().to_vec()))
                .collect();
            let expected: BTreeSet<(String, Vec<i32>)> = expected
                .into_iter()
                .map(|(f, c)| (FILES[f].to_string(), c))
                .collect();
            prop_assert_eq!(rows, expected);

            // Swept fingerprints are created again, not looked up.
            let revived: Vec<(usize, Vec<i32>)> = nodes.iter().flatten().cloned().collect();
            insert(&store, "revived", &revived);
            let all: Vec<_> = nodes.iter().collect();
            prop_assert_eq!(fingerprint_count(&store), distinct(&all).len() as u64);
            prop_assert_eq!(store.filenames_fingerprints().unwrap().len(), distinct(&all).len());
        }
    }
}
