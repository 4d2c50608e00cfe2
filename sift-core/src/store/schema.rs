/// Current data version. Files written with another version are rejected.
pub const DATA_VERSION: i64 = 1;

/// Metadata key holding [`DATA_VERSION`], in the `default` namespace.
pub const DATA_VERSION_KEY: &str = "default:__data_version";

/// Full SQL schema of the fingerprint store.
pub const SCHEMA_SQL: &str = r"
-- Namespaced key/value attributes (JSON values)
CREATE TABLE IF NOT EXISTS metadata (
    dataid TEXT PRIMARY KEY,
    data TEXT
);

-- One row per executed test per environment
CREATE TABLE IF NOT EXISTS node (
    id INTEGER PRIMARY KEY ASC,
    environment TEXT NOT NULL,
    name TEXT NOT NULL,
    setup_duration REAL NOT NULL DEFAULT 0,
    call_duration REAL NOT NULL DEFAULT 0,
    teardown_duration REAL NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    UNIQUE (environment, name)
);

-- Interned (file, block checksum list) pairs
CREATE TABLE IF NOT EXISTS fingerprint (
    id INTEGER PRIMARY KEY,
    file_name TEXT NOT NULL,
    fingerprint BLOB NOT NULL,
    mtime REAL,
    checksum TEXT,
    UNIQUE (file_name, fingerprint)
);

-- Which fingerprints each node depends on
CREATE TABLE IF NOT EXISTS node_fingerprint (
    node_id INTEGER NOT NULL REFERENCES node(id) ON DELETE CASCADE,
    fingerprint_id INTEGER NOT NULL REFERENCES fingerprint(id)
);
CREATE INDEX IF NOT EXISTS idx_nf_node ON node_fingerprint(node_id);
CREATE INDEX IF NOT EXISTS idx_nf_fingerprint ON node_fingerprint(fingerprint_id);
CREATE INDEX IF NOT EXISTS idx_fingerprint_file ON fingerprint(file_name);
";

/// Per-connection `SQLite` PRAGMAs. `journal_mode` is set separately since
/// in-memory databases ignore it.
pub const PRAGMAS_SQL: &str = r"
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA recursive_triggers = ON;
";
