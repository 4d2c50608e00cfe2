use std::path::PathBuf;

/// Top-level sift error type.
///
/// All fallible operations in `sift-core` return [`Result<T, SiftError>`](Result).
/// Each variant wraps a layer-specific error enum, allowing callers to
/// match on the error source without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum SiftError {
    /// Error from the fingerprint store (`SQLite` operations, schema checks).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Error reading or hashing project sources.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Error from the block fingerprinter (blob decoding, parser setup).
    #[error("Block error: {0}")]
    Blocks(#[from] sift_blocks::BlockError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the SQLite-backed fingerprint store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed (including lock timeouts).
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The data file was written by an incompatible version.
    #[error(
        "The stored schema version ({found}) of {} does not match the current \
         version ({expected}). Delete the file and run the full test suite again.",
        path.display()
    )]
    VersionMismatch {
        /// Path of the data file.
        path: PathBuf,
        /// Version found in the file.
        found: String,
        /// Version this build expects.
        expected: String,
    },

    /// A write was attempted on a store opened read-only.
    #[error("Store is read-only: {0}")]
    ReadOnly(String),

    /// A stored fingerprint blob could not be decoded.
    #[error("Corrupt fingerprint row {id}: {source}")]
    CorruptFingerprint {
        /// Fingerprint row id.
        id: i64,
        /// Decoding failure.
        source: sift_blocks::BlockError,
    },

    /// JSON serialization/deserialization of metadata failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors while locating, reading or hashing source files.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// Filesystem I/O error other than a missing file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// Version-control index could not be opened or read.
    #[error("Git error: {0}")]
    Git(String),
}

/// Errors in sift configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Convenience alias for `Result<T, SiftError>`.
pub type Result<T> = std::result::Result<T, SiftError>;
