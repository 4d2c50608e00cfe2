pub mod block;
pub mod module;
pub mod python;
pub mod signature;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use block::{Block, Fingerprint, checksum};
pub use module::{Module, create_fingerprint};
pub use signature::Signature;

/// Error type for the block fingerprinter.
#[derive(thiserror::Error, Debug)]
pub enum BlockError {
    #[error("Fingerprint blob has {len} bytes, not a multiple of 4")]
    InvalidBlob { len: usize },

    #[error("Tree-sitter error: {0}")]
    TreeSitter(String),
}

pub type Result<T> = std::result::Result<T, BlockError>;

// ── Source kind ────────────────────────────────────────────────────

/// How a file's content is decomposed into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Python source: module block plus one block per function body.
    Python,
    /// Anything else: a single block carrying the raw text.
    Text,
}

impl SourceKind {
    /// Classify a path by extension against the configured Python extensions.
    pub fn for_path(path: &Path, python_extensions: &[String]) -> Self {
        let is_python = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| python_extensions.iter().any(|p| p == ext));
        if is_python { Self::Python } else { Self::Text }
    }
}
