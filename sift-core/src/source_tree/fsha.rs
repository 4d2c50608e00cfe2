// Content hashes of source files.
//
// A file's hash is the git blob SHA-1 of its normalized bytes: CRLF becomes
// LF, form feed becomes a space, and a trailing LF is appended to non-empty
// content that lacks one.

use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::SourceError;

/// Bytes as they are hashed.
pub fn normalize(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' if data.get(i + 1) == Some(&b'\n') => {}
            0x0c => out.push(b' '),
            byte => out.push(byte),
        }
        i += 1;
    }
    if out.last().is_some_and(|&b| b != b'\n') {
        out.push(b'\n');
    }
    out
}

/// Hex git blob SHA-1 of `data` after [`normalize`].
pub fn fsha(data: &[u8]) -> Result<String, SourceError> {
    git_blob_sha(&normalize(data))
}

/// Hex git blob SHA-1 of `data` as is.
pub fn git_blob_sha(data: &[u8]) -> Result<String, SourceError> {
    let id = gix::objs::compute_hash(gix::hash::Kind::Sha1, gix::objs::Kind::Blob, data)
        .map_err(|e| SourceError::Git(e.to_string()))?;
    Ok(id.to_string())
}

/// A source file read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    /// Content decoded as UTF-8, invalid sequences replaced.
    pub text: String,
    pub fsha: String,
}

/// Read and hash `path`. A missing file is `Ok(None)`.
pub fn read_source(path: &Path) -> Result<Option<SourceFile>, SourceError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if is_missing(&e) => return Ok(None),
        Err(source) => {
            return Err(SourceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let fsha = fsha(&bytes)?;
    Ok(Some(SourceFile {
        text: String::from_utf8_lossy(&bytes).into_owned(),
        fsha,
    }))
}

/// Modification time of `path` in seconds since the epoch. A missing file is
/// `Ok(None)`.
pub fn file_mtime(path: &Path) -> Result<Option<f64>, SourceError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if is_missing(&e) => return Ok(None),
        Err(source) => {
            return Err(SourceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    let modified = metadata.modified().map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(
        modified
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64()),
    ))
}

/// Directories and unreadable names count as missing, like absent files.
fn is_missing(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotFound | ErrorKind::NotADirectory | ErrorKind::IsADirectory
    )
}
