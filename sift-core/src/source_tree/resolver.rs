// Content-hash resolution: direct read + hash, or the git index fast path.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::error::SourceError;

use super::fsha::read_source;

/// Resolves the content hash of a file given its name relative to the
/// project root. A missing file resolves to `None`.
pub trait ContentResolver: fmt::Debug + Send + Sync {
    fn content_hash(&self, root: &Path, file_name: &str) -> Result<Option<String>, SourceError>;
}

/// Reads and hashes every file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsResolver;

impl ContentResolver for FsResolver {
    fn content_hash(&self, root: &Path, file_name: &str) -> Result<Option<String>, SourceError> {
        Ok(read_source(&root.join(file_name))?.map(|f| f.fsha))
    }
}

/// Stat data and blob id of one tracked file, as recorded in the git index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexedFile {
    id: String,
    mtime_secs: u64,
    mtime_nsecs: u32,
    size: u64,
}

/// Trusts the git index hash of tracked files whose on-disk stat matches the
/// index entry; reads and hashes everything else.
pub struct GitIndexResolver {
    /// Keyed by path relative to the project root.
    entries: HashMap<String, IndexedFile>,
    /// Entries stamped at or after this time are racily clean.
    index_mtime: Option<(u64, u32)>,
    fallback: FsResolver,
}

impl fmt::Debug for GitIndexResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitIndexResolver")
            .field("entries", &self.entries.len())
            .field("index_mtime", &self.index_mtime)
            .finish_non_exhaustive()
    }
}

impl GitIndexResolver {
    /// Snapshot the index of the repository containing `root`.
    pub fn open(root: &Path) -> Result<Self, SourceError> {
        let repo = gix::discover(root).map_err(|e| SourceError::Git(e.to_string()))?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| SourceError::Git("repository has no work tree".into()))?;
        let prefix = relative_prefix(workdir, root)?;

        let index = repo
            .open_index()
            .map_err(|e| SourceError::Git(e.to_string()))?;
        let index_mtime = std::fs::metadata(index.path())
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| (d.as_secs(), d.subsec_nanos()));

        let mut entries = HashMap::new();
        for entry in index.entries() {
            let Ok(path) = std::str::from_utf8(entry.path(&index)) else {
                continue;
            };
            let Some(relative) = strip_dir_prefix(path, &prefix) else {
                continue;
            };
            entries.insert(
                relative.to_string(),
                IndexedFile {
                    id: entry.id.to_string(),
                    mtime_secs: u64::from(entry.stat.mtime.secs),
                    mtime_nsecs: entry.stat.mtime.nsecs,
                    size: u64::from(entry.stat.size),
                },
            );
        }
        debug!(entries = entries.len(), prefix = %prefix, "Loaded git index");

        Ok(Self {
            entries,
            index_mtime,
            fallback: FsResolver,
        })
    }

    /// The index hash of `file_name` when its stat data can be trusted.
    fn trusted_hash(&self, root: &Path, file_name: &str) -> Option<&str> {
        let indexed = self.entries.get(file_name)?;
        let metadata = std::fs::metadata(root.join(file_name)).ok()?;
        let modified = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        let stat = (modified.as_secs(), modified.subsec_nanos());

        if stat != (indexed.mtime_secs, indexed.mtime_nsecs) {
            return None;
        }
        // git records sizes modulo 2^32.
        if metadata.len() & 0xffff_ffff != indexed.size {
            return None;
        }
        if self.index_mtime.is_some_and(|index| stat >= index) {
            return None;
        }
        Some(&indexed.id)
    }
}

impl ContentResolver for GitIndexResolver {
    fn content_hash(&self, root: &Path, file_name: &str) -> Result<Option<String>, SourceError> {
        if let Some(id) = self.trusted_hash(root, file_name) {
            return Ok(Some(id.to_string()));
        }
        self.fallback.content_hash(root, file_name)
    }
}

/// The git-index resolver when `use_vcs_index` is set and `root` is inside a
/// work tree, the filesystem resolver otherwise.
pub fn resolver_for(root: &Path, use_vcs_index: bool) -> Box<dyn ContentResolver> {
    if use_vcs_index {
        match GitIndexResolver::open(root) {
            Ok(resolver) => return Box::new(resolver),
            Err(e) => debug!(error = %e, "Git index unavailable, hashing files directly"),
        }
    }
    Box::new(FsResolver)
}

/// Path of `root` inside `workdir`, `/`-separated, empty when they coincide.
fn relative_prefix(workdir: &Path, root: &Path) -> Result<String, SourceError> {
    let canonical = |p: &Path| -> Result<PathBuf, SourceError> {
        std::fs::canonicalize(p).map_err(|source| SourceError::Io {
            path: p.to_path_buf(),
            source,
        })
    };
    let workdir = canonical(workdir)?;
    let root = canonical(root)?;
    let relative = root.strip_prefix(&workdir).map_err(|_| {
        SourceError::Git(format!(
            "{} is outside the work tree {}",
            root.display(),
            workdir.display()
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn strip_dir_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_resolver_hashes_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let resolver = FsResolver;
        assert_eq!(
            resolver.content_hash(dir.path(), "a.py").unwrap(),
            Some(super::super::fsha::fsha(b"x = 1\n").unwrap())
        );
        assert_eq!(resolver.content_hash(dir.path(), "b.py").unwrap(), None);
    }

    #[test]
    fn prefix_stripping() {
        assert_eq!(strip_dir_prefix("pkg/a.py", ""), Some("pkg/a.py"));
        assert_eq!(strip_dir_prefix("sub/pkg/a.py", "sub"), Some("pkg/a.py"));
        assert_eq!(strip_dir_prefix("subway/a.py", "sub"), None);
        assert_eq!(strip_dir_prefix("other/a.py", "sub"), None);
    }
}
