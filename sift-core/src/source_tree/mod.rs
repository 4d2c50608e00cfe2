// Per-run cache of file stats, content hashes and parsed modules.

pub mod fsha;
pub mod resolver;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use sift_blocks::{Module, SourceKind};

use crate::config::SiftConfig;
use crate::error::SourceError;

pub use fsha::{SourceFile, file_mtime, fsha, read_source};
pub use resolver::{ContentResolver, FsResolver, GitIndexResolver, resolver_for};

/// Lazily loads and memoizes what the classifier and recorder need to know
/// about project files, keyed by name relative to the root. Lives for one run.
#[derive(Debug)]
pub struct SourceTree {
    root: PathBuf,
    python_extensions: Vec<String>,
    resolver: Box<dyn ContentResolver>,
    mtimes: HashMap<String, Option<f64>>,
    checksums: HashMap<String, Option<String>>,
    modules: HashMap<String, Option<Arc<Module>>>,
}

impl SourceTree {
    pub fn new(
        root: impl Into<PathBuf>,
        python_extensions: Vec<String>,
        resolver: Box<dyn ContentResolver>,
    ) -> Self {
        Self {
            root: root.into(),
            python_extensions,
            resolver,
            mtimes: HashMap::new(),
            checksums: HashMap::new(),
            modules: HashMap::new(),
        }
    }

    /// Source tree for `config.root`, with the resolver `config` selects.
    pub fn from_config(config: &SiftConfig) -> Self {
        Self::new(
            config.root.clone(),
            config.source.python_extensions.clone(),
            resolver_for(&config.root, config.source.use_vcs_index),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current mtime of `file_name`, `None` when missing.
    pub fn mtime(&mut self, file_name: &str) -> Result<Option<f64>, SourceError> {
        if let Some(cached) = self.mtimes.get(file_name) {
            return Ok(*cached);
        }
        let mtime = file_mtime(&self.root.join(file_name))?;
        self.mtimes.insert(file_name.to_string(), mtime);
        Ok(mtime)
    }

    /// Current content hash of `file_name`, `None` when missing.
    pub fn checksum(&mut self, file_name: &str) -> Result<Option<String>, SourceError> {
        if let Some(cached) = self.checksums.get(file_name) {
            return Ok(cached.clone());
        }
        let checksum = self.resolver.content_hash(&self.root, file_name)?;
        self.checksums.insert(file_name.to_string(), checksum.clone());
        Ok(checksum)
    }

    /// Parsed module of `file_name`, `None` when missing.
    pub fn module(&mut self, file_name: &str) -> Result<Option<Arc<Module>>, SourceError> {
        if let Some(cached) = self.modules.get(file_name) {
            return Ok(cached.clone());
        }
        let module = match read_source(&self.root.join(file_name))? {
            Some(file) => {
                let kind = SourceKind::for_path(Path::new(file_name), &self.python_extensions);
                debug!(file = file_name, ?kind, "Loaded module");
                Some(Arc::new(Module::parse(file.text, kind)))
            }
            None => None,
        };
        self.modules.insert(file_name.to_string(), module.clone());
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_for(root: &Path) -> SourceTree {
        SourceTree::new(root, vec!["py".into()], Box::new(FsResolver))
    }

    #[test]
    fn missing_files_resolve_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = tree_for(dir.path());
        assert_eq!(tree.mtime("gone.py").unwrap(), None);
        assert_eq!(tree.checksum("gone.py").unwrap(), None);
        assert!(tree.module("gone.py").unwrap().is_none());
    }

    #[test]
    fn modules_are_memoized_for_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "def f():\n    return 1\n").unwrap();
        let mut tree = tree_for(dir.path());

        let first = tree.module("a.py").unwrap().unwrap();
        std::fs::write(&path, "def f():\n    return 2\n").unwrap();
        let cached = tree.module("a.py").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        let fresh = tree_for(dir.path()).module("a.py").unwrap().unwrap();
        assert_ne!(first.checksums(), fresh.checksums());
    }

    #[test]
    fn kind_follows_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("doc.txt"), "def f():\n    pass\n").unwrap();
        let mut tree = tree_for(dir.path());
        assert_eq!(tree.module("a.py").unwrap().unwrap().blocks().len(), 2);
        assert_eq!(tree.module("doc.txt").unwrap().unwrap().blocks().len(), 1);
    }
}
