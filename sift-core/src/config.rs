use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Directory under the project root that holds sift's own files.
pub const CONFIG_DIR: &str = ".sift";

/// Configuration file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding `[store] datafile`.
pub const DATAFILE_ENV: &str = "SIFT_DATAFILE";

/// Environment variable overriding `[session] environment`.
pub const ENVIRONMENT_ENV: &str = "SIFT_ENVIRONMENT";

/// Environment variable overriding `[session] packages`.
pub const PACKAGES_ENV: &str = "SIFT_PACKAGES";

/// Top-level sift configuration, matching `.sift/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiftConfig {
    /// Project root. Not read from the file; set by [`SiftConfig::load`].
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub source: SourceSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Data file, relative to the project root unless absolute.
    pub datafile: PathBuf,
    pub busy_timeout_ms: u64,
    /// Open for classification only; node writes are rejected.
    pub read_only: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            datafile: PathBuf::from(".siftdata"),
            busy_timeout_ms: 60_000,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Namespace separating nodes of different interpreter/dependency setups.
    pub environment: String,
    /// Deselect stable tests. When false every candidate must run.
    pub select: bool,
    /// Record fingerprints of executed tests.
    pub collect: bool,
    /// Signature of the installed dependencies, such as `pip freeze` output.
    /// A change invalidates every test of the environment.
    pub packages: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            select: true,
            collect: true,
            packages: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Trust hashes from the git index when its stat data matches the file.
    pub use_vcs_index: bool,
    /// Extensions parsed as Python; everything else is a raw-text block.
    pub python_extensions: Vec<String>,
    /// Glob patterns (relative to the root) never recorded as dependencies.
    pub omit: Vec<String>,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            use_vcs_index: true,
            python_extensions: vec!["py".into()],
            omit: vec![
                "**/site-packages/**".into(),
                "**/dist-packages/**".into(),
                ".venv/**".into(),
                "venv/**".into(),
                ".tox/**".into(),
            ],
        }
    }
}

impl SiftConfig {
    /// Defaults rooted at `root`, without reading any file.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load `<root>/.sift/config.toml` when present, then apply environment
    /// overrides.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
            let parsed = Self::from_toml(&text)?;
            debug!(path = %path.display(), "Loaded config");
            parsed
        } else {
            Self::default()
        };
        config.root = root.to_path_buf();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text (no root, no environment overrides).
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// [`SiftConfig::load`]).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(datafile) = lookup(DATAFILE_ENV).filter(|v| !v.is_empty()) {
            self.store.datafile = PathBuf::from(datafile);
        }
        if let Some(environment) = lookup(ENVIRONMENT_ENV).filter(|v| !v.is_empty()) {
            self.session.environment = environment;
        }
        if let Some(packages) = lookup(PACKAGES_ENV).filter(|v| !v.is_empty()) {
            self.session.packages = packages;
        }
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.environment.is_empty() {
            return Err(ConfigError::Invalid(
                "session.environment must not be empty".into(),
            ));
        }
        if self.session.environment.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "session.environment must not contain ':' (got {:?})",
                self.session.environment
            )));
        }
        self.omit_patterns()?;
        Ok(())
    }

    /// Compiled `[source] omit` patterns.
    pub fn omit_patterns(&self) -> Result<Vec<glob::Pattern>, ConfigError> {
        self.source
            .omit
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| ConfigError::Invalid(format!("omit pattern {p:?}: {e}")))
            })
            .collect()
    }

    /// Absolute path of the data file.
    pub fn datafile_path(&self) -> PathBuf {
        if self.store.datafile.is_absolute() {
            self.store.datafile.clone()
        } else {
            self.root.join(&self.store.datafile)
        }
    }
}
