// Integration test utilities and fixture management for sift.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::SystemTime;

use anyhow::Context;

use sift_core::types::{Selection, SessionOutcome, TestExecution, TestResult};
use sift_core::{Session, SiftConfig};

/// Library module with two independent functions: `f` on lines 1-2, `g` on
/// lines 4-5.
pub const A_PY: &str = "\
def f():
    return 1

def g():
    return 2
";

/// Tests of [`A_PY`]: `test_f` on lines 3-4, `test_g` on lines 6-7.
pub const TEST_A_PY: &str = "\
from a import f, g

def test_f():
    assert f() == 1

def test_g():
    assert g() == 2
";

/// A temporary project directory, optionally under git.
#[derive(Debug)]
pub struct TestProject {
    pub dir: tempfile::TempDir,
    use_git: bool,
}

impl TestProject {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// An empty project.
    pub fn empty() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create tempdir"),
            use_git: false,
        }
    }

    /// `a.py` and `test_a.py`.
    pub fn python() -> Self {
        let project = Self::empty();
        project.write("a.py", A_PY);
        project.write("test_a.py", TEST_A_PY);
        project
    }

    /// [`TestProject::python`] committed to a fresh git repository. `None`
    /// when no `git` binary is available.
    pub fn python_in_git() -> Option<Self> {
        if !git_available() {
            return None;
        }
        let mut project = Self::python();
        project.git(&["init", "-q"]);
        project.git(&["config", "user.email", "test@sift.dev"]);
        project.git(&["config", "user.name", "Test"]);
        project.git(&["add", "."]);
        project.git(&["commit", "-q", "-m", "Initial commit"]);
        project.use_git = true;
        Some(project)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path().join(rel)).unwrap()
    }

    /// Replace the first occurrence of `from` in `rel`.
    pub fn edit(&self, rel: &str, from: &str, to: &str) {
        let text = self.read(rel);
        assert!(text.contains(from), "{rel} does not contain {from:?}");
        self.write(rel, &text.replacen(from, to, 1));
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.path().join(rel)).unwrap();
    }

    /// Set the modification time of `rel`.
    pub fn set_mtime(&self, rel: &str, mtime: SystemTime) {
        std::fs::File::options()
            .write(true)
            .open(self.path().join(rel))
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    /// Run `git` in the project directory.
    pub fn git(&self, args: &[&str]) {
        git(self.path(), args);
    }

    /// Default configuration rooted at the project. The git index is only
    /// consulted for git projects.
    pub fn config(&self) -> SiftConfig {
        let mut config = SiftConfig::for_root(self.path());
        config.source.use_vcs_index = self.use_git;
        config
    }

    pub fn session(&self) -> Session {
        self.session_with(|_| {})
    }

    pub fn session_with(&self, configure: impl FnOnce(&mut SiftConfig)) -> Session {
        let mut config = self.config();
        configure(&mut config);
        Session::open(config).expect("open session")
    }

    /// One complete session: select among `candidates`, record `executed`
    /// and finish with `outcome`.
    pub fn run(
        &self,
        candidates: &[&str],
        executed: &[TestExecution],
        outcome: SessionOutcome,
    ) -> anyhow::Result<Selection> {
        let mut session = self.session();
        let candidates: Vec<String> = candidates.iter().map(|c| (*c).to_string()).collect();
        let selection = session.select(&candidates).context("select")?;
        session.record_batch(executed).context("record")?;
        session.finish(outcome).context("finish")?;
        Ok(selection)
    }

    /// A metadata attribute of the default environment.
    pub fn attribute(&self, key: &str) -> Option<serde_json::Value> {
        self.session()
            .store()
            .fetch_attribute(key, None)
            .expect("fetch attribute")
    }
}

/// A test execution covering `files` (path, executed lines).
pub fn execution(name: &str, files: &[(&str, &[usize])], result: TestResult) -> TestExecution {
    TestExecution {
        name: name.to_string(),
        files: files
            .iter()
            .map(|(f, lines)| ((*f).to_string(), lines.iter().copied().collect()))
            .collect::<BTreeMap<_, _>>(),
        result,
    }
}

/// `test_f` of [`TEST_A_PY`], covering `f` of [`A_PY`].
pub fn test_f(result: TestResult) -> TestExecution {
    execution(
        "test_a.py::test_f",
        &[("a.py", &[1, 2]), ("test_a.py", &[1, 3, 4])],
        result,
    )
}

/// `test_g` of [`TEST_A_PY`], covering `g` of [`A_PY`].
pub fn test_g(result: TestResult) -> TestExecution {
    execution(
        "test_a.py::test_g",
        &[("a.py", &[4, 5]), ("test_a.py", &[1, 6, 7])],
        result,
    )
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_DATE", "2025-01-15T10:00:00+00:00")
        .env("GIT_COMMITTER_DATE", "2025-01-15T10:00:00+00:00")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .unwrap_or_else(|e| panic!("git {}: {e}", args.join(" ")));
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!("git {} failed: {stderr}", args.join(" "));
    }
}
