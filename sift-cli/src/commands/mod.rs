pub mod gc;
pub mod record;
pub mod select;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;

use sift_core::{Session, SiftConfig};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show store statistics and saving statistics
    Status(status::StatusArgs),
    /// Split candidate tests into must-run and may-skip
    Select(select::SelectArgs),
    /// Ingest executed tests from a JSON-lines file
    Record(record::RecordArgs),
    /// Delete fingerprints no test depends on
    Gc(gc::GcArgs),
}

pub fn run(cmd: Command, root: &Path) -> anyhow::Result<()> {
    match cmd {
        Command::Status(args) => status::run(&args, root),
        Command::Select(args) => select::run(&args, root),
        Command::Record(args) => record::run(&args, root),
        Command::Gc(args) => gc::run(&args, root),
    }
}

/// Canonical project root.
pub fn resolve_root(root: &Path) -> anyhow::Result<PathBuf> {
    std::fs::canonicalize(root)
        .with_context(|| format!("Cannot resolve path: {}", root.display()))
}

/// Load the project's configuration.
pub fn load_config(root: &Path) -> anyhow::Result<SiftConfig> {
    let root = resolve_root(root)?;
    SiftConfig::load(&root).with_context(|| format!("Cannot load config for {}", root.display()))
}

/// Open a session over the project's store.
pub fn open_session(config: SiftConfig) -> anyhow::Result<Session> {
    let datafile = config.datafile_path();
    Session::open(config).with_context(|| format!("Cannot open store: {}", datafile.display()))
}
