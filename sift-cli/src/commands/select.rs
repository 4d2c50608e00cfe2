use std::io::BufRead;
use std::path::Path;

use anyhow::Context;
use clap::Args;

use sift_core::types::SessionOutcome;

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Candidate test names (default: one per line from stdin)
    pub candidates: Vec<String>,

    /// Print the tests that may be skipped instead of those that must run
    #[arg(long, conflicts_with = "json")]
    pub skipped: bool,

    /// Print both lists as a JSON object
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: &SelectArgs, root: &Path) -> anyhow::Result<()> {
    let candidates = if args.candidates.is_empty() {
        read_candidates(std::io::stdin().lock())?
    } else {
        args.candidates.clone()
    };

    let config = super::load_config(root)?;
    let mut session = super::open_session(config)?;
    let selection = session
        .select(&candidates)
        .context("Failed to classify stored tests")?;
    session.finish(SessionOutcome::partial())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&selection)?);
        return Ok(());
    }
    let names = if args.skipped {
        &selection.may_skip
    } else {
        &selection.must_run
    };
    for name in names {
        println!("{name}");
    }
    Ok(())
}

/// Non-empty, trimmed lines of `reader`.
fn read_candidates(reader: impl BufRead) -> anyhow::Result<Vec<String>> {
    let mut candidates = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read candidates")?;
        let name = line.trim();
        if !name.is_empty() {
            candidates.push(name.to_string());
        }
    }
    Ok(candidates)
}
