use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;

use sift_core::types::{SessionOutcome, TestExecution};

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// JSON-lines file of executed tests (`-` reads stdin)
    pub input: PathBuf,
}

pub fn run(args: &RecordArgs, root: &Path) -> anyhow::Result<()> {
    let executions = if args.input.as_os_str() == "-" {
        parse_executions(std::io::stdin().lock())?
    } else {
        let file = File::open(&args.input)
            .with_context(|| format!("Cannot open {}", args.input.display()))?;
        parse_executions(BufReader::new(file))
            .with_context(|| format!("Cannot read {}", args.input.display()))?
    };

    let config = super::load_config(root)?;
    let mut session = super::open_session(config)?;
    session
        .record_batch(&executions)
        .context("Failed to record test executions")?;
    session.finish(SessionOutcome::partial())?;

    println!("Recorded {} tests", executions.len());
    Ok(())
}

/// One [`TestExecution`] per non-blank line.
fn parse_executions(reader: impl BufRead) -> anyhow::Result<Vec<TestExecution>> {
    let mut executions = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let execution: TestExecution = serde_json::from_str(&line)
            .with_context(|| format!("Invalid test execution on line {}", index + 1))?;
        executions.push(execution);
    }
    Ok(executions)
}
