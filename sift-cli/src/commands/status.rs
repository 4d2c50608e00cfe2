use std::path::Path;

use anyhow::Context;
use clap::Args;

use sift_core::session::LAST_RUN_KEY;

const SAVING_KEYS: [&str; 4] = ["tests_saved", "tests_all", "time_saved", "time_all"];

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print a JSON object instead of text
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: &StatusArgs, root: &Path) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let datafile = config.datafile_path();
    if !datafile.exists() {
        anyhow::bail!(
            "No data file at {}. Record a test run first.",
            datafile.display()
        );
    }
    let environment = config.session.environment.clone();
    let session = super::open_session(config)?;
    let store = session.store();

    let stats = session.stats().context("Failed to read store stats")?;
    let mut savings = serde_json::Map::new();
    for key in SAVING_KEYS {
        for name in [key.to_string(), format!("potential_{key}")] {
            if let Some(value) = store.fetch_attribute(&name, None)? {
                savings.insert(name, value);
            }
        }
    }
    let last_run = store.fetch_attribute(LAST_RUN_KEY, None)?;

    if args.json {
        let out = serde_json::json!({
            "datafile": datafile.display().to_string(),
            "environment": environment,
            "stats": stats,
            "savings": savings,
            "last_run_at": last_run,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("sift status for {}", session.config().root.display());
    println!();
    println!("  Data file:   {}", datafile.display());
    println!("  Size:        {}", format_bytes(stats.db_size_bytes));
    println!("  Environment: {environment}");
    println!();
    println!("  Tests:        {:>8}", stats.nodes);
    println!("  Fingerprints: {:>8}", stats.fingerprints);
    println!("  Edges:        {:>8}", stats.edges);
    println!("  Files:        {:>8}", stats.files);
    println!();

    if savings.is_empty() {
        println!("  Savings: (none recorded)");
    } else {
        println!("  Savings:");
        for (key, value) in &savings {
            println!("    {key:<24} {value}");
        }
    }
    println!();

    match last_run.as_ref().and_then(|v| v.as_str()) {
        Some(at) => println!("  Last run: {at}"),
        None => println!("  Last run: (never)"),
    }

    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
