use std::path::PathBuf;

use clap::Parser;

use sift_core::SiftError;
use sift_core::error::{ConfigError, StoreError};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "sift",
    version,
    about = "Select the tests affected by source changes"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Project root (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Map an error to the process exit code.
///
///   0 success
///   1 general/unknown error
///   2 configuration error
///   4 store error (`SQLite`, schema version, read-only)
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() {
            return 2;
        }
        if cause.is::<StoreError>() {
            return 4;
        }
        if let Some(sift) = cause.downcast_ref::<SiftError>() {
            return match sift {
                SiftError::Config(_) => 2,
                SiftError::Store(_) => 4,
                SiftError::Source(_) | SiftError::Blocks(_) => 1,
            };
        }
    }
    1
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    // Logs go to stderr so selections on stdout stay machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match commands::run(cli.command, &cli.root) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
