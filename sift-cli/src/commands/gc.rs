use std::path::Path;

use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct GcArgs {}

pub fn run(_args: &GcArgs, root: &Path) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let session = super::open_session(config)?;
    let removed = session
        .store()
        .remove_unused_fingerprints()
        .context("Cannot sweep fingerprints")?;
    println!("Removed {removed} unused fingerprints");
    Ok(())
}
