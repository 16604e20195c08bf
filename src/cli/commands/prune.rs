//! Prune command - reclaim unreferenced layers

use crate::error::StrataResult;
use crate::store::LocalStore;
use console::style;
use std::path::Path;

/// Execute the prune command
pub async fn execute(store_root: &Path) -> StrataResult<()> {
    let store = LocalStore::open(store_root)?;
    let report = store.prune_layers().await?;
    println!(
        "{} {} layers, {} blobs, {} scratch directories",
        style("Reclaimed").green().bold(),
        report.layers,
        report.blobs,
        report.scratch
    );
    Ok(())
}
