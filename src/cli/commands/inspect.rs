//! Inspect command - print an image record

use crate::cli::args::InspectArgs;
use crate::error::StrataResult;
use crate::store::{ImageStore, LocalStore};
use std::path::Path;

/// Execute the inspect command
pub async fn execute(args: InspectArgs, store_root: &Path) -> StrataResult<()> {
    let store = LocalStore::open(store_root)?;
    let image = store.lookup(&args.image).await?;
    println!("{}", serde_json::to_string_pretty(&image)?);
    Ok(())
}
