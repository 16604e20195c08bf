//! Import command - create a base image from a directory

use crate::cli::args::ImportArgs;
use crate::error::{StrataError, StrataResult};
use crate::image::Platform;
use crate::runconfig::RunConfig;
use crate::store::LocalStore;
use console::style;
use std::path::Path;

/// Execute the import command
pub async fn execute(args: ImportArgs, store_root: &Path) -> StrataResult<()> {
    let platform = match args.platform.as_deref() {
        Some(spec) => Platform::parse(spec)?,
        None => Platform::host(),
    };
    if let Some(bad) = args.env.iter().find(|pair| !pair.contains('=')) {
        return Err(StrataError::InvalidParameter(format!(
            "environment variable {:?} is not KEY=VALUE",
            bad
        )));
    }

    let config = RunConfig {
        cmd: args.cmd,
        env: args.env,
        ..RunConfig::default()
    };

    let store = LocalStore::open(store_root)?;
    let image = store.import_rootfs(&args.rootfs, &platform, config).await?;
    store.tag(&args.tag, &image.id)?;

    println!(
        "{} {} as {} ({})",
        style("Imported").green().bold(),
        image.id.short(),
        args.tag,
        platform
    );
    Ok(())
}
