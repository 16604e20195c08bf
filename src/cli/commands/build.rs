//! Build command - run a build plan

use crate::builder::{Builder, Plan};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::container::create_backend;
use crate::context::BuildContext;
use crate::error::StrataResult;
use crate::output::Progress;
use crate::store::LocalStore;
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, store_root: &Path) -> StrataResult<()> {
    let plan = Plan::load(&args.plan).await?;
    let context = args.context.clone().unwrap_or_else(|| plan_dir(&args.plan));
    debug!(
        "Building {} ({} steps) in context {}",
        args.plan.display(),
        plan.steps.len(),
        context.display()
    );

    let mut options = config.build.clone();
    options.no_cache |= args.no_cache;
    if let Some(platform) = args.platform {
        options.platform = Some(platform);
    }
    if let Some(network) = args.network {
        options.network_mode = network;
    }

    let store = Arc::new(LocalStore::open(store_root)?);
    let backend = create_backend(config, store.clone())?;
    debug!("Using {} container backend", backend.backend_name());
    let progress = if args.quiet {
        Progress::quiet()
    } else {
        Progress::stdout()
    };

    let mut builder = Builder::new(
        store.clone(),
        backend,
        BuildContext::new(context),
        &options,
        progress,
    )?;
    let summary = builder.build(&plan.steps).await?;

    if let Some(tag) = &args.tag {
        store.tag(tag, &summary.image_id)?;
    }

    if args.quiet {
        println!("{}", summary.image_id);
        return Ok(());
    }

    println!(
        "{} {}",
        style("Successfully built").green().bold(),
        summary.image_id.short()
    );
    if let Some(tag) = &args.tag {
        println!("{} {}", style("Successfully tagged").green().bold(), tag);
    }
    println!(
        "{}",
        style(format!(
            "{} steps, {} cached, {} containers, {} sources copied",
            summary.steps, summary.cache_hits, summary.containers_created, summary.materialized
        ))
        .dim()
    );
    Ok(())
}

fn plan_dir(plan: &Path) -> PathBuf {
    match plan.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
