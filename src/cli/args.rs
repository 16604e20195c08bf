//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Strata - incremental image builds
///
/// Runs typed build plans against a local content-addressed store,
/// reusing cached images for steps whose inputs have not changed.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Image store directory (overrides store.root)
    #[arg(long, global = true, env = "STRATA_STORE")]
    pub store: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a build plan
    Build(BuildArgs),

    /// Create a base image from a directory
    Import(ImportArgs),

    /// List images in the store
    Images(ImagesArgs),

    /// Show the configuration of an image
    Inspect(InspectArgs),

    /// Reclaim layers no image references
    Prune,

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Build plan (TOML)
    pub plan: PathBuf,

    /// Build context directory (defaults to the plan's directory)
    #[arg(short = 'C', long)]
    pub context: Option<PathBuf>,

    /// Tag the resulting image
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Do not use cached images
    #[arg(long)]
    pub no_cache: bool,

    /// Target platform (os/arch[/variant])
    #[arg(long)]
    pub platform: Option<String>,

    /// Network for RUN containers
    #[arg(long)]
    pub network: Option<String>,

    /// Only print the final image id
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the import command
#[derive(Parser, Debug)]
pub struct ImportArgs {
    /// Root filesystem directory
    pub rootfs: PathBuf,

    /// Tag for the new image
    #[arg(short, long)]
    pub tag: String,

    /// Platform of the image (defaults to the host)
    #[arg(long)]
    pub platform: Option<String>,

    /// Default command (repeat for each argument)
    #[arg(long = "cmd")]
    pub cmd: Vec<String>,

    /// Environment variables (KEY=VALUE)
    #[arg(short, long)]
    pub env: Vec<String>,
}

/// Arguments for the images command
#[derive(Parser, Debug)]
pub struct ImagesArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Include intermediate images
    #[arg(short, long)]
    pub all: bool,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Tag, image id or unique id prefix
    pub image: String,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for list commands
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Plain,
}
