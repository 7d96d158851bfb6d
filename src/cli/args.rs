//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Envspace - shared cache of prebuilt build environments
///
/// Allocates, reuses and recycles disk-resident environment spaces
/// across concurrent processes.
#[derive(Parser, Debug)]
#[command(name = "envspace")]
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
    #[arg(short, long, global = true, env = "ENVSPACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Spaces directory (overrides pool.base_dir)
    #[arg(long, global = true, env = "ENVSPACE_BASE_DIR")]
    pub base_dir: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List spaces and their state
    List(ListArgs),

    /// Get a space built from a spec, reusing or rebuilding when possible
    Allocate(AllocateArgs),

    /// Delete damaged or incomplete spaces
    Repair(RepairArgs),

    /// Delete least recently used idle spaces
    Prune(PruneArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the allocate command
#[derive(Parser, Debug)]
pub struct AllocateArgs {
    /// Environment spec file
    pub spec: PathBuf,

    /// Idle seconds before a non-matching space may be rebuilt
    #[arg(long)]
    pub reuse_timeout: Option<u64>,

    /// Output format (plain prints only the space path)
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the repair command
#[derive(Parser, Debug)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["name", "all"])))]
pub struct RepairArgs {
    /// Space to repair
    pub name: Option<String>,

    /// Repair every damaged space not in use
    #[arg(long)]
    pub all: bool,
}

/// Arguments for the prune command
#[derive(Parser, Debug)]
pub struct PruneArgs {
    /// Spaces to keep (default: from config)
    #[arg(long)]
    pub keep: Option<usize>,

    /// Dry run - show what would be removed
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
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
}

/// Output format for list and allocate
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
