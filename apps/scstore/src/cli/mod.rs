//! # scstore CLI Module
//!
//! ## Available Commands
//!
//! - `init` - Create (or clear) a repository and save it
//! - `stats` - Show element counts
//! - `import` - Create elements from a JSON graph document
//! - `find` - Find links by content
//! - `arcs` - List the arcs of one element
//! - `status` - Show the effective configuration

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::error::AppError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// scstore - graph store of typed nodes, links and arcs
#[derive(Parser, Debug)]
#[command(name = "scstore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository directory (overrides the configuration file)
    #[arg(short = 'R', long, global = true)]
    pub repo: Option<PathBuf>,

    /// Segment limit (overrides the configuration file)
    #[arg(long, global = true)]
    pub max_segments: Option<usize>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a repository, or wipe an existing one with --force
    Init {
        /// Overwrite an existing repository
        #[arg(short, long)]
        force: bool,
    },

    /// Show element counts
    Stats,

    /// Create elements from a JSON graph document
    Import {
        /// Path to the graph document
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Find links with the given content
    Find {
        /// Content to look for (UTF-8)
        #[arg(long)]
        content: String,
    },

    /// List the arcs of one element
    Arcs {
        /// Segment of the element
        #[arg(long)]
        seg: u16,

        /// Offset of the element inside its segment
        #[arg(long)]
        offset: u16,

        /// List incoming instead of outgoing arcs
        #[arg(long)]
        incoming: bool,
    },

    /// Show the effective configuration
    Status,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

impl Cli {
    /// Configuration file (if any) with the command-line overrides applied.
    pub fn app_config(&self) -> Result<AppConfig, AppError> {
        let base = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        base.with_overrides(self.repo.clone(), self.max_segments)
    }

    /// Default log filter for the verbosity flags.
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), AppError> {
    let config = cli.app_config()?;
    let json = cli.json;

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&config, force),
        Some(Commands::Stats) => cmd_stats(&config, json),
        Some(Commands::Import { file }) => cmd_import(&config, json, &file),
        Some(Commands::Find { content }) => cmd_find(&config, json, &content),
        Some(Commands::Arcs {
            seg,
            offset,
            incoming,
        }) => cmd_arcs(&config, json, seg, offset, incoming),
        Some(Commands::Status) | None => cmd_status(&config, json),
    }
}
