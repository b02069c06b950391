use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Device Policy Control Plane
///
/// Resolves multi-admin device policies, transfers device and profile
/// ownership crash-safely and enforces managed-profile time budgets.
#[derive(Parser, Debug)]
#[command(name = "device-policy")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the platform config location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show owners, affiliation, device logging and profile budgets
    Status,
    /// Print the resolved policy of a user as JSON
    Resolve {
        /// User to resolve
        #[arg(long)]
        user: u32,

        /// Resolve the parent of a managed profile instead
        #[arg(long)]
        parent: bool,
    },
    /// Finish an interrupted ownership transfer and exit
    Recover,
    /// Write an example configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the policy daemon in the foreground
    ///
    /// Host events are read from stdin, one per line: `unlocked <user>`,
    /// `locked <user>`, `package-removed <package> <user>`, `clock-changed`.
    Run,
}
