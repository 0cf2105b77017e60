use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TpmCommand,
    /// Reinstall or overwrite even when already present.
    #[clap(long, global = true)]
    pub force: bool,
    /// Enables verbose output.
    #[clap(short, long, global = true)]
    pub verbose: bool,
    /// Enables debug output (implies --verbose).
    #[clap(long, global = true)]
    pub debug: bool,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum TpmCommand {
    /// Installs the latest release of a tool from its GitHub repository.
    Install {
        /// Tool to install, as `owner/repo`.
        tool: String,
    },
    /// Updates one installed tool, or all of them, to the latest release.
    Update {
        /// Tool to update, as `owner/repo`.
        tool: Option<String>,
        /// Update every installed tool.
        #[clap(long)]
        all: bool,
    },
    /// Removes a tool, its PATH symlink and its store entries.
    Remove {
        /// Tool to remove, as `owner/repo`.
        tool: String,
    },
    /// Shows the manifest record of an installed tool.
    Info {
        /// Tool to inspect, as `owner/repo`.
        tool: String,
    },
    /// Lists installed tools.
    List,
    /// Recreates broken PATH symlinks and reports store inconsistencies.
    Repair,
    /// Prunes old store versions and stale temporary files.
    Cleanup,
}
