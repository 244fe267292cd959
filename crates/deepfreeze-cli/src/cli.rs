use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deepfreeze")]
#[command(about = "Encrypted, size-bounded backups for cold object storage", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Append log output to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a backup of a directory tree
    Backup {
        /// Directory to back up
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Directory for backup output [default: /var/lib/deepfreeze/]
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Paths to skip (repeatable)
        #[arg(short, long = "exclude")]
        exclude: Vec<PathBuf>,
    },
}
