use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::application::data::{LogLevel, OnLarge};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Versioned rclone backups that ask before uploading large changes")]
pub struct Cli {
    #[clap(long, short, default_value = "warn", value_enum, global = true)]
    pub log_level: LogLevel,

    /// Directory holding thrifty.yaml, the exclude files and the local logs
    #[clap(long, short, default_value = ".", global = true)]
    pub root: PathBuf,

    /// Plan and report without changing the backup destination
    #[clap(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run due backups on every tick until interrupted
    Run {
        #[clap(long, default_value = "skip", value_enum)]
        on_large: OnLarge,
    },
    /// Back up one source now, regardless of its interval
    Backup {
        name: String,
        #[clap(long, default_value = "skip", value_enum)]
        on_large: OnLarge,
    },
    /// Show the size of every stored version
    List { name: String },
    /// Show how much recent runs transferred
    History {
        name: String,
        #[clap(long, short, default_value_t = 10)]
        count: usize,
    },
}
