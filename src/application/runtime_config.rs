use std::path::PathBuf;

use crate::cli::Cli;

/// Directory below the root that keeps the local logs of every backup.
const LOGS_DIR: &str = ".thrifty";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub root: PathBuf,
    pub dry_run: bool,
}

impl RuntimeConfig {
    pub fn logs_dir(&self, backup: &str) -> PathBuf {
        self.root.join(LOGS_DIR).join(backup)
    }

    pub fn exclude_file(&self, backup: &str) -> PathBuf {
        self.root.join(format!("{backup}.exclude"))
    }
}

impl From<&Cli> for RuntimeConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            root: cli.root.clone(),
            dry_run: cli.dry_run,
        }
    }
}
