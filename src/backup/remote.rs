use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::backup::ledger::{self, LATEST_DIR, LedgerError, MarkerKind};
use crate::runner::{Backoff, RetryingRunner, RunnerError, SleepBackoff, ToolLauncher};

/// Filters for [`RemoteStore::list_files`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub include: Vec<String>,
    pub exclude: Option<String>,
    pub recursive: bool,
    pub dirs_only: bool,
    pub files_only: bool,
}

impl ListOptions {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.dirs_only {
            args.push("--dirs-only".to_string());
        }
        if self.files_only {
            args.push("--files-only".to_string());
        }
        for include in &self.include {
            args.push("--include".to_string());
            args.push(include.clone());
        }
        if let Some(exclude) = &self.exclude {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }
        if self.recursive {
            args.push("--recursive".to_string());
        }
        args
    }
}

#[derive(Debug, Deserialize)]
struct SizeReport {
    bytes: u64,
}

/// Short housekeeping commands against the backup destination.
#[derive(Debug)]
pub struct RemoteStore<L, B = SleepBackoff> {
    runner: RetryingRunner<L, B>,
    destination: String,
    dry_run: bool,
}

impl<L: ToolLauncher, B: Backoff> RemoteStore<L, B> {
    /// In dry-run mode commands that would change the destination are only logged.
    pub fn new(runner: RetryingRunner<L, B>, destination: impl Into<String>, dry_run: bool) -> Self {
        Self {
            runner,
            destination: destination.into(),
            dry_run,
        }
    }

    pub fn runner(&self) -> &RetryingRunner<L, B> {
        &self.runner
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn latest_path(&self) -> String {
        self.path(LATEST_DIR)
    }

    /// Path below the destination root.
    pub fn path(&self, relative: &str) -> String {
        format!("{}/{relative}", self.destination)
    }

    /// Creates `latest` so that listing a fresh destination works. Runs in dry-run mode too.
    pub async fn ensure_latest(&self) -> Result<(), RemoteError> {
        self.capture(vec!["mkdir".into(), self.latest_path()]).await?;
        Ok(())
    }

    /// Sorted paths below the destination root.
    pub async fn list_files(&self, options: &ListOptions) -> Result<Vec<String>, RemoteError> {
        let mut args = vec![
            "lsf".to_string(),
            self.destination.clone(),
            "--dir-slash=false".to_string(),
        ];
        args.extend(options.to_args());
        let stdout = self.capture(args).await?;
        let mut files: Vec<String> = stdout.lines().map(String::from).collect();
        files.sort();
        Ok(files)
    }

    pub async fn move_matching(&self, include: &str, from: &str, to: &str) -> Result<(), RemoteError> {
        self.mutate(vec![
            "move".into(),
            "--include".into(),
            include.into(),
            from.into(),
            to.into(),
        ])
        .await
    }

    pub async fn copy_matching(&self, include: &str, from: &str, to: &str) -> Result<(), RemoteError> {
        self.mutate(vec![
            "copy".into(),
            "--include".into(),
            include.into(),
            from.into(),
            to.into(),
        ])
        .await
    }

    pub async fn touch(&self, path: &str) -> Result<(), RemoteError> {
        self.mutate(vec!["touch".into(), path.into()]).await
    }

    /// Total bytes stored below `path`; zero in dry-run mode.
    pub async fn size(&self, path: &str) -> Result<u64, RemoteError> {
        if self.dry_run {
            info!("Dry run: not measuring {path}");
            return Ok(0);
        }
        let stdout = self
            .capture(vec!["size".into(), "--json".into(), path.into()])
            .await?;
        let report: SizeReport = serde_json::from_str(&stdout).context(InvalidSizeReportSnafu)?;
        Ok(report.bytes)
    }

    /// Sync log of the previous run. `None` before the first backup.
    pub async fn last_sync_log(&self, backup: &str) -> Result<Option<String>, RemoteError> {
        let mut logs = self
            .list_files(&ListOptions {
                include: vec![ledger::sync_log_pattern(backup)],
                files_only: true,
                ..Default::default()
            })
            .await?;
        match logs.len() {
            0 => Ok(None),
            1 => Ok(logs.pop()),
            _ => AmbiguousHistorySnafu {
                destination: self.destination.as_str(),
                logs,
            }
            .fail(),
        }
    }

    /// `(version, bytes)` for every stored older version, oldest first.
    pub async fn version_sizes(&self, backup: &str) -> Result<Vec<(String, u64)>, RemoteError> {
        let markers = self
            .list_files(&ListOptions {
                include: vec![format!("/*/{backup}_*_size_*")],
                files_only: true,
                recursive: true,
                ..Default::default()
            })
            .await?;
        markers
            .iter()
            .map(|path| ledger::parse_marker(path, MarkerKind::Size).context(LedgerSnafu))
            .collect()
    }

    /// Bytes transferred by the most recent runs, newest first.
    pub async fn transferred_history(
        &self,
        backup: &str,
        count: usize,
    ) -> Result<Vec<(String, u64)>, RemoteError> {
        let mut versions = self
            .list_files(&ListOptions {
                dirs_only: true,
                ..Default::default()
            })
            .await?;
        versions.retain(|dir| dir != LATEST_DIR);
        let recent = &versions[versions.len().saturating_sub(count)..];

        let mut include = vec![format!("/{backup}_*_transferred_*")];
        if !recent.is_empty() {
            include.push(format!(
                "/{{{}}}/{backup}_*_transferred_*",
                recent.join(",")
            ));
        }
        let markers = self
            .list_files(&ListOptions {
                include,
                files_only: true,
                recursive: true,
                ..Default::default()
            })
            .await?;
        let mut history = markers
            .iter()
            .map(|path| ledger::parse_marker(path, MarkerKind::Transferred).context(LedgerSnafu))
            .collect::<Result<Vec<_>, _>>()?;
        history.sort();
        history.reverse();
        Ok(history)
    }

    async fn capture(&self, args: Vec<String>) -> Result<String, RemoteError> {
        debug!("rclone {}", args.join(" "));
        self.runner.capture(&args).await.context(ToolSnafu)
    }

    async fn mutate(&self, args: Vec<String>) -> Result<(), RemoteError> {
        if self.dry_run {
            info!("Dry run: skipping rclone {}", args.join(" "));
            return Ok(());
        }
        self.capture(args).await.map(|_| ())
    }
}

#[derive(Debug, Snafu)]
pub enum RemoteError {
    #[snafu(display("Command against the backup destination failed"))]
    ToolError { source: RunnerError },
    #[snafu(display("There should be a single sync log in {destination}, found {}", logs.len()))]
    AmbiguousHistory {
        destination: String,
        logs: Vec<String>,
    },
    #[snafu(display("Could not understand the size reported by rclone"))]
    InvalidSizeReport { source: serde_json::Error },
    #[snafu(display("The backup ledger is damaged"))]
    LedgerError { source: LedgerError },
}
