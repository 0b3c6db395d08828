use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::pin;

use compio::fs;
use futures::future::{self, Either};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::backup::ledger::{self, LedgerError, MarkerKind};
use crate::backup::{
    BackupEvent, BackupState, Decision, DecisionError, DecisionGate, InvalidTransitionError,
    LargeEntry, Notifier, RemoteError, RemoteStore, SourceMount, SourceView, SourceViewError,
};
use crate::config::BackupConfig;
use crate::events::{LineSink, ScoutError, ScoutParser, SyncParser};
use crate::ext::{TimestampExt, format_size};
use crate::filesystem::{ChangeTree, Entry};
use crate::runner::{Backoff, RunnerError, ToolLauncher};
use crate::scheduler::{SkipReason, Verdict, decide};

const SYNC_FLAGS: [&str; 9] = [
    "sync",
    "--use-json-log",
    "--log-level",
    "INFO",
    "--fast-list",
    "--links",
    "--track-renames",
    "--track-renames-strategy",
    "modtime,leaf",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Performed { transferred: u64 },
    Skipped(SkipReason),
}

impl BackupOutcome {
    pub fn is_performed(&self) -> bool {
        matches!(self, BackupOutcome::Performed { .. })
    }
}

/// Local settings of a run that do not come from the backup's own configuration.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Where the logs and reports of the runs are kept.
    pub logs_dir: PathBuf,
    /// rclone filter file; used when it exists.
    pub exclude_file: PathBuf,
    pub bwlimit: Option<String>,
    pub dry_run: bool,
}

/// Channels to whoever presents the backup to the operator.
#[derive(Debug, Clone)]
pub struct Frontend {
    pub notifier: Notifier,
    pub gate: DecisionGate,
}

/// One run of one backup: scout, review, sync, finalize.
pub struct BackupTask<'a, L, B, V> {
    config: &'a BackupConfig,
    options: TaskOptions,
    remote: RemoteStore<L, B>,
    view: &'a V,
    frontend: Frontend,
    state: BackupState,
}

impl<'a, L, B, V> BackupTask<'a, L, B, V>
where
    L: ToolLauncher,
    B: Backoff,
    V: SourceView,
{
    pub fn new(
        config: &'a BackupConfig,
        options: TaskOptions,
        remote: RemoteStore<L, B>,
        view: &'a V,
        frontend: Frontend,
    ) -> Self {
        Self {
            config,
            options,
            remote,
            view,
            frontend,
            state: BackupState::Idle,
        }
    }

    /// Runs the backup if it is due, or unconditionally (short of repeating the last one) with
    /// `force`.
    pub async fn run(mut self, force: bool) -> Result<BackupOutcome, BackupError> {
        let config = self.config;
        let name = config.name.as_str();
        if config.interval.is_none() && !force {
            debug!("{name}: {}", SkipReason::ManualOnly);
            return Ok(BackupOutcome::Skipped(SkipReason::ManualOnly));
        }

        fs::create_dir_all(&self.options.logs_dir)
            .await
            .context(ArtifactSnafu {
                path: self.options.logs_dir.display().to_string(),
            })?;
        self.remote.ensure_latest().await.context(RemoteSnafu)?;
        let last_log = self.remote.last_sync_log(name).await.context(RemoteSnafu)?;
        let last_backup = last_log
            .as_deref()
            .map(ledger::parse_log_timestamp)
            .transpose()
            .context(LedgerSnafu)?;
        let latest_view = self.observe_view(self.view.latest_timestamp().await)?;

        if let Verdict::Skip(reason) = decide(config.interval, force, last_backup, latest_view)
        {
            info!("{name}: {reason}");
            if let SkipReason::AlreadyBackedUp { timestamp } = &reason {
                if force {
                    self.notify(BackupEvent::AlreadyBackedUp {
                        backup: name.to_string(),
                        timestamp: *timestamp,
                    });
                }
            }
            return Ok(BackupOutcome::Skipped(reason));
        }

        let mount = self.observe_view(self.view.acquire().await)?;
        let performed = self.perform(&mount, last_log.as_deref()).await;
        let released = self.view.release(mount).await;
        let outcome = self.conclude(performed)?;
        released.context(SourceViewSnafu)?;
        Ok(outcome)
    }

    async fn perform(
        &mut self,
        mount: &SourceMount,
        last_log: Option<&str>,
    ) -> Result<BackupOutcome, BackupError> {
        self.enter(BackupState::Preparing)?;
        let timestamp = mount
            .timestamp
            .to_timestamp_string()
            .context(TimestampSnafu)?;
        let tree = self.scout(mount, &timestamp).await?;
        let mut total = tree.transfer_size();
        info!("{}: {} to back up", self.config.name, format_size(total, false));

        let large_entries = match self.config.threshold {
            Some(threshold) => tree.large_entries(threshold),
            None => Vec::new(),
        };
        let mut excluded = HashSet::new();
        let mut skipped = false;
        if !large_entries.is_empty() {
            self.write_large_report(&timestamp, &large_entries).await?;
            self.enter(BackupState::AwaitingDecision)?;
            let entries = large_entries.iter().map(|entry| LargeEntry::from(*entry)).collect();
            match self.await_decision(total, entries).await? {
                Decision::Skip => skipped = true,
                Decision::Exclude(paths) => {
                    let excluded_size: u64 = paths
                        .iter()
                        .filter_map(|path| tree.lookup(path).ok())
                        .map(Entry::transfer_size)
                        .sum();
                    total = total.saturating_sub(excluded_size);
                    excluded = paths;
                }
            }
        }

        if skipped || tree.files_to_sync(&excluded).next().is_none() {
            self.enter(BackupState::Finalizing)?;
            self.enter(BackupState::Idle)?;
            let reason = if skipped {
                SkipReason::OperatorSkipped
            } else {
                SkipReason::NothingToTransfer
            };
            info!("{}: {reason}", self.config.name);
            return Ok(BackupOutcome::Skipped(reason));
        }

        self.enter(BackupState::Syncing)?;
        self.notify(BackupEvent::StartBackup {
            backup: self.config.name.clone(),
            total,
        });
        let files = self.write_files_list(&tree, &excluded, &timestamp).await?;
        let backup_dir = match last_log {
            Some(log) => Some(
                self.remote
                    .path(ledger::timestamp_from_log(log).context(LedgerSnafu)?),
            ),
            None => None,
        };
        let transferred = self
            .sync(&tree, mount, &files, backup_dir.as_deref(), total, &timestamp)
            .await?;

        self.enter(BackupState::Finalizing)?;
        self.finalize(last_log, &timestamp, transferred).await?;
        self.enter(BackupState::Idle)?;
        self.notify(BackupEvent::Finished {
            backup: self.config.name.clone(),
            transferred,
        });
        Ok(BackupOutcome::Performed { transferred })
    }

    async fn scout(&self, mount: &SourceMount, timestamp: &str) -> Result<ChangeTree, BackupError> {
        let mut extra = vec!["--retries".to_string(), "1".to_string()];
        if fs::metadata(&self.options.exclude_file).await.is_ok() {
            extra.push("--exclude-from".to_string());
            extra.push(self.options.exclude_file.display().to_string());
        }
        let args = self.sync_args(&mount.root, extra, true);

        let mut sink = RecordingSink::new(ScoutParser::new());
        let streamed = self.remote.runner().stream(&args, &mut sink).await;
        self.write_artifact(timestamp, "scout", "log", sink.contents())
            .await?;
        streamed.map_err(|err| tool_failure("scout", err))?;
        let tree = sink.into_inner().finish().context(ScoutSnafu)?;

        let root_name = self.config.source.display().to_string();
        let export = tree.export(&root_name, mount.timestamp.assume_utc().unix_timestamp());
        let export = serde_json::to_vec(&export).context(ExportSnafu)?;
        self.write_artifact(timestamp, "scout", "json", export).await?;
        Ok(tree)
    }

    async fn await_decision(
        &self,
        total: u64,
        entries: Vec<LargeEntry>,
    ) -> Result<Decision, BackupError> {
        let abort = self.remote.runner().abort_signal();
        let request = pin!(self.frontend.gate.decide(&self.config.name, total, entries));
        match future::select(pin!(abort.aborted()), request).await {
            Either::Left(_) => AbortedSnafu.fail(),
            Either::Right((decision, _)) => decision.context(DecisionSnafu),
        }
    }

    async fn sync(
        &self,
        tree: &ChangeTree,
        mount: &SourceMount,
        files: &Path,
        backup_dir: Option<&str>,
        total: u64,
        timestamp: &str,
    ) -> Result<u64, BackupError> {
        let mut extra = vec![
            "--files-from-raw".to_string(),
            files.display().to_string(),
        ];
        if let Some(backup_dir) = backup_dir {
            extra.push("--backup-dir".to_string());
            extra.push(backup_dir.to_string());
        }
        let args = self.sync_args(&mount.root, extra, self.options.dry_run);

        let mut sink = RecordingSink::new(ProgressSink {
            parser: SyncParser::new(tree, self.options.dry_run),
            backup: &self.config.name,
            notifier: &self.frontend.notifier,
            total,
        });
        let streamed = self.remote.runner().stream(&args, &mut sink).await;
        self.write_artifact(timestamp, "sync", "log", sink.contents())
            .await?;
        streamed.map_err(|err| tool_failure("sync", err))?;

        let progress = sink.into_inner();
        if !progress.parser.errors().is_empty() {
            warn!(
                "{}: rclone reported {} errors during the sync",
                self.config.name,
                progress.parser.errors().len()
            );
        }
        Ok(progress.parser.tree().transfer_size())
    }

    async fn finalize(
        &self,
        last_log: Option<&str>,
        timestamp: &str,
        transferred: u64,
    ) -> Result<(), BackupError> {
        let name = self.config.name.as_str();
        let transferred_marker = ledger::marker_name(name, timestamp, MarkerKind::Transferred, transferred);
        self.remote
            .touch(&self.remote.path(&transferred_marker))
            .await
            .context(RemoteSnafu)?;

        if let Some(last_log) = last_log {
            let version = ledger::timestamp_from_log(last_log).context(LedgerSnafu)?;
            let version_dir = self.remote.path(version);
            self.remote
                .move_matching(
                    &ledger::run_artifacts_pattern(last_log),
                    self.remote.destination(),
                    &version_dir,
                )
                .await
                .context(RemoteSnafu)?;
            let size = self.remote.size(&version_dir).await.context(RemoteSnafu)?;
            let size_marker = ledger::marker_name(name, version, MarkerKind::Size, size);
            self.remote
                .touch(&format!("{version_dir}/{size_marker}"))
                .await
                .context(RemoteSnafu)?;
        }

        self.remote
            .copy_matching(
                &format!("{name}_{timestamp}_*"),
                &self.options.logs_dir.display().to_string(),
                self.remote.destination(),
            )
            .await
            .context(RemoteSnafu)
    }

    fn sync_args(&self, source: &Path, extra: Vec<String>, dry_run: bool) -> Vec<String> {
        let mut args: Vec<String> = SYNC_FLAGS.iter().map(|flag| flag.to_string()).collect();
        args.extend(extra);
        if let Some(bwlimit) = &self.options.bwlimit {
            args.push("--bwlimit".to_string());
            args.push(bwlimit.clone());
        }
        if dry_run {
            args.push("--dry-run".to_string());
        }
        args.push(source.display().to_string());
        args.push(self.remote.latest_path());
        args
    }

    async fn write_large_report(
        &self,
        timestamp: &str,
        entries: &[&Entry],
    ) -> Result<PathBuf, BackupError> {
        let report: String = entries
            .iter()
            .map(|entry| {
                format!(
                    "{}   {}\n",
                    format_size(entry.transfer_size(), true),
                    entry.path()
                )
            })
            .collect();
        self.write_artifact(timestamp, "large", "log", report.into_bytes())
            .await
    }

    async fn write_files_list(
        &self,
        tree: &ChangeTree,
        excluded: &HashSet<String>,
        timestamp: &str,
    ) -> Result<PathBuf, BackupError> {
        let mut files = String::new();
        for entry in tree.files_to_sync(excluded) {
            for path in entry.tool_paths() {
                files.push_str(&path);
                files.push('\n');
            }
        }
        self.write_artifact(timestamp, "files", "txt", files.into_bytes())
            .await
    }

    async fn write_artifact(
        &self,
        timestamp: &str,
        label: &str,
        extension: &str,
        contents: Vec<u8>,
    ) -> Result<PathBuf, BackupError> {
        let file_name = ledger::artifact_name(&self.config.name, timestamp, label, extension);
        let path = self.options.logs_dir.join(file_name);
        fs::write(&path, contents).await.0.context(ArtifactSnafu {
            path: path.display().to_string(),
        })?;
        Ok(path)
    }

    fn enter(&mut self, state: BackupState) -> Result<(), BackupError> {
        self.state.transition(state).context(StateSnafu)?;
        debug!("{}: {state}", self.config.name);
        self.notify(BackupEvent::StateChanged {
            backup: self.config.name.clone(),
            state,
        });
        Ok(())
    }

    /// Unwinds a failed run back to idle, through `Aborted` when it failed before finalizing.
    fn conclude(
        &mut self,
        performed: Result<BackupOutcome, BackupError>,
    ) -> Result<BackupOutcome, BackupError> {
        let err = match performed {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };
        if self.state.can_transition_to(BackupState::Aborted) {
            let _ = self.enter(BackupState::Aborted);
        }
        if let Err(transition) = self.enter(BackupState::Idle) {
            warn!("{transition}");
        }
        self.notify(BackupEvent::Failed {
            backup: self.config.name.clone(),
            message: err.to_string(),
            details: err.details(),
        });
        Err(err)
    }

    fn observe_view<T>(&self, result: Result<T, SourceViewError>) -> Result<T, BackupError> {
        if let Err(SourceViewError::VolumeNotMounted { source_path }) = &result {
            self.notify(BackupEvent::VolumeNotMounted {
                backup: self.config.name.clone(),
                source: source_path.clone(),
            });
        }
        result.context(SourceViewSnafu)
    }

    fn notify(&self, event: BackupEvent) {
        self.frontend.notifier.notify(event);
    }
}

fn tool_failure(phase: &'static str, err: RunnerError) -> BackupError {
    match err {
        RunnerError::Aborted => BackupError::Aborted,
        source => BackupError::ToolError { phase, source },
    }
}

/// Keeps every line for the phase log while handing it on.
struct RecordingSink<S> {
    inner: S,
    contents: Vec<u8>,
}

impl<S: LineSink> RecordingSink<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            contents: Vec::new(),
        }
    }

    fn contents(&self) -> Vec<u8> {
        self.contents.clone()
    }

    fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: LineSink> LineSink for RecordingSink<S> {
    fn on_line(&mut self, line: &str) {
        self.contents.extend_from_slice(line.as_bytes());
        self.contents.push(b'\n');
        self.inner.on_line(line);
    }

    fn on_retry(&mut self) {
        self.inner.on_retry();
    }
}

struct ProgressSink<'a> {
    parser: SyncParser<'a>,
    backup: &'a str,
    notifier: &'a Notifier,
    total: u64,
}

impl LineSink for ProgressSink<'_> {
    fn on_line(&mut self, line: &str) {
        let Some(item) = self.parser.parse_line(line) else {
            return;
        };
        if item.size == 0 {
            return;
        }
        self.notifier.notify(BackupEvent::Progress {
            backup: self.backup.to_string(),
            transferred: self.parser.tree().transfer_size(),
            total: self.total,
        });
    }
}

#[derive(Debug, Snafu)]
pub enum BackupError {
    #[snafu(display("The source is unavailable"))]
    SourceViewError { source: SourceViewError },
    #[snafu(display("The backup destination could not be updated"))]
    RemoteError { source: RemoteError },
    #[snafu(display("The backup history is damaged"))]
    LedgerError { source: LedgerError },
    #[snafu(display("The {phase} run of rclone failed"))]
    ToolError {
        phase: &'static str,
        source: RunnerError,
    },
    #[snafu(display("Could not plan the backup"))]
    ScoutError { source: ScoutError },
    #[snafu(display("Could not get a decision about large changes"))]
    DecisionError { source: DecisionError },
    #[snafu(display("Backup state machine violated"))]
    StateError { source: InvalidTransitionError },
    #[snafu(display("Could not write {path}"))]
    ArtifactError {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Could not name the new backup version"))]
    TimestampError { source: time::error::Format },
    #[snafu(display("Could not export the change tree"))]
    ExportError { source: serde_json::Error },
    #[snafu(display("Backup aborted"))]
    Aborted,
}

impl BackupError {
    /// Errors that point at a bug and must stop the scheduler.
    pub fn is_fatal(&self) -> bool {
        match self {
            BackupError::ScoutError { source } => source.is_fatal(),
            BackupError::DecisionError { source } => source.is_fatal(),
            BackupError::StateError { .. } => true,
            _ => false,
        }
    }

    /// Error messages and final statistics reported by rclone, if any.
    pub fn details(&self) -> Vec<String> {
        match self {
            BackupError::ToolError {
                source: RunnerError::ToolExit { errors, summary, .. },
                ..
            } => errors.iter().chain(summary).cloned().collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use futures::StreamExt;
    use futures_channel::mpsc::UnboundedReceiver;
    use tempfile::TempDir;
    use time::PrimitiveDateTime;
    use time::macros::datetime;

    use crate::backup::DecisionRequest;
    use crate::runner::testing::{FakeLauncher, FakeRun, Journal, RecordingBackoff};
    use crate::runner::{AbortSignal, RetryPolicy, RetryingRunner};

    use super::*;

    const MB: u64 = 1024 * 1024;
    const DESTINATION: &str = "crypt:Backup/home";
    const PREVIOUS_LOG: &str = "home_2024-03-01-000000_sync.log";
    const VIEW_TIME: PrimitiveDateTime = datetime!(2024-03-02 00:00:00);

    struct FixedView {
        root: PathBuf,
        timestamp: PrimitiveDateTime,
        journal: RefCell<Vec<&'static str>>,
    }

    impl FixedView {
        fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                timestamp: VIEW_TIME,
                journal: RefCell::new(Vec::new()),
            }
        }

        fn journal(&self) -> Vec<&'static str> {
            self.journal.borrow().clone()
        }
    }

    impl SourceView for FixedView {
        async fn latest_timestamp(&self) -> Result<PrimitiveDateTime, SourceViewError> {
            Ok(self.timestamp)
        }

        async fn acquire(&self) -> Result<SourceMount, SourceViewError> {
            self.journal.borrow_mut().push("acquire");
            Ok(SourceMount {
                root: self.root.clone(),
                timestamp: self.timestamp,
            })
        }

        async fn release(&self, _mount: SourceMount) -> Result<(), SourceViewError> {
            self.journal.borrow_mut().push("release");
            Ok(())
        }
    }

    struct MissingView;

    impl SourceView for MissingView {
        async fn latest_timestamp(&self) -> Result<PrimitiveDateTime, SourceViewError> {
            Err(SourceViewError::VolumeNotMounted {
                source_path: "/Volumes/Photos".into(),
            })
        }

        async fn acquire(&self) -> Result<SourceMount, SourceViewError> {
            Err(SourceViewError::SnapshotBusy)
        }

        async fn release(&self, _mount: SourceMount) -> Result<(), SourceViewError> {
            Ok(())
        }
    }

    fn skip_copy(object: &str, size: u64) -> String {
        format!(
            r#"{{"level":"notice","msg":"Skipped copy as --dry-run is set (size {size})","object":"{object}","objectType":"*local.Object","size":{size},"skipped":"copy","source":"operations/operations.go:2360","time":"2024-03-02T00:00:01.000000+01:00"}}"#
        )
    }

    fn copied(object: &str) -> String {
        format!(
            r#"{{"level":"info","msg":"Copied (new)","object":"{object}","objectType":"*local.Object","source":"operations/copy.go:368","time":"2024-03-02T00:00:02.000000+01:00"}}"#
        )
    }

    fn scout_lines() -> Vec<String> {
        vec![
            skip_copy("a", 2 * MB),
            skip_copy("b/c", 150 * MB),
            skip_copy("b/d", MB),
        ]
    }

    /// Answers rclone commands the way a destination with `listing` at its root would.
    fn remote_script(
        listing: &'static str,
        scout: Vec<String>,
        sync: FakeRun,
    ) -> impl Fn(&[String], usize) -> FakeRun {
        move |args, _| match args[0].as_str() {
            "lsf" => FakeRun::ok().with_stdout(listing),
            "size" => FakeRun::ok().with_stdout(r#"{"count":2,"bytes":5000}"#),
            "sync" if args.contains(&"--retries".to_string()) => {
                FakeRun::ok().with_stderr_lines(scout.clone())
            }
            "sync" => sync.clone(),
            _ => FakeRun::ok(),
        }
    }

    struct Harness {
        logs: TempDir,
        source: TempDir,
        config: BackupConfig,
        launcher: FakeLauncher,
        abort: AbortSignal,
        dry_run: bool,
    }

    impl Harness {
        fn new(launcher: FakeLauncher, threshold: Option<u64>) -> Self {
            Self {
                logs: tempfile::tempdir().unwrap(),
                source: tempfile::tempdir().unwrap(),
                config: BackupConfig {
                    name: "home".into(),
                    source: PathBuf::from("/Users/me"),
                    destination: DESTINATION.into(),
                    interval: Some(Duration::from_secs(3600)),
                    threshold,
                },
                launcher,
                abort: AbortSignal::new(),
                dry_run: false,
            }
        }

        fn task<'a, V: SourceView>(
            &'a self,
            view: &'a V,
            frontend: Frontend,
        ) -> BackupTask<'a, &'a FakeLauncher, RecordingBackoff, V> {
            let runner = RetryingRunner::with_backoff(
                &self.launcher,
                RecordingBackoff::new(Journal::default()),
                RetryPolicy::default(),
                self.abort.clone(),
            );
            let options = TaskOptions {
                logs_dir: self.logs.path().join("home"),
                exclude_file: self.logs.path().join("home.exclude"),
                bwlimit: None,
                dry_run: self.dry_run,
            };
            BackupTask::new(
                &self.config,
                options,
                RemoteStore::new(runner, DESTINATION, self.dry_run),
                view,
                frontend,
            )
        }

        fn artifact(&self, label: &str) -> String {
            let path = self.logs.path().join("home").join(label);
            std::fs::read_to_string(path).unwrap()
        }

        fn commands(&self) -> Vec<String> {
            self.launcher
                .calls()
                .iter()
                .map(|call| match call[0].as_str() {
                    "sync" if call.contains(&"--retries".to_string()) => "scout".to_string(),
                    _ => call[0].clone(),
                })
                .collect()
        }

        fn call(&self, command: &str) -> Vec<String> {
            self.launcher
                .calls()
                .into_iter()
                .rfind(|call| call[0] == command)
                .unwrap()
        }
    }

    fn frontend() -> (
        Frontend,
        UnboundedReceiver<BackupEvent>,
        UnboundedReceiver<DecisionRequest>,
    ) {
        let (notifier, events) = Notifier::channel();
        let (gate, requests) = DecisionGate::channel();
        (Frontend { notifier, gate }, events, requests)
    }

    async fn drain(events: UnboundedReceiver<BackupEvent>) -> Vec<BackupEvent> {
        events.collect().await
    }

    fn progress(events: &[BackupEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|event| match event {
                BackupEvent::Progress { transferred, .. } => Some(*transferred),
                _ => None,
            })
            .collect()
    }

    fn states(events: &[BackupEvent]) -> Vec<BackupState> {
        events
            .iter()
            .filter_map(|event| match event {
                BackupEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[compio::test]
    async fn first_backup_transfers_everything() {
        let sync = FakeRun::ok().with_stderr_lines(vec![copied("a"), copied("b/d")]);
        let scout = vec![skip_copy("a", 2 * MB), skip_copy("b/d", MB)];
        let harness = Harness::new(
            FakeLauncher::new(Journal::default(), remote_script("", scout, sync)),
            Some(100 * MB),
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, events, _requests) = frontend();

        let outcome = harness.task(&view, frontend).run(false).await.unwrap();
        assert_eq!(outcome, BackupOutcome::Performed { transferred: 3 * MB });

        assert_eq!(
            harness.commands(),
            vec!["mkdir", "lsf", "scout", "sync", "touch", "copy"]
        );
        let sync = harness.call("sync");
        assert!(!sync.contains(&"--backup-dir".to_string()));
        assert!(!sync.contains(&"--dry-run".to_string()));
        assert_eq!(sync.last().unwrap(), "crypt:Backup/home/latest");
        assert_eq!(
            harness.call("touch")[1],
            format!("crypt:Backup/home/home_2024-03-02-000000_transferred_{}", 3 * MB)
        );
        assert_eq!(harness.call("copy")[2], "home_2024-03-02-000000_*");
        assert_eq!(view.journal(), vec!["acquire", "release"]);

        assert_eq!(harness.artifact("home_2024-03-02-000000_files.txt"), "a\nb/d\n");
        assert!(harness.artifact("home_2024-03-02-000000_scout.log").contains("b/d"));
        assert!(harness.artifact("home_2024-03-02-000000_sync.log").contains("Copied"));
        let export: serde_json::Value =
            serde_json::from_str(&harness.artifact("home_2024-03-02-000000_scout.json")).unwrap();
        assert_eq!(export[3][0]["name"], "/Users/me");

        let events = drain(events).await;
        assert_eq!(progress(&events), vec![2 * MB, 3 * MB]);
        assert_eq!(
            states(&events),
            vec![
                BackupState::Preparing,
                BackupState::Syncing,
                BackupState::Finalizing,
                BackupState::Idle
            ]
        );
        assert!(events.contains(&BackupEvent::StartBackup {
            backup: "home".into(),
            total: 3 * MB
        }));
    }

    #[compio::test]
    async fn large_change_is_excluded_after_review() {
        let sync = FakeRun::ok().with_stderr_lines(vec![copied("a"), copied("b/d")]);
        let harness = Harness::new(
            FakeLauncher::new(
                Journal::default(),
                remote_script(PREVIOUS_LOG, scout_lines(), sync),
            ),
            Some(100 * MB),
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, events, mut requests) = frontend();

        let reviewer = async {
            let request = requests.next().await.unwrap();
            assert_eq!(request.total_size, 153 * MB);
            assert_eq!(
                request.large_entries,
                vec![LargeEntry {
                    path: "b/c".into(),
                    transfer_size: 150 * MB,
                    is_directory: false
                }]
            );
            request.answer(Decision::Exclude(HashSet::from(["b/c".to_string()])));
        };
        let (outcome, ()) = futures::join!(harness.task(&view, frontend).run(false), reviewer);
        assert_eq!(outcome.unwrap(), BackupOutcome::Performed { transferred: 3 * MB });

        assert_eq!(
            harness.commands(),
            vec!["mkdir", "lsf", "scout", "sync", "touch", "move", "size", "touch", "copy"]
        );
        let sync = harness.call("sync");
        let backup_dir = sync.iter().position(|arg| arg == "--backup-dir").unwrap();
        assert_eq!(sync[backup_dir + 1], "crypt:Backup/home/2024-03-01-000000");
        assert_eq!(
            harness.call("move")[1..],
            [
                "--include",
                "/home_2024-03-01-000000_*",
                "crypt:Backup/home",
                "crypt:Backup/home/2024-03-01-000000"
            ]
        );
        assert_eq!(
            harness.call("touch")[1],
            "crypt:Backup/home/2024-03-01-000000/home_2024-03-01-000000_size_5000"
        );
        assert_eq!(harness.artifact("home_2024-03-02-000000_files.txt"), "a\nb/d\n");
        assert_eq!(
            harness.artifact("home_2024-03-02-000000_large.log"),
            "  150.00 MB   b/c\n"
        );

        let events = drain(events).await;
        assert!(events.contains(&BackupEvent::StartBackup {
            backup: "home".into(),
            total: 3 * MB
        }));
        assert!(states(&events).contains(&BackupState::AwaitingDecision));
    }

    #[compio::test]
    async fn operator_can_skip_the_backup() {
        let harness = Harness::new(
            FakeLauncher::new(
                Journal::default(),
                remote_script("", scout_lines(), FakeRun::ok()),
            ),
            Some(100 * MB),
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, events, mut requests) = frontend();

        let reviewer = async {
            requests.next().await.unwrap().answer(Decision::Skip);
        };
        let (outcome, ()) = futures::join!(harness.task(&view, frontend).run(false), reviewer);
        assert_eq!(
            outcome.unwrap(),
            BackupOutcome::Skipped(SkipReason::OperatorSkipped)
        );
        assert_eq!(harness.commands(), vec!["mkdir", "lsf", "scout"]);
        assert_eq!(view.journal(), vec!["acquire", "release"]);
        let events = drain(events).await;
        assert!(progress(&events).is_empty());
        assert_eq!(states(&events).last(), Some(&BackupState::Idle));
    }

    #[compio::test]
    async fn recent_backup_is_not_repeated() {
        let harness = Harness::new(
            FakeLauncher::new(
                Journal::default(),
                remote_script("home_2024-03-01-233000_sync.log", vec![], FakeRun::ok()),
            ),
            None,
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, _events, _requests) = frontend();

        let outcome = harness.task(&view, frontend).run(false).await.unwrap();
        assert!(matches!(
            outcome,
            BackupOutcome::Skipped(SkipReason::TooRecent { .. })
        ));
        assert!(view.journal().is_empty());
    }

    #[compio::test]
    async fn forced_backup_of_same_view_notifies() {
        let harness = Harness::new(
            FakeLauncher::new(
                Journal::default(),
                remote_script("home_2024-03-02-000000_sync.log", vec![], FakeRun::ok()),
            ),
            None,
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, events, _requests) = frontend();

        let outcome = harness.task(&view, frontend).run(true).await.unwrap();
        assert_eq!(
            outcome,
            BackupOutcome::Skipped(SkipReason::AlreadyBackedUp {
                timestamp: VIEW_TIME
            })
        );
        assert_eq!(
            drain(events).await,
            vec![BackupEvent::AlreadyBackedUp {
                backup: "home".into(),
                timestamp: VIEW_TIME
            }]
        );
    }

    #[compio::test]
    async fn manual_backup_is_left_alone_by_the_scheduler() {
        let mut harness = Harness::new(
            FakeLauncher::new(Journal::default(), |_, _| FakeRun::ok()),
            None,
        );
        harness.config.interval = None;
        let view = FixedView::new(harness.source.path());
        let (frontend, _events, _requests) = frontend();

        let outcome = harness.task(&view, frontend).run(false).await.unwrap();
        assert_eq!(outcome, BackupOutcome::Skipped(SkipReason::ManualOnly));
        assert!(harness.launcher.calls().is_empty());
    }

    #[compio::test]
    async fn failed_sync_leaves_the_remote_untouched() {
        let sync = FakeRun::failing(
            7,
            [r#"{"level":"error","msg":"account suspended"}"#],
        )
        .with_stderr([r#"{"level":"notice","msg":"Errors: 1 (fatal)"}"#]);
        let harness = Harness::new(
            FakeLauncher::new(Journal::default(), remote_script("", scout_lines(), sync)),
            None,
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, events, _requests) = frontend();

        let err = harness.task(&view, frontend).run(false).await.unwrap_err();
        assert!(matches!(err, BackupError::ToolError { phase: "sync", .. }));
        assert!(!err.is_fatal());
        assert!(err.details().contains(&"account suspended".to_string()));
        assert_eq!(harness.commands(), vec!["mkdir", "lsf", "scout", "sync"]);
        assert_eq!(view.journal(), vec!["acquire", "release"]);
        assert!(harness.artifact("home_2024-03-02-000000_sync.log").contains("suspended"));

        let events = drain(events).await;
        let states = states(&events);
        assert_eq!(&states[states.len() - 2..], [BackupState::Aborted, BackupState::Idle]);
        assert!(matches!(events.last(), Some(BackupEvent::Failed { .. })));
    }

    #[compio::test]
    async fn abort_while_waiting_for_decision() {
        let harness = Harness::new(
            FakeLauncher::new(
                Journal::default(),
                remote_script("", scout_lines(), FakeRun::ok()),
            ),
            Some(100 * MB),
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, _events, mut requests) = frontend();

        let quitter = async {
            let _request = requests.next().await.unwrap();
            harness.abort.abort();
        };
        let (outcome, ()) = futures::join!(harness.task(&view, frontend).run(false), quitter);
        assert!(matches!(outcome, Err(BackupError::Aborted)));
        assert_eq!(harness.commands(), vec!["mkdir", "lsf", "scout"]);
        assert_eq!(view.journal(), vec!["acquire", "release"]);
    }

    #[compio::test]
    async fn contradicting_scout_log_is_fatal() {
        let scout = vec![skip_copy("a", 1), skip_copy("a", 1)];
        let harness = Harness::new(
            FakeLauncher::new(Journal::default(), remote_script("", scout, FakeRun::ok())),
            None,
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, _events, _requests) = frontend();

        let err = harness.task(&view, frontend).run(false).await.unwrap_err();
        assert!(matches!(err, BackupError::ScoutError { .. }));
        assert!(err.is_fatal());
        assert_eq!(view.journal(), vec!["acquire", "release"]);
    }

    #[compio::test]
    async fn unmounted_source_is_reported() {
        let harness = Harness::new(
            FakeLauncher::new(Journal::default(), |_, _| FakeRun::ok()),
            None,
        );
        let (frontend, events, _requests) = frontend();

        let err = harness.task(&MissingView, frontend).run(true).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::SourceViewError {
                source: SourceViewError::VolumeNotMounted { .. }
            }
        ));
        assert!(matches!(
            drain(events).await.as_slice(),
            [BackupEvent::VolumeNotMounted { .. }]
        ));
    }

    #[compio::test]
    async fn dry_run_counts_skipped_copies_without_touching_the_remote() {
        let sync = FakeRun::ok().with_stderr_lines(vec![skip_copy("a", 2 * MB)]);
        let scout = vec![skip_copy("a", 2 * MB)];
        let mut harness = Harness::new(
            FakeLauncher::new(Journal::default(), remote_script(PREVIOUS_LOG, scout, sync)),
            None,
        );
        harness.dry_run = true;
        let view = FixedView::new(harness.source.path());
        let (frontend, _events, _requests) = frontend();

        let outcome = harness.task(&view, frontend).run(false).await.unwrap();
        assert_eq!(outcome, BackupOutcome::Performed { transferred: 2 * MB });
        assert_eq!(harness.commands(), vec!["mkdir", "lsf", "scout", "sync"]);
        assert!(harness.call("sync").contains(&"--dry-run".to_string()));
    }

    #[compio::test]
    async fn nothing_pending_means_nothing_transferred() {
        let harness = Harness::new(
            FakeLauncher::new(Journal::default(), remote_script("", vec![], FakeRun::ok())),
            None,
        );
        let view = FixedView::new(harness.source.path());
        let (frontend, _events, _requests) = frontend();

        let outcome = harness.task(&view, frontend).run(false).await.unwrap();
        assert_eq!(
            outcome,
            BackupOutcome::Skipped(SkipReason::NothingToTransfer)
        );
        assert_eq!(harness.commands(), vec!["mkdir", "lsf", "scout"]);
    }
}
