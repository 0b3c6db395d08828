use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::Arc;

use compio::dispatcher::{Dispatcher, DispatcherBuilder};
use futures::future::{self, Either};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, error, info};

use crate::application::RuntimeConfig;
use crate::backup::{
    BackupError, BackupOutcome, BackupTask, Frontend, PlainSourceView, RemoteStore, TaskOptions,
};
use crate::config::{BackupConfig, BackupRegistry};
use crate::runner::{AbortSignal, ProcessLauncher, RetryingRunner};

/// Runs one backup to completion.
pub trait BackupRunner {
    async fn run_backup(
        &self,
        backup: &BackupConfig,
        force: bool,
    ) -> Result<BackupOutcome, BackupError>;
}

/// Backs up the live source directories with rclone.
#[derive(Debug, Clone)]
pub struct RcloneBackups {
    registry: Arc<BackupRegistry>,
    runtime: Arc<RuntimeConfig>,
    frontend: Frontend,
    abort: AbortSignal,
}

impl RcloneBackups {
    pub fn new(
        registry: Arc<BackupRegistry>,
        runtime: Arc<RuntimeConfig>,
        frontend: Frontend,
        abort: AbortSignal,
    ) -> Self {
        Self {
            registry,
            runtime,
            frontend,
            abort,
        }
    }

    pub fn remote(&self, backup: &BackupConfig) -> RemoteStore<ProcessLauncher> {
        let settings = self.registry.settings();
        let runner = RetryingRunner::new(
            ProcessLauncher::new(&settings.rclone),
            settings.retry.clone(),
            self.abort.clone(),
        );
        RemoteStore::new(runner, backup.destination.as_str(), self.runtime.dry_run)
    }
}

impl BackupRunner for RcloneBackups {
    async fn run_backup(
        &self,
        backup: &BackupConfig,
        force: bool,
    ) -> Result<BackupOutcome, BackupError> {
        let view = PlainSourceView::new(&backup.source);
        let options = TaskOptions {
            logs_dir: self.runtime.logs_dir(&backup.name),
            exclude_file: self.runtime.exclude_file(&backup.name),
            bwlimit: self.registry.settings().bwlimit.clone(),
            dry_run: self.runtime.dry_run,
        };
        BackupTask::new(backup, options, self.remote(backup), &view, self.frontend.clone())
            .run(force)
            .await
    }
}

/// Walks the configured backups once per tick.
pub struct Scheduler<R> {
    registry: Arc<BackupRegistry>,
    runner: R,
    abort: AbortSignal,
}

impl<R: BackupRunner> Scheduler<R> {
    pub fn new(registry: Arc<BackupRegistry>, runner: R, abort: AbortSignal) -> Self {
        Self {
            registry,
            runner,
            abort,
        }
    }

    /// Tries every backup in configuration order and stops after the first one that
    /// transferred data. Returns the name of that backup.
    pub async fn run_pass(&self) -> Result<Option<String>, SchedulerError> {
        for backup in self.registry.get_backups_iter() {
            if self.abort.is_aborted() {
                break;
            }
            debug!("Checking backup '{}'", backup.name);
            match self.runner.run_backup(backup, false).await {
                Ok(outcome) if outcome.is_performed() => {
                    info!("Backup '{}' finished: {outcome:?}", backup.name);
                    return Ok(Some(backup.name.clone()));
                }
                Ok(outcome) => debug!("Backup '{}': {outcome:?}", backup.name),
                Err(BackupError::Aborted) => {
                    info!("Backup '{}' was aborted", backup.name);
                    break;
                }
                Err(err) if err.is_fatal() => {
                    return Err(err).context(FatalSnafu {
                        backup: backup.name.as_str(),
                    });
                }
                Err(err) => {
                    error!("Backup '{}' failed: {}", backup.name, snafu::Report::from_error(&err));
                }
            }
        }
        Ok(None)
    }

    /// Forced run of a single backup.
    pub async fn run_one(&self, name: &str) -> Result<BackupOutcome, SchedulerError> {
        let backup = self
            .registry
            .get_backup_by_name(name)
            .context(UnknownBackupSnafu { name })?;
        self.runner
            .run_backup(backup, true)
            .await
            .context(BackupSnafu { backup: name })
    }

    /// Passes until aborted, sleeping one tick in between.
    pub async fn run_loop(&self) -> Result<(), SchedulerError> {
        let tick = self.registry.settings().tick;
        while !self.abort.is_aborted() {
            self.run_pass().await?;
            let sleep = pin!(compio::time::sleep(tick));
            if let Either::Right(_) = future::select(sleep, pin!(self.abort.aborted())).await {
                break;
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

/// The scheduler running on its own worker thread.
pub struct SchedulerHandle {
    _dispatcher: Dispatcher,
    finished: futures_channel::oneshot::Receiver<Result<(), SchedulerError>>,
}

impl SchedulerHandle {
    /// Starts the scheduler loop on a dedicated worker.
    pub fn spawn(
        registry: Arc<BackupRegistry>,
        runtime: Arc<RuntimeConfig>,
        frontend: Frontend,
        abort: AbortSignal,
    ) -> Result<Self, SchedulerError> {
        let dispatcher = DispatcherBuilder::new()
            .worker_threads(NonZeroUsize::MIN)
            .build()
            .context(DispatcherSnafu)?;
        let finished = dispatcher
            .dispatch(move || async move {
                let backups =
                    RcloneBackups::new(registry.clone(), runtime, frontend, abort.clone());
                Scheduler::new(registry, backups, abort).run_loop().await
            })
            .map_err(|e| SchedulerError::DispatchError {
                error: e.to_string(),
            })?;
        Ok(Self {
            _dispatcher: dispatcher,
            finished,
        })
    }

    pub async fn join(self) -> Result<(), SchedulerError> {
        match self.finished.await {
            Ok(result) => result,
            Err(source) => Err(SchedulerError::CanceledError { source }),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum SchedulerError {
    #[snafu(display("Failed to create the scheduler worker"))]
    DispatcherError { source: std::io::Error },
    #[snafu(display("Failed to start the scheduler: {}", error))]
    DispatchError { error: String },
    #[snafu(display("The scheduler worker went away"))]
    CanceledError {
        source: futures_channel::oneshot::Canceled,
    },
    #[snafu(display("No backup named '{}' is configured", name))]
    UnknownBackup { name: String },
    #[snafu(display("Backup '{}' failed", backup))]
    BackupError { backup: String, source: BackupError },
    #[snafu(display("Backup '{}' hit an unrecoverable error", backup))]
    FatalError { backup: String, source: BackupError },
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use crate::backup::{DecisionError, SourceViewError};
    use crate::scheduler::SkipReason;

    use super::*;

    type Script = Box<dyn Fn(&str) -> Result<BackupOutcome, BackupError>>;

    /// Answers from a script keyed by backup name and records who ran.
    struct ScriptedRunner {
        script: Script,
        ran: RefCell<Vec<(String, bool)>>,
        abort_after: Option<&'static str>,
        abort: AbortSignal,
    }

    impl ScriptedRunner {
        fn new(script: impl Fn(&str) -> Result<BackupOutcome, BackupError> + 'static) -> Self {
            Self {
                script: Box::new(script),
                ran: RefCell::new(Vec::new()),
                abort_after: None,
                abort: AbortSignal::new(),
            }
        }

        fn ran(&self) -> Vec<String> {
            self.ran.borrow().iter().map(|(name, _)| name.clone()).collect()
        }
    }

    impl BackupRunner for &ScriptedRunner {
        async fn run_backup(
            &self,
            backup: &BackupConfig,
            force: bool,
        ) -> Result<BackupOutcome, BackupError> {
            self.ran.borrow_mut().push((backup.name.clone(), force));
            if self.abort_after == Some(backup.name.as_str()) {
                self.abort.abort();
            }
            (self.script)(backup.name.as_str())
        }
    }

    fn registry() -> Arc<BackupRegistry> {
        let contents = r#"
tick_minutes: 1
backups:
  home:
    source: /home/me
    destination: "remote:home"
    interval_minutes: 60
  photos:
    source: /photos
    destination: "remote:photos"
    interval_minutes: 60
  music:
    source: /music
    destination: "remote:music"
"#;
        Arc::new(contents.try_into().unwrap())
    }

    fn skipped() -> Result<BackupOutcome, BackupError> {
        Ok(BackupOutcome::Skipped(SkipReason::NothingToTransfer))
    }

    fn performed() -> Result<BackupOutcome, BackupError> {
        Ok(BackupOutcome::Performed { transferred: 10 })
    }

    #[compio::test]
    async fn pass_stops_after_the_first_performed_backup() {
        let runner = ScriptedRunner::new(|name| match name {
            "home" => skipped(),
            _ => performed(),
        });
        let scheduler = Scheduler::new(registry(), &runner, AbortSignal::new());
        assert_eq!(scheduler.run_pass().await.unwrap().as_deref(), Some("photos"));
        assert_eq!(runner.ran(), vec!["home", "photos"]);
        assert!(runner.ran.borrow().iter().all(|(_, force)| !force));
    }

    #[compio::test]
    async fn recoverable_failure_does_not_stop_the_pass() {
        let runner = ScriptedRunner::new(|name| match name {
            "photos" => Err(BackupError::SourceViewError {
                source: SourceViewError::VolumeNotMounted {
                    source_path: "/photos".into(),
                },
            }),
            _ => skipped(),
        });
        let scheduler = Scheduler::new(registry(), &runner, AbortSignal::new());
        assert_eq!(scheduler.run_pass().await.unwrap(), None);
        assert_eq!(runner.ran(), vec!["home", "photos", "music"]);
    }

    #[compio::test]
    async fn fatal_failure_ends_the_pass_with_an_error() {
        let runner = ScriptedRunner::new(|name| match name {
            "home" => Err(BackupError::DecisionError {
                source: DecisionError::DoubleRequest {
                    backup: "home".into(),
                },
            }),
            _ => performed(),
        });
        let scheduler = Scheduler::new(registry(), &runner, AbortSignal::new());
        let err = scheduler.run_pass().await.unwrap_err();
        assert!(matches!(err, SchedulerError::FatalError { ref backup, .. } if backup == "home"));
        assert_eq!(runner.ran(), vec!["home"]);
    }

    #[compio::test]
    async fn aborted_backup_ends_the_pass() {
        let runner = ScriptedRunner::new(|name| match name {
            "home" => Err(BackupError::Aborted),
            _ => performed(),
        });
        let scheduler = Scheduler::new(registry(), &runner, AbortSignal::new());
        assert_eq!(scheduler.run_pass().await.unwrap(), None);
        assert_eq!(runner.ran(), vec!["home"]);
    }

    #[compio::test]
    async fn single_backup_is_forced() {
        let runner = ScriptedRunner::new(|name| match name {
            "music" => performed(),
            _ => skipped(),
        });
        let scheduler = Scheduler::new(registry(), &runner, AbortSignal::new());
        let outcome = scheduler.run_one("music").await.unwrap();
        assert!(outcome.is_performed());
        assert_eq!(*runner.ran.borrow(), vec![("music".to_string(), true)]);
    }

    #[compio::test]
    async fn unknown_backup_is_rejected() {
        let runner = ScriptedRunner::new(|_| skipped());
        let scheduler = Scheduler::new(registry(), &runner, AbortSignal::new());
        assert!(matches!(
            scheduler.run_one("videos").await,
            Err(SchedulerError::UnknownBackup { .. })
        ));
        assert!(runner.ran().is_empty());
    }

    #[compio::test]
    async fn loop_ends_when_aborted() {
        let mut runner = ScriptedRunner::new(|_| skipped());
        runner.abort_after = Some("photos");
        let scheduler = Scheduler::new(registry(), &runner, runner.abort.clone());
        compio::time::timeout(Duration::from_secs(5), scheduler.run_loop())
            .await
            .expect("loop should stop without waiting for the tick")
            .unwrap();
        assert_eq!(runner.ran(), vec!["home", "photos"]);
    }
}
