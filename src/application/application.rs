use std::sync::Arc;

use compio::runtime::spawn;
use snafu::Snafu;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::application::RuntimeConfig;
use crate::application::data::OnLarge;
use crate::backup::{DecisionGate, Frontend, Notifier, RemoteError};
use crate::cli::{Cli, Command};
use crate::config::{BackupConfig, BackupRegistry, BackupRegistryCreationError};
use crate::frontend::Console;
use crate::runner::AbortSignal;
use crate::scheduler::{RcloneBackups, Scheduler, SchedulerError, SchedulerHandle};

pub struct Application;

impl Application {
    pub async fn run(cli: Cli) -> Result<(), ApplicationError> {
        let runtime = RuntimeConfig::from(&cli);
        let registry = BackupRegistry::read(&runtime.root)
            .await
            .context(BackupRegistrySnafu)?;
        debug!("Loaded config: {:?}", registry);

        let registry = Arc::new(registry);
        let runtime = Arc::new(runtime);
        let abort = AbortSignal::new();
        Self::abort_on_interrupt(abort.clone());

        match cli.command {
            Command::Run { on_large } => {
                Self::run_scheduler(registry, runtime, abort, on_large).await
            }
            Command::Backup { name, on_large } => {
                Self::run_backup(registry, runtime, abort, &name, on_large).await
            }
            Command::List { name } => Self::list_versions(registry, runtime, abort, &name).await,
            Command::History { name, count } => {
                Self::show_history(registry, runtime, abort, &name, count).await
            }
        }
    }

    fn abort_on_interrupt(abort: AbortSignal) {
        spawn(async move {
            match compio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupted, stopping the running backup");
                    abort.abort();
                }
                Err(e) => debug!("Cannot listen for Ctrl-C: {e}"),
            }
        })
        .detach();
    }

    async fn run_scheduler(
        registry: Arc<BackupRegistry>,
        runtime: Arc<RuntimeConfig>,
        abort: AbortSignal,
        on_large: OnLarge,
    ) -> Result<(), ApplicationError> {
        let (notifier, events) = Notifier::channel();
        let (gate, requests) = DecisionGate::channel();
        let handle = SchedulerHandle::spawn(registry, runtime, Frontend { notifier, gate }, abort)
            .context(SchedulerSnafu)?;
        info!("Scheduler started");

        let console = Console::new(on_large);
        let (result, ()) = futures::join!(handle.join(), console.serve(events, requests));
        result.context(SchedulerSnafu)
    }

    async fn run_backup(
        registry: Arc<BackupRegistry>,
        runtime: Arc<RuntimeConfig>,
        abort: AbortSignal,
        name: &str,
        on_large: OnLarge,
    ) -> Result<(), ApplicationError> {
        let (notifier, events) = Notifier::channel();
        let (gate, requests) = DecisionGate::channel();
        let backups = RcloneBackups::new(
            registry.clone(),
            runtime,
            Frontend { notifier, gate },
            abort.clone(),
        );
        let scheduler = Scheduler::new(registry, backups, abort);

        let console = Console::new(on_large);
        let backup = async move {
            let outcome = scheduler.run_one(name).await;
            drop(scheduler);
            outcome
        };
        let (outcome, ()) = futures::join!(backup, console.serve(events, requests));
        let outcome = outcome.context(SchedulerSnafu)?;
        console.print_outcome(name, &outcome);
        Ok(())
    }

    async fn list_versions(
        registry: Arc<BackupRegistry>,
        runtime: Arc<RuntimeConfig>,
        abort: AbortSignal,
        name: &str,
    ) -> Result<(), ApplicationError> {
        let backup = Self::find_backup(&registry, name)?;
        let remote = Self::housekeeping(&registry, runtime, abort).remote(backup);
        let sizes = remote.version_sizes(name).await.context(RemoteSnafu)?;
        Console::print_version_sizes(remote.destination(), &sizes);
        Ok(())
    }

    async fn show_history(
        registry: Arc<BackupRegistry>,
        runtime: Arc<RuntimeConfig>,
        abort: AbortSignal,
        name: &str,
        count: usize,
    ) -> Result<(), ApplicationError> {
        let backup = Self::find_backup(&registry, name)?;
        let remote = Self::housekeeping(&registry, runtime, abort).remote(backup);
        let history = remote
            .transferred_history(name, count)
            .await
            .context(RemoteSnafu)?;
        Console::print_history(remote.destination(), &history);
        Ok(())
    }

    fn find_backup<'r>(
        registry: &'r BackupRegistry,
        name: &str,
    ) -> Result<&'r BackupConfig, ApplicationError> {
        registry
            .get_backup_by_name(name)
            .with_context(|| UnknownBackupSnafu {
                name,
                configured: registry.backup_names().join(", "),
            })
    }

    /// Backups for read-only commands; nobody listens to their notifications.
    fn housekeeping(
        registry: &Arc<BackupRegistry>,
        runtime: Arc<RuntimeConfig>,
        abort: AbortSignal,
    ) -> RcloneBackups {
        let (notifier, _) = Notifier::channel();
        let (gate, _) = DecisionGate::channel();
        RcloneBackups::new(registry.clone(), runtime, Frontend { notifier, gate }, abort)
    }
}

#[derive(Debug, Snafu)]
pub enum ApplicationError {
    #[snafu(display("Critical failure encountered during configuration stage"))]
    BackupRegistryError { source: BackupRegistryCreationError },
    #[snafu(display("No backup named '{}' is configured (known: {})", name, configured))]
    UnknownBackupError { name: String, configured: String },
    #[snafu(display("Critical failure encountered while running backups"))]
    SchedulerError { source: SchedulerError },
    #[snafu(display("Could not read the backup history"))]
    RemoteError { source: RemoteError },
}
