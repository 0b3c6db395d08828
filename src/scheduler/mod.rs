//! Deciding which backups are due and running them one at a time.

mod policy;
mod scheduler;

pub use policy::{SkipReason, Verdict, decide};
pub use scheduler::{RcloneBackups, Scheduler, SchedulerError, SchedulerHandle};
