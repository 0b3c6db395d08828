//! One backup run, from planning against a source view to recording what was transferred.

mod decision_gate;
pub mod ledger;
mod notifier;
mod remote;
mod source_view;
mod state;
mod task;

pub use decision_gate::{Decision, DecisionError, DecisionGate, DecisionRequest, LargeEntry};
pub use notifier::{BackupEvent, Notifier};
pub use remote::{RemoteError, RemoteStore};
pub use source_view::{PlainSourceView, SourceMount, SourceView, SourceViewError};
pub use state::{BackupState, InvalidTransitionError};
pub use task::{BackupError, BackupOutcome, BackupTask, Frontend, TaskOptions};
