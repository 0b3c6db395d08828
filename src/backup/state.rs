use derive_more::Display;
use snafu::Snafu;

/// Phase of a single backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum BackupState {
    #[default]
    #[display("idle")]
    Idle,
    #[display("preparing")]
    Preparing,
    #[display("awaiting decision")]
    AwaitingDecision,
    #[display("syncing")]
    Syncing,
    #[display("finalizing")]
    Finalizing,
    #[display("aborted")]
    Aborted,
}

impl BackupState {
    pub fn can_transition_to(self, next: BackupState) -> bool {
        use BackupState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, AwaitingDecision)
                | (Preparing, Syncing)
                | (Preparing, Finalizing)
                | (AwaitingDecision, Syncing)
                | (AwaitingDecision, Finalizing)
                | (Syncing, Finalizing)
                | (Finalizing, Idle)
                | (Preparing, Aborted)
                | (AwaitingDecision, Aborted)
                | (Syncing, Aborted)
                | (Aborted, Idle)
        )
    }

    pub fn transition(&mut self, next: BackupState) -> Result<(), InvalidTransitionError> {
        if !self.can_transition_to(next) {
            return InvalidTransitionSnafu { from: *self, to: next }.fail();
        }
        *self = next;
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Backup cannot go from {from} to {to}"))]
pub struct InvalidTransitionError {
    from: BackupState,
    to: BackupState,
}
