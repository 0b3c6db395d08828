use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use time::PrimitiveDateTime;
use tracing::debug;

use crate::backup::BackupState;

/// One-way status updates for whoever presents backups to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEvent {
    StateChanged {
        backup: String,
        state: BackupState,
    },
    StartBackup {
        backup: String,
        total: u64,
    },
    /// `transferred` grows strictly within a run.
    Progress {
        backup: String,
        transferred: u64,
        total: u64,
    },
    AlreadyBackedUp {
        backup: String,
        timestamp: PrimitiveDateTime,
    },
    VolumeNotMounted {
        backup: String,
        source: String,
    },
    Failed {
        backup: String,
        message: String,
        details: Vec<String>,
    },
    Finished {
        backup: String,
        transferred: u64,
    },
}

/// Sending half of the notification channel. Sending never blocks and never fails; updates for
/// a front end that went away are dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: UnboundedSender<BackupEvent>,
}

impl Notifier {
    pub fn channel() -> (Self, UnboundedReceiver<BackupEvent>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }

    pub fn notify(&self, event: BackupEvent) {
        if let Err(err) = self.sender.unbounded_send(event) {
            debug!("Dropping notification, nobody is listening: {:?}", err.into_inner());
        }
    }
}
