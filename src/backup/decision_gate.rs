use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures_channel::oneshot;
use snafu::Snafu;
use tracing::debug;

use crate::filesystem::Entry;

/// A change above the review threshold, as presented to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeEntry {
    pub path: String,
    pub transfer_size: u64,
    pub is_directory: bool,
}

impl From<&Entry> for LargeEntry {
    fn from(entry: &Entry) -> Self {
        LargeEntry {
            path: entry.path().to_string(),
            transfer_size: entry.transfer_size(),
            is_directory: entry.is_directory(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Go ahead without these paths. An empty set transfers everything.
    Exclude(HashSet<String>),
    Skip,
}

/// Question posted by a backup run, answered exactly once.
#[derive(Debug)]
pub struct DecisionRequest {
    pub backup: String,
    pub total_size: u64,
    pub large_entries: Vec<LargeEntry>,
    reply: oneshot::Sender<Decision>,
}

impl DecisionRequest {
    pub fn answer(self, decision: Decision) {
        if self.reply.send(decision).is_err() {
            debug!("Backup '{}' stopped waiting for a decision", self.backup);
        }
    }
}

/// Hands large-change reviews from the backup worker to a decision maker, one at a time.
#[derive(Debug, Clone)]
pub struct DecisionGate {
    requests: UnboundedSender<DecisionRequest>,
    pending: Arc<AtomicBool>,
}

impl DecisionGate {
    pub fn channel() -> (Self, UnboundedReceiver<DecisionRequest>) {
        let (requests, receiver) = mpsc::unbounded();
        let gate = DecisionGate {
            requests,
            pending: Arc::new(AtomicBool::new(false)),
        };
        (gate, receiver)
    }

    /// Posts the request and waits for the answer.
    pub async fn decide(
        &self,
        backup: &str,
        total_size: u64,
        large_entries: Vec<LargeEntry>,
    ) -> Result<Decision, DecisionError> {
        if self.pending.swap(true, Ordering::SeqCst) {
            return DoubleRequestSnafu { backup }.fail();
        }
        let _pending = PendingSlot(&self.pending);

        let (reply, answer) = oneshot::channel();
        let request = DecisionRequest {
            backup: backup.to_string(),
            total_size,
            large_entries,
            reply,
        };
        if self.requests.unbounded_send(request).is_err() {
            return AbandonedSnafu { backup }.fail();
        }
        match answer.await {
            Ok(decision) => Ok(decision),
            Err(oneshot::Canceled) => AbandonedSnafu { backup }.fail(),
        }
    }
}

/// Frees the slot however the wait ends, including when the waiting future is dropped.
struct PendingSlot<'a>(&'a AtomicBool);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Snafu)]
pub enum DecisionError {
    #[snafu(display("Backup '{backup}' asked for a decision while another one is pending"))]
    DoubleRequest { backup: String },
    #[snafu(display("Nobody answered the decision request of backup '{backup}'"))]
    Abandoned { backup: String },
}

impl DecisionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecisionError::DoubleRequest { .. })
    }
}
