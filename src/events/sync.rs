use tracing::{debug, error, warn};

use crate::events::LogRecord;
use crate::filesystem::{Action, ChangeTree, LINK_SUFFIX, Metadata, TreeError};

/// A transfer the sync tool reported as done, with its size resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedItem {
    pub path: String,
    pub size: u64,
}

/// Follows the log of the real sync and correlates completed transfers with the scout tree.
#[derive(Debug)]
pub struct SyncParser<'a> {
    scout: &'a ChangeTree,
    tree: ChangeTree,
    dry_run: bool,
    errors: Vec<String>,
}

impl<'a> SyncParser<'a> {
    /// In dry-run mode nothing is copied; sizes come from the tool's skip records instead.
    pub fn new(scout: &'a ChangeTree, dry_run: bool) -> Self {
        SyncParser {
            scout,
            tree: ChangeTree::new(),
            dry_run,
            errors: Vec::new(),
        }
    }

    /// Transfers seen so far.
    pub fn tree(&self) -> &ChangeTree {
        &self.tree
    }

    /// Messages of the error-level records seen so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn parse_line(&mut self, line: &str) -> Option<SyncedItem> {
        let record = match LogRecord::parse(line) {
            Ok(record) => record,
            Err(err) => {
                debug!("Passing through unparseable sync line ({err}): {line}");
                return None;
            }
        };

        let Some(size) = self.resolve_size(&record) else {
            if record.is_error() {
                error!("{}", record.msg);
                self.errors.push(record.msg);
            }
            return None;
        };
        let object = record.object.as_deref()?;
        match self.tree.insert(object, size, Action::Copy, Metadata::new()) {
            Ok(()) => Some(SyncedItem {
                path: object.strip_suffix(LINK_SUFFIX).unwrap_or(object).to_string(),
                size,
            }),
            Err(TreeError::DuplicateInsertion { path }) => {
                debug!("Transfer of '{path}' was already counted");
                None
            }
            Err(err) => {
                warn!("Cannot record transfer of '{object}': {err}");
                None
            }
        }
    }

    fn resolve_size(&self, record: &LogRecord) -> Option<u64> {
        if record.is_copy_completion() {
            let object = record.object.as_deref()?;
            let path = object.strip_suffix(LINK_SUFFIX).unwrap_or(object);
            match self.scout.lookup(path) {
                Ok(entry) => Some(entry.size()),
                Err(err) => {
                    warn!("Copied '{object}' was not planned by the scout: {err}");
                    None
                }
            }
        } else if self.dry_run && record.skipped.as_deref() == Some("copy") {
            record.size_bytes()
        } else {
            None
        }
    }
}
