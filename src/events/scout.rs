use snafu::Snafu;
use tracing::{debug, warn};

use crate::events::{LineSink, LogRecord};
use crate::filesystem::{
    Action, ChangeTree, DESTINATION_KEY, Metadata, SOURCE_KEY, TreeError,
};

/// Builds the change tree from the log of a dry-run sync.
#[derive(Debug, Default)]
pub struct ScoutParser {
    tree: ChangeTree,
    finished: bool,
    failure: Option<TreeError>,
}

impl ScoutParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str) -> Result<(), TreeError> {
        if self.finished {
            return Ok(());
        }
        let record = match LogRecord::parse(line) {
            Ok(record) => record,
            Err(err) => {
                debug!("Passing through unparseable scout line ({err}): {line}");
                return Ok(());
            }
        };

        if let Some(skipped) = record.skipped.as_deref() {
            let action = Action::from_skipped(skipped);
            if action == Action::RemoveDirectory {
                debug!("Reached directory removal, nothing further to plan");
                self.finished = true;
                return Ok(());
            }
            let Some(object) = record.object.as_deref() else {
                warn!("Ignoring '{skipped}' record without an object: {line}");
                return Ok(());
            };
            let size = record.size_bytes().unwrap_or_default();
            self.tree.insert(object, size, action, Metadata::new())?;
        } else if let Some(source) = record.renamed_from() {
            let Some(destination) = record.object.as_deref() else {
                warn!("Ignoring rename record without an object: {line}");
                return Ok(());
            };
            let metadata = Metadata::from([(SOURCE_KEY.to_string(), source.to_string())]);
            self.tree.insert(destination, 0, Action::MoveDest, metadata)?;
            if let Err(err) = self.tree.annotate(source, DESTINATION_KEY, destination) {
                warn!("Rename of '{source}' to '{destination}' has no source entry: {err}");
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<ChangeTree, ScoutError> {
        match self.failure {
            Some(source) => Err(ScoutError::InvalidEvent { source }),
            None => Ok(self.tree),
        }
    }
}

impl LineSink for ScoutParser {
    fn on_line(&mut self, line: &str) {
        if self.failure.is_some() {
            return;
        }
        if let Err(err) = self.parse_line(line) {
            self.failure = Some(err);
        }
    }

    fn on_retry(&mut self) {
        debug!("Discarding partial scout tree before retrying");
        *self = Self::new();
    }
}

/// Parses a complete scout log in one go.
#[cfg(test)]
pub fn parse_scout_log<I>(lines: I) -> Result<ChangeTree, ScoutError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut parser = ScoutParser::new();
    for line in lines {
        parser
            .parse_line(line.as_ref())
            .map_err(|source| ScoutError::InvalidEvent { source })?;
    }
    parser.finish()
}

#[derive(Debug, Snafu)]
pub enum ScoutError {
    #[snafu(display("The scout log contradicts itself"))]
    InvalidEvent { source: TreeError },
}

impl ScoutError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ScoutError::InvalidEvent { source } => source.is_fatal(),
        }
    }
}
