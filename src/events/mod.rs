//! Parsers for the line-oriented JSON event stream the sync tool writes while it works.

mod log_record;
mod scout;
mod sync;

pub use log_record::LogRecord;
pub use scout::{ScoutError, ScoutParser};
#[cfg(test)]
pub use scout::parse_scout_log;
pub use sync::SyncParser;

/// Consumer of the tool's log lines, fed one line at a time as they arrive.
pub trait LineSink {
    fn on_line(&mut self, line: &str);

    /// Called before the same command is started again after a transient failure.
    fn on_retry(&mut self) {}
}
