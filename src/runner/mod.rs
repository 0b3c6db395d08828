//! Invocation of the external sync tool.

mod exit_code;
mod process;
mod retrying_runner;
#[cfg(test)]
pub mod testing;

pub use exit_code::{exit_code_meaning, status_summary};
pub use process::{AbortSignal, LaunchError, ProcessLauncher, ToolLauncher, ToolOutput};
pub use retrying_runner::{
    Backoff, DEFAULT_RETRY_DELAY, RetryPolicy, RetryingRunner,
    RunnerError, SleepBackoff,
};
