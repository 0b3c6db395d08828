use std::pin::pin;
use std::sync::OnceLock;
use std::time::Duration;

use futures::future::{self, Either};
use regex::Regex;
use snafu::Snafu;
use tracing::{debug, error, warn};

use crate::events::{LineSink, LogRecord};
use crate::runner::{
    AbortSignal, LaunchError, ToolLauncher, ToolOutput, exit_code_meaning, status_summary,
};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Error messages that indicate the network went away rather than a real failure.
pub const DEFAULT_TRANSIENT_PATTERNS: [&str; 7] = [
    r"no such host",
    r"connection reset by peer",
    r"connection refused",
    r"network is unreachable",
    r"i/o timeout",
    r"TLS handshake timeout",
    r"(?i)temporary failure in name resolution",
];

/// When and how long to wait before invoking the tool again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub transient_patterns: Vec<Regex>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        static DEFAULT_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
        let patterns = DEFAULT_PATTERNS.get_or_init(|| {
            DEFAULT_TRANSIENT_PATTERNS
                .iter()
                .map(|pattern| Regex::new(pattern).expect("valid regex"))
                .collect()
        });
        RetryPolicy {
            delay: DEFAULT_RETRY_DELAY,
            transient_patterns: patterns.clone(),
        }
    }
}

impl RetryPolicy {
    pub fn is_transient(&self, message: &str) -> bool {
        self.transient_patterns
            .iter()
            .any(|pattern| pattern.is_match(message))
    }
}

/// Waits between two attempts.
pub trait Backoff {
    async fn wait(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SleepBackoff;

impl Backoff for SleepBackoff {
    async fn wait(&self, delay: Duration) {
        compio::time::sleep(delay).await;
    }
}

/// Runs the tool until it either succeeds or fails for a reason other than a network hiccup.
#[derive(Debug, Clone)]
pub struct RetryingRunner<L, B = SleepBackoff> {
    launcher: L,
    backoff: B,
    policy: RetryPolicy,
    abort: AbortSignal,
}

impl<L: ToolLauncher> RetryingRunner<L> {
    pub fn new(launcher: L, policy: RetryPolicy, abort: AbortSignal) -> Self {
        Self::with_backoff(launcher, SleepBackoff, policy, abort)
    }
}

impl<L: ToolLauncher, B: Backoff> RetryingRunner<L, B> {
    pub fn with_backoff(launcher: L, backoff: B, policy: RetryPolicy, abort: AbortSignal) -> Self {
        Self {
            launcher,
            backoff,
            policy,
            abort,
        }
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Runs a long command, handing every log line to `sink` as it arrives.
    pub async fn stream(
        &self,
        args: &[String],
        sink: &mut impl LineSink,
    ) -> Result<(), RunnerError> {
        self.run(args, sink).await.map(|_| ())
    }

    /// Runs a short command and returns what it printed on stdout.
    pub async fn capture(&self, args: &[String]) -> Result<String, RunnerError> {
        self.run(args, &mut DiscardLines)
            .await
            .map(|output| output.stdout)
    }

    async fn run(
        &self,
        args: &[String],
        sink: &mut impl LineSink,
    ) -> Result<ToolOutput, RunnerError> {
        let mut attempt: u32 = 1;
        loop {
            let mut errors = Vec::new();
            let mut summary = Vec::new();
            let launched = {
                let mut on_line = |line: &str| {
                    if let Ok(record) = LogRecord::parse(line) {
                        let block = status_summary(&record.msg);
                        if !block.is_empty() {
                            summary = block;
                        }
                        if record.is_error() {
                            errors.push(record.msg);
                        }
                    }
                    sink.on_line(line);
                };
                self.launcher.launch(args, &self.abort, &mut on_line).await
            };
            let output = match launched {
                Ok(output) => output,
                Err(LaunchError::AbortedError { .. }) => return AbortedSnafu.fail(),
                Err(source) => return Err(RunnerError::LaunchFailure { source }),
            };

            if output.status == Some(0) {
                return Ok(output);
            }

            if let Some(transient) = errors.iter().find(|msg| self.policy.is_transient(msg)) {
                warn!(
                    "Attempt {attempt} of '{}' hit a network problem ({transient}), retrying in {:?}",
                    command_name(args),
                    self.policy.delay
                );
                let wait = pin!(self.backoff.wait(self.policy.delay));
                if let Either::Left(_) = future::select(pin!(self.abort.aborted()), wait).await {
                    return AbortedSnafu.fail();
                }
                sink.on_retry();
                attempt += 1;
                continue;
            }

            let code = output.status.unwrap_or(-1);
            for message in &errors {
                error!("{message}");
            }
            debug!("Final status of '{}': {:?}", command_name(args), summary);
            return ToolExitSnafu {
                command: command_name(args),
                code,
                meaning: exit_code_meaning(code),
                errors,
                summary,
            }
            .fail();
        }
    }
}

fn command_name(args: &[String]) -> String {
    args.first().cloned().unwrap_or_default()
}

struct DiscardLines;

impl LineSink for DiscardLines {
    fn on_line(&mut self, _line: &str) {}
}

#[derive(Debug, Snafu)]
pub enum RunnerError {
    #[snafu(display("Could not run the sync tool"))]
    LaunchFailure { source: LaunchError },
    #[snafu(display("rclone {command} exited with status {code} - {meaning}"))]
    ToolExit {
        command: String,
        code: i32,
        meaning: &'static str,
        errors: Vec<String>,
        summary: Vec<String>,
    },
    #[snafu(display("The sync tool was stopped on request"))]
    Aborted,
}
