use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use compio::io::compat::AsyncStream;
use compio::process::Command;
use futures::future::{self, Either};
use futures::io::BufReader;
use futures::stream::{self, StreamExt};
use futures::task::AtomicWaker;
use futures::{AsyncBufReadExt, AsyncRead, Stream};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

/// What an invocation of the tool left behind once it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
}

/// Starts the external tool. rclone writes its log to stderr, which is handed over line by line
/// while the process runs; stdout is collected.
pub trait ToolLauncher {
    async fn launch(
        &self,
        args: &[String],
        abort: &AbortSignal,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput, LaunchError>;
}

/// Launches a real child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn create_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        let _ = cmd.stdin(Stdio::null());
        let _ = cmd.stdout(Stdio::piped());
        let _ = cmd.stderr(Stdio::piped());
        cmd
    }
}

enum Pipe {
    Stdout(std::io::Result<String>),
    Stderr(std::io::Result<String>),
}

type PipeLines = Pin<Box<dyn Stream<Item = std::io::Result<String>>>>;

/// Splits a pipe into lines; bytes that are not UTF-8 are replaced rather than ending the stream.
fn pipe_lines<R: AsyncRead + 'static>(pipe: R) -> PipeLines {
    stream::unfold(BufReader::new(Box::pin(pipe)), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                Some((Ok(String::from_utf8_lossy(&buf).into_owned()), reader))
            }
            Err(err) => Some((Err(err), reader)),
        }
    })
    .boxed_local()
}

impl ToolLauncher for ProcessLauncher {
    async fn launch(
        &self,
        args: &[String],
        abort: &AbortSignal,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput, LaunchError> {
        let program = self.program.display().to_string();
        debug!("Running {} {}", program, args.join(" "));

        let mut child = self
            .create_command(args)
            .spawn()
            .context(SpawnSnafu { program: &program })?;

        let stdout_lines: PipeLines = match child.stdout.take() {
            Some(stdout) => pipe_lines(AsyncStream::new(stdout)),
            None => stream::empty().boxed_local(),
        };
        let stderr_lines: PipeLines = match child.stderr.take() {
            Some(stderr) => pipe_lines(AsyncStream::new(stderr)),
            None => stream::empty().boxed_local(),
        };
        let mut output = stream::select(
            stdout_lines.map(Pipe::Stdout),
            stderr_lines.map(Pipe::Stderr),
        );

        let mut stdout = String::new();
        loop {
            match future::select(output.next(), abort.aborted()).await {
                Either::Left((Some(Pipe::Stderr(Ok(line))), _)) => on_stderr_line(&line),
                Either::Left((Some(Pipe::Stdout(Ok(line))), _)) => {
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                Either::Left((Some(Pipe::Stdout(Err(err)) | Pipe::Stderr(Err(err))), _)) => {
                    warn!("Failed to read output of '{program}': {err}");
                    break;
                }
                Either::Left((None, _)) => break,
                Either::Right(((), _)) => {
                    warn!("Terminating '{program}'");
                    drop(output);
                    if let Err(err) = child.kill() {
                        warn!("Failed to terminate '{program}': {err}");
                    }
                    let _ = child.wait().await;
                    return AbortedSnafu { program }.fail();
                }
            }
        }

        drop(output);
        let status = child.wait().await.context(WaitSnafu { program: &program })?;
        debug!("'{program}' exited with {status}");
        Ok(ToolOutput {
            status: status.code(),
            stdout,
        })
    }
}

/// Shared flag used to ask a running backup to stop.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortState>,
}

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    waker: AtomicWaker,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.waker.wake();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once [`AbortSignal::abort`] has been called.
    pub fn aborted(&self) -> Aborted<'_> {
        Aborted { signal: self }
    }
}

pub struct Aborted<'a> {
    signal: &'a AbortSignal,
}

impl Future for Aborted<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.signal.is_aborted() {
            return Poll::Ready(());
        }
        self.signal.inner.waker.register(cx.waker());
        if self.signal.is_aborted() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[derive(Debug, Snafu)]
pub enum LaunchError {
    #[snafu(display("Failed to spawn '{}'", program))]
    SpawnError {
        program: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to wait for '{}'", program))]
    WaitError {
        program: String,
        source: std::io::Error,
    },
    #[snafu(display("'{}' was terminated on request", program))]
    AbortedError { program: String },
}
