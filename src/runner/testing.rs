//! Scripted stand-ins for the sync tool, shared by the unit tests of the crate.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::runner::{AbortSignal, Backoff, LaunchError, ToolLauncher, ToolOutput};

/// Ordered record of launches and waits.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeRun {
    pub stderr: Vec<String>,
    pub stdout: String,
    pub status: Option<i32>,
}

impl FakeRun {
    pub fn ok() -> Self {
        FakeRun {
            status: Some(0),
            ..Default::default()
        }
    }

    pub fn failing<'a>(code: i32, stderr: impl IntoIterator<Item = &'a str>) -> Self {
        FakeRun {
            status: Some(code),
            ..Default::default()
        }
        .with_stderr(stderr)
    }

    pub fn with_stderr<'a>(mut self, lines: impl IntoIterator<Item = &'a str>) -> Self {
        self.stderr.extend(lines.into_iter().map(String::from));
        self
    }

    pub fn with_stderr_lines(mut self, lines: Vec<String>) -> Self {
        self.stderr.extend(lines);
        self
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }
}

type Script = Box<dyn Fn(&[String], usize) -> FakeRun>;

/// Answers every invocation from a script that sees the arguments and the call index.
pub struct FakeLauncher {
    journal: Journal,
    script: Script,
    calls: RefCell<Vec<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new(journal: Journal, script: impl Fn(&[String], usize) -> FakeRun + 'static) -> Self {
        FakeLauncher {
            journal,
            script: Box::new(script),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }
}

impl ToolLauncher for FakeLauncher {
    async fn launch(
        &self,
        args: &[String],
        _abort: &AbortSignal,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput, LaunchError> {
        let call = {
            let mut calls = self.calls.borrow_mut();
            calls.push(args.to_vec());
            calls.len() - 1
        };
        self.journal
            .push(format!("launch {}", args.first().map(String::as_str).unwrap_or_default()));
        let run = (self.script)(args, call);
        for line in &run.stderr {
            on_stderr_line(line);
        }
        Ok(ToolOutput {
            status: run.status,
            stdout: run.stdout,
        })
    }
}

impl ToolLauncher for &FakeLauncher {
    async fn launch(
        &self,
        args: &[String],
        abort: &AbortSignal,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput, LaunchError> {
        (**self).launch(args, abort, on_stderr_line).await
    }
}

#[derive(Debug, Clone)]
pub struct RecordingBackoff {
    journal: Journal,
}

impl RecordingBackoff {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

impl Backoff for RecordingBackoff {
    async fn wait(&self, _delay: Duration) {
        self.journal.push("wait");
    }
}
