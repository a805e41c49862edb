//! Result types for command execution

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandFailure, ExecError};

/// Result of one attempted command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Command text as submitted
    pub command: String,
    /// False if the command could not start or exited non-zero
    pub success: bool,
    /// Exit status code, absent if the command never started
    pub exit_code: Option<i32>,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Present whenever `success` is false
    pub error: Option<CommandFailure>,
    /// Time from acceptance to close
    pub duration: Duration,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl CommandResult {
    /// Result for a command whose output stream is live
    #[must_use]
    pub fn started(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: true,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            duration: Duration::ZERO,
            started_at: Some(Instant::now()),
        }
    }

    /// Result for a command the transport refused to start
    #[must_use]
    pub fn start_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(CommandFailure::StartFailed {
                reason: reason.into(),
            }),
            duration: Duration::ZERO,
            started_at: None,
        }
    }

    pub fn append_stdout(&mut self, chunk: &[u8]) {
        self.stdout.push_str(&String::from_utf8_lossy(chunk));
    }

    pub fn append_stderr(&mut self, chunk: &[u8]) {
        self.stderr.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Apply the close event. Returns whether the command succeeded.
    pub fn finish(&mut self, exit_code: Option<i32>) -> bool {
        self.exit_code = exit_code;
        self.stamp_duration();
        if exit_code != Some(0) {
            self.success = false;
            self.error = Some(CommandFailure::NonZeroExit { code: exit_code });
        }
        self.success
    }

    /// Mark an in-flight command as failed because the session went away
    pub fn lose_session(&mut self, reason: impl Into<String>) {
        self.stamp_duration();
        self.success = false;
        self.error = Some(CommandFailure::SessionLost {
            reason: reason.into(),
        });
    }

    fn stamp_duration(&mut self) {
        if let Some(started_at) = self.started_at.take() {
            self.duration = started_at.elapsed();
        }
    }

    /// Stdout followed by stderr, each starting on its own line
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() || self.stdout.ends_with('\n') {
            format!("{}{}", self.stdout, self.stderr)
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Aggregate outcome of one `run()` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Number of commands requested
    pub command_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Results in submission order, possibly shorter than `command_count`
    pub results: Vec<CommandResult>,
}

impl ExecutionSummary {
    /// Tally results into a summary
    #[must_use]
    pub fn from_results(command_count: usize, results: Vec<CommandResult>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            command_count,
            success_count,
            failure_count: results.len() - success_count,
            results,
        }
    }

    /// Every requested command ran and exited 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure_count == 0 && self.results.len() == self.command_count
    }

    /// The command that aborted the run, if any
    #[must_use]
    pub fn first_failure(&self) -> Option<&CommandResult> {
        self.results.iter().find(|r| !r.success)
    }
}

/// Ordered list of commands to run
///
/// A single command is normalized to a one-element list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandsRepr", into = "Vec<String>")]
pub struct CommandList(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandsRepr {
    One(String),
    Many(Vec<String>),
}

impl From<CommandsRepr> for CommandList {
    fn from(repr: CommandsRepr) -> Self {
        match repr {
            CommandsRepr::One(cmd) => Self(vec![cmd]),
            CommandsRepr::Many(cmds) => Self(cmds),
        }
    }
}

impl From<CommandList> for Vec<String> {
    fn from(list: CommandList) -> Self {
        list.0
    }
}

impl CommandList {
    /// Accept a JSON string or array of strings
    ///
    /// # Errors
    /// Returns `ExecError::InvalidCommands` for any other shape
    pub fn from_value(value: &Value) -> Result<Self, ExecError> {
        match value {
            Value::String(cmd) => Ok(Self(vec![cmd.clone()])),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    item.as_str().map(str::to_owned).ok_or_else(|| {
                        ExecError::InvalidCommands(format!(
                            "element {idx} is {}, expected a string",
                            kind_of(item)
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self),
            other => Err(ExecError::InvalidCommands(format!(
                "expected a string or an array of strings, got {}",
                kind_of(other)
            ))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl IntoIterator for CommandList {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<&str> for CommandList {
    fn from(cmd: &str) -> Self {
        Self(vec![cmd.to_owned()])
    }
}

impl From<String> for CommandList {
    fn from(cmd: String) -> Self {
        Self(vec![cmd])
    }
}

impl From<Vec<String>> for CommandList {
    fn from(cmds: Vec<String>) -> Self {
        Self(cmds)
    }
}

impl From<&[&str]> for CommandList {
    fn from(cmds: &[&str]) -> Self {
        Self(cmds.iter().map(|c| (*c).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for CommandList {
    fn from(cmds: [&str; N]) -> Self {
        Self(cmds.iter().map(|c| (*c).to_owned()).collect())
    }
}
