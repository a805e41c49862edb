//! Seams between the engine and its collaborators

use async_trait::async_trait;

use crate::config::ConnectionParameters;
use crate::error::ExecError;

/// Produces connection parameters for a session
#[async_trait]
pub trait ParameterSource: Send + Sync {
    async fn resolve(&self) -> Result<ConnectionParameters, ExecError>;
}

/// Notification delivered by a [`Transport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session is authenticated and accepts commands
    Ready,
    /// Session-level failure
    Error(String),
    /// Earlier backpressure has cleared
    Continue,
    /// Start callback for a submitted command
    Started {
        command: String,
        outcome: Result<(), String>,
    },
    /// Standard output chunk of the running command
    Stdout(Vec<u8>),
    /// Standard error chunk of the running command
    Stderr(Vec<u8>),
    /// The running command's stream closed
    Closed { exit_code: Option<i32> },
}

/// A single remote-shell session
///
/// Outcomes of `connect` and `exec` are reported through `next_event`.
#[async_trait]
pub trait Transport: Send {
    /// Begin establishing the session
    async fn connect(&mut self, params: &ConnectionParameters);

    /// Submit a command. Returns false when the caller must wait for
    /// [`SessionEvent::Continue`] before submitting again.
    fn exec(&mut self, command: &str) -> bool;

    /// Next event, or `None` once the session can produce no more
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// Terminate the session
    async fn end(&mut self);

    fn transport_type(&self) -> &'static str;
}
