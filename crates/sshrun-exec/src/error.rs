//! Error types for sshrun-exec

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that cross the `run()` boundary
///
/// Command-level failures never show up here; they are recorded as
/// [`CommandFailure`] inside the summary instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The `commands` argument was neither a string nor a list of strings
    #[error("invalid commands: {0}")]
    InvalidCommands(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),
}

impl ExecError {
    /// Malformed input from the caller, raised before any I/O
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ExecError::InvalidCommands(_) | ExecError::ConfigError(_)
        )
    }

    /// Failure to establish the session or obtain key material
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        !self.is_caller_error()
    }
}

/// Failure record attached to a [`CommandResult`](crate::result::CommandResult)
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandFailure {
    /// The transport refused to start the command
    #[error("command could not be started: {reason}")]
    StartFailed { reason: String },

    /// The command finished with a non-zero (or missing) exit code.
    ///
    /// Termination by signal is reported the same way.
    #[error("command exited with non-zero status")]
    NonZeroExit { code: Option<i32> },

    /// The session went away while the command was in flight
    #[error("session lost: {reason}")]
    SessionLost { reason: String },
}

/// Key loading errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KeyError> for ExecError {
    fn from(err: KeyError) -> Self {
        ExecError::SshKeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert!(ExecError::InvalidCommands("42".into()).is_caller_error());
        assert!(ExecError::ConfigError("host".into()).is_caller_error());
        assert!(ExecError::ConnectionFailed("refused".into()).is_connection_error());
        assert!(ExecError::SshKeyError("gone".into()).is_connection_error());
    }

    #[test]
    fn test_key_error_converts_to_ssh_key_error() {
        let err: ExecError = KeyError::EnvNotSet("DEPLOY_KEY".into()).into();
        assert!(matches!(err, ExecError::SshKeyError(msg) if msg.contains("DEPLOY_KEY")));
    }

    #[test]
    fn test_failure_serializes_with_kind_tag() {
        let failure = CommandFailure::NonZeroExit { code: Some(2) };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "non_zero_exit");
        assert_eq!(json["code"], 2);
    }
}
