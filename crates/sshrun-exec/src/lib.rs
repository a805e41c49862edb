//! sshrun-exec: Sequential remote command execution
//!
//! Resolves credentials into connection parameters, opens a session and runs
//! an ordered list of commands on it, stopping at the first failure and
//! always returning the results collected so far.

pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use config::{ConnectionParameters, Credential, SessionConfig, SessionConfigurator};
pub use engine::{CommandRunner, Engine, Phase, Step};
pub use error::{CommandFailure, ExecError, KeyError};
pub use keys::{FsKeyStore, KeySource, KeyStore};
pub use local::LocalTransport;
pub use result::{CommandList, CommandResult, ExecutionSummary};
pub use ssh::SshTransport;
pub use traits::{ParameterSource, SessionEvent, Transport};
