//! Local command execution using `tokio::process`

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use crate::config::ConnectionParameters;
use crate::traits::{SessionEvent, Transport};

const READ_CHUNK: usize = 8 * 1024;

/// Local transport
///
/// Runs every command through `sh -c` on the local machine, ignoring the
/// connection parameters. Useful for dry runs and tests.
#[derive(Debug)]
pub struct LocalTransport {
    shell: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    running: Option<JoinHandle<()>>,
}

impl LocalTransport {
    /// Create a new local transport using `sh`
    #[must_use]
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    /// Use a different shell, invoked as `<shell> -c <command>`
    #[must_use]
    pub fn with_shell(shell: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shell: shell.into(),
            tx,
            rx,
            running: None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // receiver lives as long as self
        let _ = self.tx.send(event);
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&mut self, _params: &ConnectionParameters) {
        self.emit(SessionEvent::Ready);
    }

    #[instrument(skip(self), level = "debug")]
    fn exec(&mut self, command: &str) -> bool {
        debug!(command = %command, "executing local command");

        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(command = %command, error = %e, "failed to spawn process");
                self.emit(SessionEvent::Started {
                    command: command.to_owned(),
                    outcome: Err(e.to_string()),
                });
                return true;
            }
        };
        self.emit(SessionEvent::Started {
            command: command.to_owned(),
            outcome: Ok(()),
        });

        let tx = self.tx.clone();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.running = Some(tokio::spawn(async move {
            tokio::join!(
                pump(stdout, tx.clone(), SessionEvent::Stdout),
                pump(stderr, tx.clone(), SessionEvent::Stderr),
            );
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(error = %e, "failed to wait for process");
                    None
                }
            };
            let _ = tx.send(SessionEvent::Closed { exit_code });
        }));

        true
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    async fn end(&mut self) {
        if let Some(task) = self.running.take() {
            task.abort();
        }
    }

    fn transport_type(&self) -> &'static str {
        "local"
    }
}

async fn pump<R>(
    reader: Option<R>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    wrap: fn(Vec<u8>) -> SessionEvent,
) where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "failed to read process output");
                break;
            }
        }
    }
}
