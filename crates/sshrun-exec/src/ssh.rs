//! SSH transport using russh crate

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key, ssh_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConnectionParameters, Credential};
use crate::error::ExecError;
use crate::traits::{SessionEvent, Transport};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

type SessionHandle = client::Handle<SshClientHandler>;

/// SSH transport
///
/// Each submitted command runs on its own session channel. russh applies
/// channel window flow-control itself, so `exec` always reports
/// ready-for-next and no continue notifications are produced.
pub struct SshTransport {
    config: Arc<client::Config>,
    handle: Option<Arc<SessionHandle>>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    running: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("connected", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SshTransport {
    /// Create an unconnected transport
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(client::Config::default())
    }

    /// Create a transport with custom russh client settings
    #[must_use]
    pub fn with_config(config: client::Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            handle: None,
            tx,
            rx,
            running: None,
        }
    }

    /// Send keepalives at the given interval
    #[must_use]
    pub fn with_keepalive(interval: Duration) -> Self {
        Self::with_config(client::Config {
            keepalive_interval: Some(interval),
            ..Default::default()
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    #[instrument(skip_all, fields(host = %params.host))]
    async fn establish(&self, params: &ConnectionParameters) -> Result<SessionHandle, ExecError> {
        info!(
            host = %params.host,
            port = params.port,
            user = %params.username,
            "connecting to SSH"
        );

        let mut session = client::connect(
            Arc::clone(&self.config),
            (params.host.as_str(), params.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let auth_res = match &params.credential {
            Credential::Password(password) => session
                .authenticate_password(&params.username, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?,
            Credential::Key {
                material,
                passphrase,
            } => {
                let text = std::str::from_utf8(material)
                    .map_err(|e| ExecError::SshKeyError(format!("key is not valid UTF-8: {e}")))?;
                let key_pair = decode_secret_key(text, passphrase.as_deref())
                    .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                session
                    .authenticate_publickey(
                        &params.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                    )
                    .await
                    .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "server rejected credentials for {}",
                params.username
            )));
        }

        info!(host = %params.host, "SSH connected and authenticated");
        Ok(session)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self, params: &ConnectionParameters) {
        match self.establish(params).await {
            Ok(session) => {
                self.handle = Some(Arc::new(session));
                self.emit(SessionEvent::Ready);
            }
            Err(e) => {
                error!(host = %params.host, error = %e, "SSH connection failed");
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    fn exec(&mut self, command: &str) -> bool {
        let Some(handle) = self.handle.as_ref().map(Arc::clone) else {
            self.emit(SessionEvent::Started {
                command: command.to_owned(),
                outcome: Err("not connected".to_string()),
            });
            return true;
        };

        debug!(command = %command, "executing remote command");
        let tx = self.tx.clone();
        let command = command.to_owned();
        self.running = Some(tokio::spawn(async move {
            run_channel(&handle, &command, &tx).await;
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
        if let Some(handle) = self.handle.take() {
            match handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                Ok(()) => info!("SSH disconnected"),
                Err(e) => warn!(error = %e, "SSH disconnect failed"),
            }
        }
    }

    fn transport_type(&self) -> &'static str {
        "ssh"
    }
}

/// Open a channel, run one command and forward its messages as events
async fn run_channel(
    handle: &SessionHandle,
    command: &str,
    tx: &mpsc::UnboundedSender<SessionEvent>,
) {
    let mut channel = match handle.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = tx.send(SessionEvent::Started {
                command: command.to_owned(),
                outcome: Err(format!("failed to open channel: {e}")),
            });
            return;
        }
    };

    if let Err(e) = channel.exec(true, command).await {
        let _ = tx.send(SessionEvent::Started {
            command: command.to_owned(),
            outcome: Err(format!("failed to exec command: {e}")),
        });
        return;
    }
    let _ = tx.send(SessionEvent::Started {
        command: command.to_owned(),
        outcome: Ok(()),
    });

    let mut exit_code = None;
    let mut got_eof = false;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                let _ = tx.send(SessionEvent::Stdout(data.to_vec()));
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    // stderr
                    let _ = tx.send(SessionEvent::Stderr(data.to_vec()));
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit_code = Some(exit_status.cast_signed());
                if got_eof {
                    break;
                }
            }
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                debug!(command = %command, signal = ?signal_name, "command killed by signal");
            }
            Some(ChannelMsg::Eof) => {
                got_eof = true;
                if exit_code.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    let _ = tx.send(SessionEvent::Closed { exit_code });
}
