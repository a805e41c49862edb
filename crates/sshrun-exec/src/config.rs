//! Session configuration and credential resolution
//!
//! Turns a declarative credential record into [`ConnectionParameters`],
//! loading private key material lazily and caching it after the first read.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::error::ExecError;
use crate::keys::{FsKeyStore, KeySource, KeyStore};
use crate::traits::ParameterSource;

/// Credential record for one host
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub username: String,
    /// Password, or key passphrase when a key is also given
    #[serde(default)]
    pub password: Option<String>,
    /// Private key reference
    #[serde(default)]
    pub private_key: Option<KeySource>,
}

fn default_port() -> u16 {
    22
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

impl SessionConfig {
    /// Create a record with no credentials yet
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: None,
            private_key: None,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set private key source
    #[must_use]
    pub fn with_private_key(mut self, source: KeySource) -> Self {
        self.private_key = Some(source);
        self
    }

    /// Check the record is usable
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if host or username is empty, or if
    /// neither a password nor a private key is present
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.host.trim().is_empty() {
            return Err(ExecError::ConfigError("host is required".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ExecError::ConfigError("username is required".to_string()));
        }
        if self.password.is_none() && self.private_key.is_none() {
            return Err(ExecError::ConfigError(
                "either a password or a private key is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolved authentication credential
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    Key {
        /// Raw private key bytes
        material: Arc<Vec<u8>>,
        /// Passphrase for an encrypted key
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::Key {
                material,
                passphrase,
            } => f
                .debug_struct("Key")
                .field("material", &format_args!("<{} bytes>", material.len()))
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Everything needed to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

/// Resolves a [`SessionConfig`] into [`ConnectionParameters`]
///
/// Key material is read from the [`KeyStore`] once and reused by every
/// later resolution on the same instance.
pub struct SessionConfigurator {
    config: SessionConfig,
    store: Arc<dyn KeyStore>,
    key_cache: OnceCell<Arc<Vec<u8>>>,
}

impl fmt::Debug for SessionConfigurator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfigurator")
            .field("config", &self.config)
            .field("key_cached", &self.key_cache.initialized())
            .finish_non_exhaustive()
    }
}

impl SessionConfigurator {
    /// Create a configurator reading keys from the filesystem
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the record is invalid
    pub fn new(config: SessionConfig) -> Result<Self, ExecError> {
        Self::with_store(config, Arc::new(FsKeyStore))
    }

    /// Create a configurator with a custom key store
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the record is invalid
    pub fn with_store(config: SessionConfig, store: Arc<dyn KeyStore>) -> Result<Self, ExecError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            key_cache: OnceCell::new(),
        })
    }

    /// Get the underlying record
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn key_material(&self, source: &KeySource) -> Result<Arc<Vec<u8>>, ExecError> {
        let material = self
            .key_cache
            .get_or_try_init(|| async {
                debug!(source = %source.describe(), "loading private key");
                self.store.read(source).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(material))
    }
}

#[async_trait]
impl ParameterSource for SessionConfigurator {
    #[instrument(skip(self), fields(host = %self.config.host))]
    async fn resolve(&self) -> Result<ConnectionParameters, ExecError> {
        let credential = match (&self.config.private_key, &self.config.password) {
            (Some(source), passphrase) => Credential::Key {
                material: self.key_material(source).await?,
                passphrase: passphrase.clone(),
            },
            (None, Some(password)) => Credential::Password(password.clone()),
            (None, None) => {
                return Err(ExecError::ConfigError(
                    "no authentication method available".to_string(),
                ));
            }
        };

        Ok(ConnectionParameters {
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            credential,
        })
    }
}
