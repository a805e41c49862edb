//! Run file loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use sshrun_exec::{CommandList, ExecError, KeySource, SessionConfig};

/// Contents of a `sshrun.toml` run file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Host to run against
    #[serde(default)]
    pub target: TargetConfig,
    /// Commands to run, a string or a list of strings
    #[serde(default)]
    pub commands: CommandList,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Target host; every field may also come from the command line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// Literal password (prefer `password_env`)
    pub password: Option<String>,
    /// Environment variable holding the password
    pub password_env: Option<String>,
    /// Path to a private key file
    pub private_key: Option<PathBuf>,
    /// Environment variable holding a base64-encoded private key
    pub private_key_env: Option<String>,
    /// Seconds between SSH keepalive messages
    pub keepalive_secs: Option<u64>,
}

impl TargetConfig {
    /// Keepalive interval, if one is configured and non-zero
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Build the credential record
    ///
    /// # Errors
    /// Returns error if a required field is missing or a password
    /// environment variable is not set
    pub fn to_session_config(&self) -> Result<SessionConfig, ExecError> {
        let host = self.host.clone().ok_or_else(|| {
            ExecError::ConfigError("no target host given (set target.host or --host)".into())
        })?;
        let username = self.username.clone().ok_or_else(|| {
            ExecError::ConfigError("no username given (set target.username or --user)".into())
        })?;

        let mut config = SessionConfig::new(host, username);
        if let Some(port) = self.port {
            config = config.with_port(port);
        }

        let password = match (&self.password, &self.password_env) {
            (_, Some(var)) => Some(std::env::var(var).map_err(|_| {
                ExecError::ConfigError(format!("password variable {var} is not set"))
            })?),
            (Some(password), None) => Some(password.clone()),
            (None, None) => None,
        };
        if let Some(password) = password {
            config = config.with_password(password);
        }

        let key = match (&self.private_key, &self.private_key_env) {
            (Some(path), _) => Some(KeySource::Path(expand_home(path))),
            (None, Some(var)) => Some(KeySource::Env(var.clone())),
            (None, None) => None,
        };
        if let Some(key) = key {
            config = config.with_private_key(key);
        }

        Ok(config)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, the default paths, or use defaults
    ///
    /// # Errors
    /// Returns error if a file was found but could not be loaded
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var("SSHRUN_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            Some(PathBuf::from("sshrun.toml")),
            dirs::config_dir().map(|p| p.join("sshrun/sshrun.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }
}
