//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name under which the Slack token may be stored.
pub const KEYRING_SERVICE: &str = "rtm-relay";

/// Keychain entry holding the Slack token.
pub const TOKEN_KEYRING_KEY: &str = "slack_token";

/// Environment variable consulted when the keychain has no token.
pub const TOKEN_ENV_VAR: &str = "SLACK_TOKEN";

/// Slack transport settings.
///
/// The token is loaded at runtime via OS keychain or environment variable,
/// never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SlackConfig {
    /// Endpoint that trades the token for a WebSocket URL.
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    /// Channel-id prefix identifying direct-message channels.
    #[serde(default = "default_direct_channel_prefix")]
    pub direct_channel_prefix: String,
    /// Idle period after which a keepalive ping is sent.
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u64,
    /// Slack token (populated at runtime).
    #[serde(skip)]
    pub token: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            direct_channel_prefix: default_direct_channel_prefix(),
            keepalive_seconds: default_keepalive_seconds(),
            token: String::new(),
        }
    }
}

/// Output framing settings for subprocess sessions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FramingConfig {
    /// Idle gap in milliseconds that ends a turn of subprocess output.
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,
    /// How long a new subprocess may take to print its banner.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            quiescence_ms: default_quiescence_ms(),
            startup_timeout_seconds: default_startup_timeout_seconds(),
        }
    }
}

fn default_auth_url() -> String {
    "https://slack.com/api/rtm.start".into()
}

fn default_direct_channel_prefix() -> String {
    "D".into()
}

fn default_keepalive_seconds() -> u64 {
    5
}

fn default_quiescence_ms() -> u64 {
    10
}

fn default_startup_timeout_seconds() -> u64 {
    30
}

fn default_max_sessions() -> u32 {
    16
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interactive program launched for every user session (e.g. `dfrotz`).
    pub executable: String,
    /// Arguments passed to the program, typically the data file.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for spawned programs.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Maximum number of simultaneous user sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
    /// Turn framing settings.
    #[serde(default)]
    pub framing: FramingConfig,
    /// Slack connectivity settings.
    #[serde(default)]
    pub slack: SlackConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the Slack token from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env var provide
    /// a non-empty token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.slack.token = load_credential(TOKEN_KEYRING_KEY, TOKEN_ENV_VAR).await?;
        Ok(())
    }

    /// Idle gap that terminates a turn.
    #[must_use]
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.framing.quiescence_ms)
    }

    /// Maximum wait for a new program's banner.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.framing.startup_timeout_seconds)
    }

    /// Keepalive ping interval.
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.slack.keepalive_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(AppError::Config("executable must not be empty".into()));
        }

        if self.max_sessions == 0 {
            return Err(AppError::Config(
                "max_sessions must be greater than zero".into(),
            ));
        }

        if self.framing.quiescence_ms == 0 {
            return Err(AppError::Config(
                "framing.quiescence_ms must be greater than zero".into(),
            ));
        }

        if self.framing.startup_timeout_seconds == 0 {
            return Err(AppError::Config(
                "framing.startup_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.slack.keepalive_seconds == 0 {
            return Err(AppError::Config(
                "slack.keepalive_seconds must be greater than zero".into(),
            ));
        }

        if self.slack.direct_channel_prefix.is_empty() {
            return Err(AppError::Config(
                "slack.direct_channel_prefix must not be empty".into(),
            ));
        }

        if let Some(dir) = self.working_dir.take() {
            let canonical = dir
                .canonicalize()
                .map_err(|err| AppError::Config(format!("working_dir invalid: {err}")))?;
            self.working_dir = Some(canonical);
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
