//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing, validation, or credential loading failure.
    Config(String),
    /// Transport endpoint resolution failed (`rtm.start`).
    Auth(String),
    /// Dial, read, or write failure on the duplex chat connection.
    Transport(String),
    /// The subprocess could not be started.
    Spawn(String),
    /// The subprocess died or could not be written to during a command.
    Execution(String),
    /// The subprocess terminated in an orderly fashion.
    CleanExit,
    /// An inbound frame was not valid JSON for the expected shape.
    FrameParse(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// `true` for outcomes that mean the session's subprocess is gone.
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::CleanExit | Self::Execution(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Auth(msg) => write!(f, "auth: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Execution(msg) => write!(f, "execution: {msg}"),
            Self::CleanExit => write!(f, "clean exit"),
            Self::FrameParse(msg) => write!(f, "frame parse: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
