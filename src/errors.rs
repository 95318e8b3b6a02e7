//! Error types shared across the debugger.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed frame or reference to an unknown device/node.
    ///
    /// Recovered locally: the offending frame or record is dropped.
    Protocol(String),
    /// Requested node, tensor, session, or watchpoint does not exist.
    NotFound(String),
    /// Event or command is not accepted in the current session state.
    InvalidState(String),
    /// Caller supplied an invalid parameter (bad pattern, empty condition, ...).
    InvalidParam(String),
    /// A configured capacity (sessions, watchpoints) would be exceeded.
    LimitExceeded(String),
    /// Another control command is still awaiting acknowledgement.
    CommandInProgress(String),
    /// The remote process did not acknowledge a command in time.
    CommandTimeout(String),
    /// The remote process acknowledged a command with a failure status.
    CommandRejected(String),
    /// The session was torn down while the caller was waiting.
    SessionClosed(String),
    /// Ingestion stream corrupted beyond recovery; the session terminates.
    Fatal(String),
    /// Local IPC communication failure.
    Ipc(String),
    /// File-system or socket I/O failure.
    Io(String),
}

/// Fieldless discriminant of [`AppError`], serialisable for UI rendering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`AppError::Config`].
    Config,
    /// See [`AppError::Protocol`].
    Protocol,
    /// See [`AppError::NotFound`].
    NotFound,
    /// See [`AppError::InvalidState`].
    InvalidState,
    /// See [`AppError::InvalidParam`].
    InvalidParam,
    /// See [`AppError::LimitExceeded`].
    LimitExceeded,
    /// See [`AppError::CommandInProgress`].
    CommandInProgress,
    /// See [`AppError::CommandTimeout`].
    CommandTimeout,
    /// See [`AppError::CommandRejected`].
    CommandRejected,
    /// See [`AppError::SessionClosed`].
    SessionClosed,
    /// See [`AppError::Fatal`].
    Fatal,
    /// See [`AppError::Ipc`].
    Ipc,
    /// See [`AppError::Io`].
    Io,
}

impl AppError {
    /// Typed discriminant of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InvalidParam(_) => ErrorKind::InvalidParam,
            Self::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Self::CommandInProgress(_) => ErrorKind::CommandInProgress,
            Self::CommandTimeout(_) => ErrorKind::CommandTimeout,
            Self::CommandRejected(_) => ErrorKind::CommandRejected,
            Self::SessionClosed(_) => ErrorKind::SessionClosed,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Ipc(_) => ErrorKind::Ipc,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this error is confined to a single frame or record.
    ///
    /// Local errors never abort the session.
    #[must_use]
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::NotFound(_) | Self::InvalidState(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::InvalidParam(msg) => write!(f, "invalid param: {msg}"),
            Self::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            Self::CommandInProgress(msg) => write!(f, "command in progress: {msg}"),
            Self::CommandTimeout(msg) => write!(f, "command timeout: {msg}"),
            Self::CommandRejected(msg) => write!(f, "command rejected: {msg}"),
            Self::SessionClosed(msg) => write!(f, "session closed: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
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

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
