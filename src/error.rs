//! Daemon error types.

use std::io;
use std::path::PathBuf;

use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::xproto::Window;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unrecoverable daemon failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to open display {display:?}: {source}")]
    OpenDisplay { display: String, source: ConnectError },

    #[error("display connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("X protocol error: {0}")]
    Protocol(String),

    #[error("idle query failed: {0}")]
    IdleQuery(String),

    #[error("more than one virtual root window found on screen {screen}")]
    MultipleVroots { screen: usize },

    #[error("already running on display {display} (window 0x{window:x}) from process {identity}")]
    AlreadyRunning { display: String, window: Window, identity: String },

    #[error("unable to create overlay window on screen {screen}: {reason}")]
    Overlay { screen: usize, reason: String },

    #[error("invalid config {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("event loop error: {0}")]
    EventLoop(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ReplyError> for Error {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(err) => Self::Connection(err),
            ReplyError::X11Error(err) => Self::Protocol(format!("{err:?}")),
        }
    }
}

impl From<ReplyOrIdError> for Error {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::ConnectionError(err) => Self::Connection(err),
            ReplyOrIdError::X11Error(err) => Self::Protocol(format!("{err:?}")),
            ReplyOrIdError::IdsExhausted => Self::Protocol(String::from("resource ids exhausted")),
        }
    }
}

impl Error {
    /// Whether this error is a bug which should produce a core dump.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
