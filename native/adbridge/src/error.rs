use std::{io, path::PathBuf};

use thiserror::Error;

/// Coarse classification of a [`BridgeError`], used by callers that only need to decide
/// between retrying, reporting, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    LocalIo,
    Protocol,
    Rejected,
    Cancelled,
    NotFound,
    Parse,
    Command,
    Server,
    InvalidArgument,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to bridge server at {address}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("local file error on {}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request '{request}' rejected: {message}")]
    Rejected { request: String, message: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed to parse {what}: {input:?}")]
    Parse { what: &'static str, input: String },
    #[error("command '{command}' failed: {output}")]
    CommandFailed { command: String, output: String },
    #[error("failed to start bridge server: {0}")]
    ServerStart(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } | Self::Io(_) => ErrorKind::Connection,
            Self::LocalIo { .. } => ErrorKind::LocalIo,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::CommandFailed { .. } => ErrorKind::Command,
            Self::ServerStart(_) => ErrorKind::Server,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Raw diagnostic text reported by the server or the remote command, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Rejected { message, .. } => Some(message),
            Self::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Wraps a failure of the local filesystem, keeping it apart from socket errors.
    pub(crate) fn local_io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::LocalIo { path, source }
    }

    pub(crate) fn parse(what: &'static str, input: impl Into<String>) -> Self {
        Self::Parse { what, input: input.into() }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
