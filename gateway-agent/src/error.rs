//! Agent error types
//!
//! Every dispatcher operation returns [`AgentError`]. The [`ErrorKind`] lets the
//! control-channel response path and the HTTP façade tell a bad request apart
//! from an unsupported command or a broken transport.

use serde::Serialize;
use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::config::ConfigError;
use crate::senml::CodecError;
use crate::transport::TransportError;

/// Coarse classification reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Malformed,
    UnknownCommand,
    Validation,
    Transport,
    Resource,
    NotFound,
}

/// Agent error type
#[derive(Error, Debug)]
pub enum AgentError {
    /// Payload or argument that cannot be decoded
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Syntactically valid command with an unrecognized keyword
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// pty spawn, process execution or filesystem failure
    #[error("resource failure: {0}")]
    Resource(String),

    #[error("no terminal session for {0}")]
    NoSuchSession(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Malformed(_) | AgentError::Codec(_) => ErrorKind::Malformed,
            AgentError::UnknownCommand(_) => ErrorKind::UnknownCommand,
            AgentError::Transport(_) => ErrorKind::Transport,
            AgentError::Resource(_) | AgentError::Io(_) => ErrorKind::Resource,
            AgentError::NoSuchSession(_) => ErrorKind::NotFound,
            AgentError::Config(e) => match e {
                ConfigError::Invalid(_) => ErrorKind::Validation,
                ConfigError::InvalidValue { .. } | ConfigError::Parse(_) => ErrorKind::Malformed,
                ConfigError::Io(_) | ConfigError::Serialize(_) => ErrorKind::Resource,
            },
            AgentError::Bootstrap(e) => match e {
                BootstrapError::Http(_) | BootstrapError::Status(_) => ErrorKind::Transport,
                BootstrapError::Config(_) => ErrorKind::Resource,
                _ => ErrorKind::Malformed,
            },
        }
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
