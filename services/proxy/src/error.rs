//! Error types for the proxy.
//!
//! Startup problems are [`ConfigError`]s and abort the process before any
//! socket is opened. Everything that happens once traffic flows is scoped to a
//! single connection: [`ConnectError`] when the backend is unreachable and
//! [`ProtocolError`] when a forward cycle fails.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::options::OptionError;

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// Config file is not valid TOML or has unknown keys.
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// `--set` argument that is not `namespace.name.option=value`.
    #[error(
        "invalid override {0:?}: expected behavior.<name>.<option>=<value> or protocol.<name>.<option>=<value>"
    )]
    Override(String),

    /// Address not in `HOST:PORT` form.
    #[error("expected HOST:PORT, got {0:?}")]
    AddressFormat(String),

    /// Address resolution failed.
    #[error("could not resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    /// Weighted table entry that is not `percentage:name`.
    #[error("invalid behavior entry {0:?}: use percentage:name")]
    BehaviorSyntax(String),

    /// Weighted table percentage that is not a non-negative integer.
    #[error("invalid percentage {0:?}: expected a non-negative integer")]
    BehaviorPercent(String),

    /// Weighted table adds up to more than 100.
    #[error("the behavior total needs to be 100 or less, got {0}")]
    BehaviorTotal(u32),

    /// Behavior name that is not registered.
    #[error(transparent)]
    UnknownBehavior(#[from] UnknownBehavior),

    /// Protocol name that does not exist.
    #[error("{name:?} is an unknown protocol. Pick one of: {known}.")]
    UnknownProtocol { name: String, known: String },

    /// Behavior or protocol option failed validation.
    #[error(transparent)]
    Option(#[from] OptionError),

    /// Listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to set up the statsd client: {0}")]
    Statsd(io::Error),
}

/// Lookup of a behavior name that is not in the registry.
#[derive(Debug, Clone, Error)]
#[error("{name:?} is an unknown behavior. Pick one of: {known}.")]
pub struct UnknownBehavior {
    pub name: String,
    pub known: String,
}

/// Errors returned by the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    UnknownBehavior(#[from] UnknownBehavior),

    #[error(transparent)]
    InvalidOption(#[from] OptionError),
}

impl From<ControlError> for ConfigError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::UnknownBehavior(e) => e.into(),
            ControlError::InvalidOption(e) => e.into(),
        }
    }
}

/// Backend connection failures. They fail the current client connection only.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to backend {addr}: {source}")]
    Io { addr: SocketAddr, source: io::Error },

    #[error("timed out connecting to backend {addr}")]
    Timeout { addr: SocketAddr },
}

/// Failures of a single forward cycle. They tear down the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// The peer went away before a complete message arrived.
    #[error("peer closed the connection mid-message")]
    Truncated,

    #[error("malformed {protocol} message: {detail}")]
    Malformed {
        protocol: &'static str,
        detail: String,
    },

    #[error("{0} are not implemented")]
    NotImplemented(&'static str),
}

impl ProtocolError {
    pub(crate) fn malformed(protocol: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            detail: detail.into(),
        }
    }

    /// Short reason code used in log lines.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "socket_error",
            ProtocolError::Truncated => "truncated",
            ProtocolError::Malformed { .. } => "malformed",
            ProtocolError::NotImplemented(_) => "not_implemented",
        }
    }
}

/// Why a proxied connection ended early.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
