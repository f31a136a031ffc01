//! Error taxonomy for the server.
//!
//! Framing problems surface as [`ProtocolError`], application contract
//! violations as [`AppError`], and handshake problems as [`LifespanError`].
//! Everything that can stop [`crate::server::Server::serve`] is folded into
//! [`ServerError`].

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A violation of HTTP/1.1 framing or of the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The peer sent something we could not accept.
    #[error("invalid HTTP request: {0}")]
    Remote(String),
    /// We were asked to emit something the protocol does not allow.
    #[error("local protocol violation: {0}")]
    Local(String),
}

impl ProtocolError {
    pub fn remote(msg: impl Into<String>) -> Self {
        ProtocolError::Remote(msg.into())
    }

    pub fn local(msg: impl Into<String>) -> Self {
        ProtocolError::Local(msg.into())
    }

    /// True when the peer is to blame.
    pub fn is_remote(&self) -> bool {
        matches!(self, ProtocolError::Remote(_))
    }
}

/// Returned to the application when a `send` call breaks the contract.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Expected ASGI message '{expected}', but got '{got}'.")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Unexpected ASGI message '{0}' sent, after response already completed.")]
    AfterComplete(&'static str),

    #[error("invalid HTTP status code {0}")]
    InvalidStatus(u16),

    #[error("Got invalid state transition on lifespan protocol: '{0}'")]
    InvalidLifespanMessage(&'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server side of the channel is gone.
    #[error("connection closed")]
    Closed,
}

/// Failure of the startup/shutdown handshake. Always fatal to the process.
#[derive(Debug, Error)]
pub enum LifespanError {
    #[error("application startup failed: {0}")]
    StartupFailed(String),

    #[error("application shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("lifespan {phase} did not complete within {timeout:?}")]
    Timeout {
        phase: &'static str,
        timeout: Duration,
    },

    #[error("exception in 'lifespan' protocol: {0}")]
    Crashed(String),

    #[error("Got invalid state transition on lifespan protocol: '{0}'")]
    InvalidTransition(&'static str),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lifespan(#[from] LifespanError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
