//! Error type for session operations and reported session events.

use stompkit_protocol::{Command, Frame, Version};
use thiserror::Error;

use crate::SessionState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("codec error: {0}")]
    Codec(#[from] stompkit_protocol::Error),

    #[error("unknown frame received: {}", .0.command())]
    UnknownFrame(Box<Frame>),

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("transaction {0} is already active")]
    TransactionActive(String),

    #[error("no transaction is active")]
    NoTransaction,

    #[error("unknown subscription {0}")]
    UnknownSubscription(String),

    #[error("{0} is not supported by STOMP {1}")]
    Unsupported(&'static str, Version),

    #[error("no subscription for message addressed to {0}")]
    DispatchMiss(String),

    #[error("frame is missing the '{0}' header")]
    MissingHeader(&'static str),

    #[error("unexpected {command} frame while session is {state}")]
    UnexpectedFrame {
        command: Command,
        state: SessionState,
    },

    #[error("broker selected a version that was not offered: {0}")]
    VersionMismatch(String),

    #[error("broker sent ERROR: {}", .0.get("message").unwrap_or("(no message header)"))]
    ErrorFrame(Box<Frame>),

    #[error("channel error: {0}")]
    Channel(#[from] std::io::Error),

    #[error("channel disconnected: {reason} (code {code})")]
    Disconnected { reason: String, code: u16 },

    #[error("no receipt for {0} before the timeout")]
    ReceiptTimeout(String),

    #[error("a Tokio runtime is required to connect")]
    NoRuntime,
}

impl SessionError {
    /// Operation invoked in a state or situation that forbids it; nothing was sent
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidState { .. }
                | SessionError::TransactionActive(_)
                | SessionError::NoTransaction
                | SessionError::UnknownSubscription(_)
                | SessionError::Unsupported(..)
        )
    }

    /// Error that ended the session's lifecycle
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::ErrorFrame(_)
                | SessionError::Channel(_)
                | SessionError::Disconnected { .. }
                | SessionError::VersionMismatch(_)
        )
    }
}

/// Map a decode failure onto the session's taxonomy
pub(crate) fn from_decode(error: stompkit_protocol::Error) -> SessionError {
    match error {
        stompkit_protocol::Error::UnknownCommand(frame) => SessionError::UnknownFrame(frame),
        other => SessionError::Codec(other),
    }
}
