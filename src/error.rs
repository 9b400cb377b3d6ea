//! Errors surfaced to applications and to the session owner

use std::fmt;

use crate::protocol::{ProtocolError, ReasonCode};

/// Why a session's inbound state was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndCause {
    /// The session was closed by the local client
    Closed,
    /// The broker reported that no session state was kept
    NotPresent,
    /// The connection was lost and the session expired
    Expired,
    /// A protocol violation tore down the connection
    ProtocolError,
}

impl fmt::Display for SessionEndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session closed"),
            Self::NotPresent => write!(f, "session not present on the broker"),
            Self::Expired => write!(f, "session expired"),
            Self::ProtocolError => write!(f, "session ended by a protocol error"),
        }
    }
}

/// Terminal error of a publish flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The session ended while the flow was active
    SessionEnded(SessionEndCause),
    /// Every subscription of the flow was rejected by the broker
    SubscribeRejected(ReasonCode),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionEnded(cause) => write!(f, "flow ended: {}", cause),
            Self::SubscribeRejected(code) => write!(f, "subscribe rejected: {}", code),
        }
    }
}

impl std::error::Error for FlowError {}

/// Errors returned through a [`SessionHandle`](crate::session::SessionHandle)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session task is no longer running
    Closed,
    /// The broker violated the protocol; the connection was disconnected
    Protocol(ProtocolError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session task closed"),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}
