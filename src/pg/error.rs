//! Transport-level errors for the PostgreSQL driver.
//!
//! These stay internal to the driver; the dispatcher wraps them into the
//! crate-level taxonomy together with the URI and query context.

use std::fmt;
use std::io;

use crate::error::{ConnectionFault, Msg, ServerMsg};

pub(crate) type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failure while talking to the server.
#[derive(Debug)]
pub(crate) enum TransportError {
    /// I/O failure on the socket.
    Io(io::Error),
    /// The connection is closed or the server hung up.
    Closed,
    /// The byte stream violated the wire protocol.
    Protocol(String),
    /// Authentication was refused or could not be completed.
    Auth(String),
    /// The server reported an error during the startup sequence.
    Server(ServerMsg),
}

impl TransportError {
    /// The crate-level message carrier for this failure.
    pub(crate) fn into_msg(self) -> Msg {
        match self {
            TransportError::Io(e) => Msg::Connection(ConnectionFault::Failure {
                detail: e.to_string(),
            }),
            TransportError::Closed => Msg::Connection(ConnectionFault::Failure {
                detail: "connection closed".to_string(),
            }),
            TransportError::Protocol(detail) => {
                Msg::Connection(ConnectionFault::Protocol { detail })
            }
            TransportError::Auth(detail) => Msg::Connect { detail },
            TransportError::Server(m) => Msg::Result(m),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Closed => f.write_str("connection closed"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransportError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            TransportError::Server(m) => m.fmt(f),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}
