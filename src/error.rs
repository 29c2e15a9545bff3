//! Error types for dbkit.
//!
//! Every failure is tagged with the phase it occurred in (driver loading,
//! connecting, sending a request, interpreting the response, or converting
//! values) and carries the URI of the connection plus, where available, the
//! offending query text. Server-reported errors keep their SQLSTATE and can
//! be classified into a small set of causes.

use std::fmt;

use thiserror::Error;

/// Result type for dbkit operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// SQLSTATE causes
// ============================================================================

/// Categorical cause of a server-reported error, derived from its SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    NotNullViolation,
    ForeignKeyViolation,
    UniqueViolation,
    CheckViolation,
    ExclusionViolation,
    /// Some other 23xxx integrity-constraint violation.
    IntegrityConstraintViolation,
    SerializationFailure,
    DeadlockDetected,
    /// Some other 40xxx transaction rollback.
    TransactionRollback,
    DiskFull,
    OutOfMemory,
    TooManyConnections,
    /// Some other 53xxx resource exhaustion.
    InsufficientResources,
    Unknown,
}

/// Map a five-character SQLSTATE to its cause.
pub fn cause_of_sqlstate(code: &str) -> Cause {
    match code {
        "23502" => Cause::NotNullViolation,
        "23503" => Cause::ForeignKeyViolation,
        "23505" => Cause::UniqueViolation,
        "23514" => Cause::CheckViolation,
        "23P01" => Cause::ExclusionViolation,
        "40001" => Cause::SerializationFailure,
        "40P01" => Cause::DeadlockDetected,
        "53100" => Cause::DiskFull,
        "53200" => Cause::OutOfMemory,
        "53300" => Cause::TooManyConnections,
        c if c.starts_with("23") => Cause::IntegrityConstraintViolation,
        c if c.starts_with("40") => Cause::TransactionRollback,
        c if c.starts_with("53") => Cause::InsufficientResources,
        _ => Cause::Unknown,
    }
}

// ============================================================================
// Message carriers
// ============================================================================

/// An error reported by the server in an ErrorResponse.
#[derive(Debug, Clone)]
pub struct ServerMsg {
    pub severity: String,
    pub sqlstate: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerMsg {
    /// Categorical cause derived from the SQLSTATE.
    pub fn cause(&self) -> Cause {
        cause_of_sqlstate(&self.sqlstate)
    }
}

impl fmt::Display for ServerMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.sqlstate)?;
        if let Some(d) = &self.detail {
            write!(f, "; {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "; hint: {}", h)?;
        }
        Ok(())
    }
}

/// Transport-level fault on an established connection.
#[derive(Debug, Clone)]
pub enum ConnectionFault {
    /// The connection to the server was lost or could not be used. The only
    /// fault that triggers a transparent reconnect.
    Failure { detail: String },
    /// The byte stream violated the wire protocol. Never retried.
    Protocol { detail: String },
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionFault::Failure { detail } => write!(f, "connection failure: {}", detail),
            ConnectionFault::Protocol { detail } => write!(f, "protocol violation: {}", detail),
        }
    }
}

/// The payload of a failure: free-form text or a structured carrier whose
/// rendering dispatches on where the message came from.
#[derive(Debug, Clone)]
pub enum Msg {
    Plain(String),
    /// Failure while establishing a connection.
    Connect { detail: String },
    /// Fault on an established connection.
    Connection(ConnectionFault),
    /// Error result reported by the server.
    Result(ServerMsg),
}

impl Msg {
    pub fn plain(s: impl Into<String>) -> Self {
        Msg::Plain(s.into())
    }

    /// The server cause, when this message carries one.
    pub fn cause(&self) -> Option<Cause> {
        match self {
            Msg::Result(m) => Some(m.cause()),
            _ => None,
        }
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Msg::Plain(s) => f.write_str(s),
            Msg::Connect { detail } => write!(f, "connect: {}", detail),
            Msg::Connection(fault) => fault.fmt(f),
            Msg::Result(m) => m.fmt(f),
        }
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Errors produced by dbkit, tagged by phase.
#[derive(Debug, Error)]
pub enum Error {
    /// The URI could not be mapped to a driver.
    #[error("Cannot load driver for {uri}: {message}")]
    LoadRejected { uri: String, message: String },

    /// The driver refused to establish a connection.
    #[error("Failed to connect to {uri}: {message}")]
    ConnectFailed { uri: String, message: Msg },

    /// Connecting succeeded but session startup failed.
    #[error("Connected to {uri}, but session startup failed: {source}")]
    PostConnect {
        uri: String,
        #[source]
        source: Box<Error>,
    },

    /// Wire-level or transport failure during a send/await cycle.
    #[error("Request to {uri} failed: {message} (query: {query})")]
    RequestFailed {
        uri: String,
        query: String,
        message: Msg,
    },

    /// The server responded, but the response violated the request contract.
    #[error("Unexpected response from {uri}: {message} (query: {query})")]
    ResponseRejected {
        uri: String,
        query: String,
        message: Msg,
    },

    /// No encoder is available for a parameter of the given type.
    #[error("No parameter encoder for {type_name} (request to {uri})")]
    EncodeMissing {
        uri: String,
        query: String,
        type_name: String,
    },

    /// An encoder refused the supplied value.
    #[error("Cannot encode {type_name} parameter for {uri}: {message}")]
    EncodeRejected {
        uri: String,
        query: String,
        type_name: String,
        message: String,
    },

    /// No decoder is available for a row field of the given type.
    #[error("No row decoder for {type_name} (request to {uri})")]
    DecodeMissing {
        uri: String,
        query: String,
        type_name: String,
    },

    /// A decoder refused the cell contents the server sent.
    #[error("Cannot decode {type_name} field from {uri}: {message}")]
    DecodeRejected {
        uri: String,
        query: String,
        type_name: String,
        message: String,
    },

    /// The operation is not meaningful for the current response.
    #[error("Operation not supported for this response")]
    Unsupported,
}

impl Error {
    /// The categorical server cause, when one is attached.
    pub fn cause(&self) -> Option<Cause> {
        match self {
            Error::ConnectFailed { message, .. }
            | Error::RequestFailed { message, .. }
            | Error::ResponseRejected { message, .. } => message.cause(),
            Error::PostConnect { source, .. } => source.cause(),
            _ => None,
        }
    }

    /// True when this error means the connection itself was lost, which is
    /// the precondition for a transparent reconnect.
    pub(crate) fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::RequestFailed {
                message: Msg::Connection(ConnectionFault::Failure { .. }),
                ..
            }
        )
    }

    /// The URI the failing operation was addressed to, if any.
    pub fn uri(&self) -> Option<&str> {
        match self {
            Error::LoadRejected { uri, .. }
            | Error::ConnectFailed { uri, .. }
            | Error::PostConnect { uri, .. }
            | Error::RequestFailed { uri, .. }
            | Error::ResponseRejected { uri, .. }
            | Error::EncodeMissing { uri, .. }
            | Error::EncodeRejected { uri, .. }
            | Error::DecodeMissing { uri, .. }
            | Error::DecodeRejected { uri, .. } => Some(uri),
            Error::Unsupported => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_specific_codes() {
        assert_eq!(cause_of_sqlstate("23502"), Cause::NotNullViolation);
        assert_eq!(cause_of_sqlstate("23503"), Cause::ForeignKeyViolation);
        assert_eq!(cause_of_sqlstate("23505"), Cause::UniqueViolation);
        assert_eq!(cause_of_sqlstate("23514"), Cause::CheckViolation);
        assert_eq!(cause_of_sqlstate("23P01"), Cause::ExclusionViolation);
        assert_eq!(cause_of_sqlstate("40001"), Cause::SerializationFailure);
        assert_eq!(cause_of_sqlstate("40P01"), Cause::DeadlockDetected);
        assert_eq!(cause_of_sqlstate("53300"), Cause::TooManyConnections);
    }

    #[test]
    fn test_sqlstate_class_fallbacks() {
        assert_eq!(
            cause_of_sqlstate("23000"),
            Cause::IntegrityConstraintViolation
        );
        assert_eq!(cause_of_sqlstate("40003"), Cause::TransactionRollback);
        assert_eq!(cause_of_sqlstate("53000"), Cause::InsufficientResources);
        assert_eq!(cause_of_sqlstate("42601"), Cause::Unknown);
        assert_eq!(cause_of_sqlstate(""), Cause::Unknown);
    }

    #[test]
    fn test_connection_failure_detection() {
        let err = Error::RequestFailed {
            uri: "postgresql://h/d".into(),
            query: "SELECT 1".into(),
            message: Msg::Connection(ConnectionFault::Failure {
                detail: "broken pipe".into(),
            }),
        };
        assert!(err.is_connection_failure());

        let err = Error::RequestFailed {
            uri: "postgresql://h/d".into(),
            query: "SELECT 1".into(),
            message: Msg::Connection(ConnectionFault::Protocol {
                detail: "bad tag".into(),
            }),
        };
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn test_cause_travels_through_request_failed() {
        let err = Error::RequestFailed {
            uri: "postgresql://h/d".into(),
            query: "INSERT ...".into(),
            message: Msg::Result(ServerMsg {
                severity: "ERROR".into(),
                sqlstate: "23505".into(),
                message: "duplicate key".into(),
                detail: None,
                hint: None,
            }),
        };
        assert_eq!(err.cause(), Some(Cause::UniqueViolation));
    }
}
