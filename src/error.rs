//! Contains the `Error` and `Result` types that `reql` uses.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// The result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while driving a ReQL connection.
///
/// The inner [`ErrorKind`] is boxed to keep `Error` small and cheap to move
/// through `Result`s; it is further wrapped so that `Error` stays `Clone`,
/// which lets a single connection failure be delivered to every waiter and
/// cursor that was outstanding when it happened.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: Box<ErrorKind>,
    #[source]
    source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    pub(crate) fn with_source(kind: ErrorKind, source: Error) -> Self {
        Self {
            kind: Box::new(kind),
            source: Some(Box::new(source)),
        }
    }

    /// The specific kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn auth(mechanism: &str, reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Auth {
            message: format!("{} failure: {}", mechanism, reason),
        })
    }

    pub(crate) fn invalid_response(mechanism: &str) -> Self {
        Self::auth(mechanism, "invalid server response")
    }

    pub(crate) fn auth_with_code(mechanism: &str, reason: impl fmt::Display, code: i64) -> Self {
        Self::auth(mechanism, format!("{} (error_code {})", reason, code))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol {
            message: message.into(),
        })
    }

    pub(crate) fn driver(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Driver {
            message: message.into(),
        })
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Driver {
            message: format!("internal error: {}", message.into()),
        })
    }

    pub(crate) fn connection_closed(cause: Option<Error>) -> Self {
        Self::new(ErrorKind::ConnectionClosed {
            cause: cause.map(Box::new),
        })
    }

    pub(crate) fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    pub(crate) fn io(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(err)))
    }

    /// Whether this error originated from the authentication handshake.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Auth { .. })
    }

    /// Whether this error represents a client-side deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Timeout)
    }

    /// Whether this error indicates the connection is no longer usable.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionClosed { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Protocol {
            message: format!("malformed query/response JSON: {}", err),
        })
    }
}

/// The taxonomy of errors surfaced by this crate, mirroring the ReQL error
/// hierarchy: driver-side errors distinguish themselves from server-reported
/// ones, and server-reported runtime errors carry the server's own
/// sub-classification.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A driver-side precondition was violated, or the connection could not
    /// be used as requested (e.g. converting a changefeed to a list).
    #[error("driver error: {message}")]
    Driver { message: String },

    /// Authentication (the SCRAM-SHA-256 handshake) failed.
    #[error("auth error: {message}")]
    Auth { message: String },

    /// A frame or JSON payload violated the wire protocol (e.g. exceeded the
    /// maximum frame length, or failed to parse).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The server reported a `CLIENT_ERROR` response.
    #[error("client error: {message}")]
    Client {
        message: String,
        backtrace: Option<serde_json::Value>,
    },

    /// The server reported a `COMPILE_ERROR` response.
    #[error("compile error: {message}")]
    Compile {
        message: String,
        backtrace: Option<serde_json::Value>,
    },

    /// The driver itself refused to construct a term (e.g. a recursion-depth
    /// budget in term conversion was exhausted).
    #[error("driver compile error: {message}")]
    DriverCompile { message: String },

    /// The server reported a `RUNTIME_ERROR` response, sub-classified by the
    /// server's `error_type`.
    #[error("runtime error: {0}")]
    Runtime(RuntimeErrorKind),

    /// The underlying connection is no longer usable; every outstanding
    /// waiter and cursor is failed with this variant when it occurs.
    #[error("connection closed{}", cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    ConnectionClosed { cause: Option<Box<Error>> },

    /// A caller-supplied deadline expired before a response arrived.
    #[error("operation timed out")]
    Timeout,

    /// A lower-level I/O error occurred on the socket.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

/// Sub-classification of a server-reported `RUNTIME_ERROR`, keyed on the
/// wire protocol's `error_type` field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeErrorType {
    Internal,
    ResourceLimit,
    QueryLogic,
    NonExistence,
    OpFailed,
    OpIndeterminate,
    User,
    PermissionError,
}

impl RuntimeErrorType {
    pub(crate) fn from_wire(code: i64) -> Self {
        match code {
            1000000 => RuntimeErrorType::Internal,
            2000000 => RuntimeErrorType::ResourceLimit,
            3000000 => RuntimeErrorType::QueryLogic,
            3100000 => RuntimeErrorType::NonExistence,
            4100000 => RuntimeErrorType::OpFailed,
            4200000 => RuntimeErrorType::OpIndeterminate,
            5000000 => RuntimeErrorType::User,
            6000000 => RuntimeErrorType::PermissionError,
            _ => RuntimeErrorType::Internal,
        }
    }
}

impl fmt::Display for RuntimeErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeErrorType::Internal => "INTERNAL",
            RuntimeErrorType::ResourceLimit => "RESOURCE_LIMIT",
            RuntimeErrorType::QueryLogic => "QUERY_LOGIC",
            RuntimeErrorType::NonExistence => "NON_EXISTENCE",
            RuntimeErrorType::OpFailed => "OP_FAILED",
            RuntimeErrorType::OpIndeterminate => "OP_INDETERMINATE",
            RuntimeErrorType::User => "USER",
            RuntimeErrorType::PermissionError => "PERMISSION_ERROR",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Error)]
#[error("[{error_type}] {message}")]
pub struct RuntimeErrorKind {
    pub error_type: RuntimeErrorType,
    pub message: String,
    pub backtrace: Option<serde_json::Value>,
}
