//! The single error type guests see.

use std::fmt;

use thiserror::Error;
use warp_core::{DbProxyError, ErrorKind};
use warpgrid_pgwire::{ErrorFields, PgWireError};

/// SDK operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Send,
    Recv,
    Close,
    Query,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Send => "send",
            Operation::Recv => "recv",
            Operation::Close => "close",
            Operation::Query => "query",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Postgres `ErrorResponse`, flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl From<&ErrorFields> for ServerError {
    fn from(fields: &ErrorFields) -> Self {
        Self {
            severity: fields.severity().unwrap_or("ERROR").to_string(),
            code: fields.code().unwrap_or_default().to_string(),
            message: fields.message().unwrap_or_default().to_string(),
            detail: fields.detail().map(str::to_string),
            hint: fields.hint().map(str::to_string),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)
    }
}

/// Underlying reason for a [`DbError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Cause {
    #[error(transparent)]
    Host(#[from] DbProxyError),

    #[error("server error {0}")]
    Server(ServerError),

    #[error("bad server response: {0}")]
    Codec(#[from] PgWireError),
}

/// Any failure of an SDK call, tagged with the operation that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {cause}")]
pub struct DbError {
    pub operation: Operation,
    #[source]
    pub cause: Cause,
}

impl DbError {
    pub fn new(operation: Operation, cause: impl Into<Cause>) -> Self {
        Self {
            operation,
            cause: cause.into(),
        }
    }

    pub(crate) fn closed(operation: Operation) -> Self {
        Self::new(
            operation,
            DbProxyError::Closed("connection already closed".into()),
        )
    }

    pub(crate) fn server(operation: Operation, fields: &ErrorFields) -> Self {
        Self::new(operation, Cause::Server(ServerError::from(fields)))
    }

    /// Capability error kind, when the failure came from the host.
    pub fn kind(&self) -> Option<ErrorKind> {
        match &self.cause {
            Cause::Host(e) => Some(e.kind()),
            Cause::Server(_) | Cause::Codec(_) => None,
        }
    }

    /// SQLSTATE of a server-reported error.
    pub fn sqlstate(&self) -> Option<&str> {
        match &self.cause {
            Cause::Server(e) => Some(&e.code),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.kind() == Some(ErrorKind::Closed)
    }

    /// Worth retrying later: the pool was full, the server refused, or a
    /// deadline passed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            Some(ErrorKind::PoolExhausted | ErrorKind::ConnectionRefused | ErrorKind::Timeout)
        )
    }
}
