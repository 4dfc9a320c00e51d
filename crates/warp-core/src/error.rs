//! Error taxonomy for the database proxy capability.

use thiserror::Error;

/// Errors reported across the database proxy boundary.
///
/// Validation errors (`InvalidConfig`) are raised before any I/O. Every
/// other variant comes from the host servicing a `connect`, `send`, `recv`
/// or `close` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbProxyError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(u64),
}

impl DbProxyError {
    /// The out-of-band error kind signaled to the guest.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbProxyError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            DbProxyError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            DbProxyError::Timeout(_) => ErrorKind::Timeout,
            DbProxyError::Protocol(_) => ErrorKind::ProtocolError,
            DbProxyError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            DbProxyError::Closed(_) | DbProxyError::InvalidHandle(_) => ErrorKind::Closed,
        }
    }
}

/// Wire-level error kinds, one per entry of the capability error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionRefused,
    Timeout,
    ProtocolError,
    PoolExhausted,
    Closed,
    InvalidConfig,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionRefused => "connection-refused",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolError => "protocol-error",
            ErrorKind::PoolExhausted => "pool-exhausted",
            ErrorKind::Closed => "closed",
            ErrorKind::InvalidConfig => "invalid-config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_wire_names() {
        assert_eq!(ErrorKind::ConnectionRefused.to_string(), "connection-refused");
        assert_eq!(ErrorKind::ProtocolError.to_string(), "protocol-error");
        assert_eq!(ErrorKind::PoolExhausted.to_string(), "pool-exhausted");
        assert_eq!(ErrorKind::InvalidConfig.to_string(), "invalid-config");
    }

    #[test]
    fn invalid_handle_surfaces_as_closed() {
        assert_eq!(DbProxyError::InvalidHandle(7).kind(), ErrorKind::Closed);
        assert_eq!(
            DbProxyError::Closed("handle 7".into()).kind(),
            ErrorKind::Closed
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = DbProxyError::PoolExhausted("db.local:5432/app (3/3)".into());
        assert_eq!(
            err.to_string(),
            "connection pool exhausted: db.local:5432/app (3/3)"
        );
    }
}
