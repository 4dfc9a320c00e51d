//! The database proxy capability: four synchronous calls guests may make.

use std::sync::Arc;

use crate::error::DbProxyError;
use crate::types::ConnectConfig;

/// Host-exposed database proxy operations.
///
/// Handles are opaque 64-bit values valid strictly between a successful
/// `connect` and the matching `close`. Bytes are forwarded without
/// interpretation in both directions.
pub trait DatabaseProxy {
    /// Check out a pooled connection for `config`. Returns its handle.
    fn connect(&self, config: &ConnectConfig) -> Result<u64, DbProxyError>;

    /// Write `data` to the connection. Returns the number of bytes accepted.
    fn send(&self, handle: u64, data: &[u8]) -> Result<u32, DbProxyError>;

    /// Read up to `max_bytes` of whatever the peer has sent.
    fn recv(&self, handle: u64, max_bytes: u32) -> Result<Vec<u8>, DbProxyError>;

    /// Release the handle. The socket is reused or discarded by the host.
    fn close(&self, handle: u64) -> Result<(), DbProxyError>;
}

impl<T: DatabaseProxy + ?Sized> DatabaseProxy for &T {
    fn connect(&self, config: &ConnectConfig) -> Result<u64, DbProxyError> {
        (**self).connect(config)
    }

    fn send(&self, handle: u64, data: &[u8]) -> Result<u32, DbProxyError> {
        (**self).send(handle, data)
    }

    fn recv(&self, handle: u64, max_bytes: u32) -> Result<Vec<u8>, DbProxyError> {
        (**self).recv(handle, max_bytes)
    }

    fn close(&self, handle: u64) -> Result<(), DbProxyError> {
        (**self).close(handle)
    }
}

impl<T: DatabaseProxy + ?Sized> DatabaseProxy for Arc<T> {
    fn connect(&self, config: &ConnectConfig) -> Result<u64, DbProxyError> {
        (**self).connect(config)
    }

    fn send(&self, handle: u64, data: &[u8]) -> Result<u32, DbProxyError> {
        (**self).send(handle, data)
    }

    fn recv(&self, handle: u64, max_bytes: u32) -> Result<Vec<u8>, DbProxyError> {
        (**self).recv(handle, max_bytes)
    }

    fn close(&self, handle: u64) -> Result<(), DbProxyError> {
        (**self).close(handle)
    }
}
