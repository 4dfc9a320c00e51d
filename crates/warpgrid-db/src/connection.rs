//! Handle wrapper over the database proxy capability.

use warp_core::DatabaseProxy;

use crate::config::DbConfig;
use crate::error::{DbError, Operation};

/// An open proxied connection.
///
/// Once closed, explicitly or after a failed `send`/`recv`, every further
/// call fails locally with `Closed` and never reaches the host. Dropping
/// an open connection closes it.
pub struct Connection<P: DatabaseProxy> {
    proxy: P,
    handle: u64,
    closed: bool,
}

impl<P: DatabaseProxy> std::fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<P: DatabaseProxy> Connection<P> {
    /// Validate `config` and ask the host for a connection.
    pub fn open(proxy: P, config: &DbConfig) -> Result<Self, DbError> {
        let connect = config.to_connect_config()?;
        let handle = proxy
            .connect(&connect)
            .map_err(|e| DbError::new(Operation::Connect, e))?;
        tracing::debug!(
            handle,
            host = %connect.host,
            port = connect.port,
            database = %connect.database,
            protocol = %connect.protocol,
            "database connection opened"
        );
        Ok(Self {
            proxy,
            handle,
            closed: false,
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Forward `data` to the server. Returns the number of bytes accepted.
    pub fn send(&mut self, data: &[u8]) -> Result<u32, DbError> {
        if self.closed {
            return Err(DbError::closed(Operation::Send));
        }
        self.proxy.send(self.handle, data).map_err(|e| {
            let err = DbError::new(Operation::Send, e);
            self.abandon(&err);
            err
        })
    }

    /// Send all of `data`, looping over short writes.
    pub fn send_all(&mut self, mut data: &[u8]) -> Result<(), DbError> {
        while !data.is_empty() {
            let sent = self.send(data)? as usize;
            if sent == 0 {
                let err = DbError::new(
                    Operation::Send,
                    warp_core::DbProxyError::Closed("host accepted no bytes".into()),
                );
                self.abandon(&err);
                return Err(err);
            }
            data = &data[sent.min(data.len())..];
        }
        Ok(())
    }

    /// Read up to `max_bytes`. An empty result means nothing arrived
    /// before the host gave up waiting, or the server hung up.
    pub fn recv(&mut self, max_bytes: u32) -> Result<Vec<u8>, DbError> {
        if self.closed {
            return Err(DbError::closed(Operation::Recv));
        }
        self.proxy.recv(self.handle, max_bytes).map_err(|e| {
            let err = DbError::new(Operation::Recv, e);
            self.abandon(&err);
            err
        })
    }

    /// Return the connection to the host. A second close fails with
    /// `Closed` without contacting the host.
    pub fn close(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::closed(Operation::Close));
        }
        self.closed = true;
        self.proxy
            .close(self.handle)
            .map_err(|e| DbError::new(Operation::Close, e))
    }

    /// Best-effort close after a failed call. Its own error is dropped so
    /// the caller sees the original failure.
    pub(crate) fn abandon(&mut self, cause: &DbError) {
        self.closed = true;
        if let Err(e) = self.proxy.close(self.handle) {
            tracing::debug!(
                handle = self.handle,
                error = %e,
                original = %cause,
                "close after failed call also failed"
            );
        }
    }
}

impl<P: DatabaseProxy> Drop for Connection<P> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.proxy.close(self.handle);
        }
    }
}
