//! Database proxy host functions.
//!
//! Implements the [`DatabaseProxy`] capability for one guest instance,
//! delegating connection management to the shared [`ConnectionPoolManager`].
//!
//! # Connection flow
//!
//! ```text
//! Guest calls connect(config)
//!   → DbProxyHost delegates to ConnectionPoolManager::checkout()
//!     → Pool has idle conn → probe → Ok(handle)
//!     → Pool exhausted    → Err(PoolExhausted)
//!     → Under capacity    → dial + handshake → Ok(handle)
//!
//! Guest calls send(handle, data) / recv(handle, max_bytes)
//!   → DbProxyHost delegates to ConnectionPoolManager::send/recv()
//!
//! Guest calls close(handle)
//!   → DbProxyHost delegates to ConnectionPoolManager::release()
//!     → Healthy conn → returned to pool
//!     → Unhealthy   → destroyed
//!
//! Instance ends (normally, trap, or cancellation)
//!   → DbProxyHost::teardown() / Drop closes every handle still open
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use warp_core::{ConnectConfig, DatabaseProxy, DbProxyError};

use super::{ConnectionPoolManager, InstanceId, Received};

/// Host-side implementation of the database proxy capability for one guest
/// instance.
///
/// Bridges the synchronous capability calls to the async pool manager via
/// `tokio::task::block_in_place`, so it must be driven from a multi-thread
/// runtime worker or from a plain thread.
pub struct DbProxyHost {
    pool_manager: Arc<ConnectionPoolManager>,
    /// Tokio runtime handle for running async operations from sync context.
    runtime_handle: tokio::runtime::Handle,
    instance: InstanceId,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for DbProxyHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbProxyHost")
            .field("instance", &self.instance)
            .field("torn_down", &self.torn_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DbProxyHost {
    /// Create a host for a new guest instance on the given pool manager.
    pub fn new(
        pool_manager: Arc<ConnectionPoolManager>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        let instance = pool_manager.register_instance();
        tracing::debug!(instance = instance, "database proxy attached to instance");
        Self {
            pool_manager,
            runtime_handle,
            instance,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        let handle = self.runtime_handle.clone();
        tokio::task::block_in_place(|| handle.block_on(fut))
    }

    fn check_live(&self) -> Result<(), DbProxyError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(DbProxyError::Closed("instance has been torn down".into()));
        }
        Ok(())
    }

    /// Like [`DatabaseProxy::recv`], also reporting whether the peer closed.
    pub fn recv_with_status(
        &self,
        conn_handle: u64,
        max_bytes: u32,
    ) -> Result<Received, DbProxyError> {
        self.check_live()?;
        let mgr = Arc::clone(&self.pool_manager);
        self.block_on(mgr.recv_with_status(conn_handle, max_bytes as usize))
    }

    /// Force-close every handle this instance still holds. Later calls on
    /// this host fail with `Closed`. Returns how many handles were closed.
    pub fn teardown(&self) -> usize {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mgr = Arc::clone(&self.pool_manager);
        self.block_on(mgr.teardown_instance(self.instance))
    }
}

impl Drop for DbProxyHost {
    fn drop(&mut self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Drop may run on a runtime worker, so hand the work to the runtime
        // instead of blocking here.
        let mgr = Arc::clone(&self.pool_manager);
        let instance = self.instance;
        self.runtime_handle.spawn(async move {
            mgr.teardown_instance(instance).await;
        });
    }
}

impl DatabaseProxy for DbProxyHost {
    fn connect(&self, config: &ConnectConfig) -> Result<u64, DbProxyError> {
        tracing::debug!(
            instance = self.instance,
            protocol = %config.protocol,
            host = %config.host,
            port = config.port,
            database = %config.database,
            user = %config.user,
            "db_proxy intercept: connect"
        );
        self.check_live()?;
        // Reject before touching the runtime.
        config.validate()?;

        let mgr = Arc::clone(&self.pool_manager);
        self.block_on(mgr.checkout(self.instance, config))
    }

    fn send(&self, conn_handle: u64, data: &[u8]) -> Result<u32, DbProxyError> {
        tracing::debug!(
            handle = conn_handle,
            bytes = data.len(),
            "db_proxy intercept: send"
        );
        self.check_live()?;

        let mgr = Arc::clone(&self.pool_manager);
        let sent = self.block_on(mgr.send(conn_handle, data))?;
        u32::try_from(sent)
            .map_err(|_| DbProxyError::Protocol(format!("sent {sent} bytes in one call")))
    }

    fn recv(&self, conn_handle: u64, max_bytes: u32) -> Result<Vec<u8>, DbProxyError> {
        tracing::debug!(
            handle = conn_handle,
            max_bytes = max_bytes,
            "db_proxy intercept: recv"
        );
        Ok(self.recv_with_status(conn_handle, max_bytes)?.data)
    }

    fn close(&self, conn_handle: u64) -> Result<(), DbProxyError> {
        tracing::debug!(handle = conn_handle, "db_proxy intercept: close");
        self.check_live()?;

        let mgr = Arc::clone(&self.pool_manager);
        self.block_on(mgr.release(conn_handle))
    }
}
