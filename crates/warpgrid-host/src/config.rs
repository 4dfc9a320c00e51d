//! ShimConfig: deployment config for the database proxy.
//!
//! Turns the user-facing `[database_proxy]` table of `warp.toml` into the
//! host's [`PoolConfig`]. Anything left unset keeps the host default.

use std::path::Path;

use warp_core::config::{DatabaseProxyConfig, WarpConfig, parse_duration};
use warp_core::DbProxyError;

use crate::db_proxy::PoolConfig;

/// Host-side shim configuration for a deployment.
#[derive(Debug, Clone, Default)]
pub struct ShimConfig {
    /// Enable the database proxy shim.
    pub database_proxy: bool,
    /// Database connection pool configuration.
    pub pool_config: PoolConfig,
}

impl ShimConfig {
    /// Create a ShimConfig from a parsed `warp.toml`.
    ///
    /// A present `[database_proxy]` table enables the shim unless it says
    /// `enabled = false`.
    pub fn from_warp_config(config: &WarpConfig) -> Result<Self, DbProxyError> {
        let Some(table) = &config.database_proxy else {
            return Ok(Self::default());
        };
        Ok(Self {
            database_proxy: table.enabled.unwrap_or(true),
            pool_config: PoolConfig::try_from(table)?,
        })
    }

    /// Read and convert a `warp.toml` from disk.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let warp = WarpConfig::from_file(path)?;
        let config = Self::from_warp_config(&warp)?;
        tracing::info!(
            path = %path.display(),
            enabled = config.database_proxy,
            max_pool_size = config.pool_config.max_size,
            tls = config.pool_config.use_tls,
            "loaded database proxy config"
        );
        Ok(config)
    }

    /// Builder method: set database pool configuration.
    pub fn with_pool_config(self, pool_config: PoolConfig) -> Self {
        Self {
            pool_config,
            ..self
        }
    }
}

impl TryFrom<&DatabaseProxyConfig> for PoolConfig {
    type Error = DbProxyError;

    fn try_from(table: &DatabaseProxyConfig) -> Result<Self, Self::Error> {
        let defaults = PoolConfig::default();
        let duration = |value: &Option<String>, fallback| match value {
            Some(s) => parse_duration(s),
            None => Ok(fallback),
        };

        let max_size = match table.max_pool_size {
            Some(0) => {
                return Err(DbProxyError::InvalidConfig(
                    "max_pool_size must be at least 1".into(),
                ));
            }
            Some(n) => n as usize,
            None => defaults.max_size,
        };
        if table.max_frame_size == Some(0) {
            return Err(DbProxyError::InvalidConfig(
                "max_frame_size must be at least 1".into(),
            ));
        }

        Ok(Self {
            max_size,
            idle_timeout: duration(&table.idle_timeout, defaults.idle_timeout)?,
            health_check_interval: duration(
                &table.health_check_interval,
                defaults.health_check_interval,
            )?,
            connect_timeout: duration(&table.connect_timeout, defaults.connect_timeout)?,
            recv_timeout: duration(&table.recv_timeout, defaults.recv_timeout)?,
            probe_timeout: duration(&table.probe_timeout, defaults.probe_timeout)?,
            probe_on_checkout: table.probe_on_checkout.unwrap_or(defaults.probe_on_checkout),
            probe_on_checkin: table.probe_on_checkin.unwrap_or(defaults.probe_on_checkin),
            use_tls: table.tls.unwrap_or(defaults.use_tls),
            verify_certificates: table
                .verify_certificates
                .unwrap_or(defaults.verify_certificates),
            drain_timeout: duration(&table.drain_timeout, defaults.drain_timeout)?,
            max_frame_size: table.max_frame_size.unwrap_or(defaults.max_frame_size),
            host_handshake: table.host_handshake.unwrap_or(defaults.host_handshake),
        })
    }
}
