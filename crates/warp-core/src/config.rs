//! warp.toml configuration parser for the `[database_proxy]` table.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DbProxyError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarpConfig {
    pub database_proxy: Option<DatabaseProxyConfig>,
}

/// User-facing pool settings. Durations are strings such as `"250ms"`,
/// `"5s"` or `"2m"`; unset fields fall back to the host defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseProxyConfig {
    pub enabled: Option<bool>,
    pub max_pool_size: Option<u32>,
    pub idle_timeout: Option<String>,
    pub health_check_interval: Option<String>,
    pub connect_timeout: Option<String>,
    pub recv_timeout: Option<String>,
    pub probe_timeout: Option<String>,
    pub probe_on_checkout: Option<bool>,
    pub probe_on_checkin: Option<bool>,
    pub tls: Option<bool>,
    pub verify_certificates: Option<bool>,
    pub drain_timeout: Option<String>,
    pub max_frame_size: Option<usize>,
    /// Authenticate Postgres sockets on the host (default) or pass the
    /// startup exchange through to the guest.
    pub host_handshake: Option<bool>,
}

impl WarpConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WarpConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string: `"150ms"`, `"5s"`, `"2m"`, `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, DbProxyError> {
    let s = s.trim();
    let invalid = || DbProxyError::InvalidConfig(format!("invalid duration '{s}'"));

    let (digits, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
        .ok_or_else(invalid)?;
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let scale = |factor: u64| {
        value.checked_mul(factor).map(Duration::from_secs).ok_or_else(|| {
            DbProxyError::InvalidConfig(format!("duration '{s}' is out of range"))
        })
    };
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => scale(60),
        "h" => scale(3600),
        _ => Err(invalid()),
    }
}
