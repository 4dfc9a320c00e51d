//! Shared types for the database proxy capability.

use serde::{Deserialize, Serialize};

use crate::error::DbProxyError;

/// Default per-key pool size when a config does not specify one.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Wire protocol spoken over a proxied connection.
///
/// The host uses this to key pools separately and to pick the handshake
/// and health-probe strategy. Query traffic is never parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// PostgreSQL v3 wire protocol (default).
    #[default]
    Postgres,
    /// MySQL client/server protocol.
    #[serde(alias = "MySQL")]
    Mysql,
    /// Redis RESP protocol.
    Redis,
}

impl Protocol {
    /// Well-known server port for this protocol.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Postgres => 5432,
            Protocol::Mysql => 3306,
            Protocol::Redis => 6379,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Postgres => write!(f, "postgres"),
            Protocol::Mysql => write!(f, "mysql"),
            Protocol::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = DbProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Protocol::Postgres),
            "mysql" => Ok(Protocol::Mysql),
            "redis" => Ok(Protocol::Redis),
            other => Err(DbProxyError::InvalidConfig(format!(
                "unknown protocol '{other}'"
            ))),
        }
    }
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

/// Connection request passed to `DatabaseProxy::connect`.
///
/// Validated once, before any network action. The `user` is part of the
/// pool key so authenticated sockets are never shared across credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl ConnectConfig {
    /// Postgres config with no password and the default pool size.
    pub fn new(host: &str, port: u16, database: &str, user: &str) -> Self {
        Self {
            protocol: Protocol::Postgres,
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_protocol(self, protocol: Protocol) -> Self {
        Self { protocol, ..self }
    }

    pub fn with_password(self, password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..self
        }
    }

    pub fn with_pool_size(self, pool_size: u32) -> Self {
        Self { pool_size, ..self }
    }

    /// Check every field that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), DbProxyError> {
        if self.host.trim().is_empty() {
            return Err(DbProxyError::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(DbProxyError::InvalidConfig(
                "port must be between 1 and 65535".into(),
            ));
        }
        if self.database.is_empty() {
            return Err(DbProxyError::InvalidConfig(
                "database must not be empty".into(),
            ));
        }
        if self.user.is_empty() {
            return Err(DbProxyError::InvalidConfig("user must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(DbProxyError::InvalidConfig(
                "pool_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// Manual impl so the password never reaches logs.
impl std::fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("pool_size", &self.pool_size)
            .finish()
    }
}
