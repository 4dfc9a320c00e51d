//! Guest-facing connection settings.
//!
//! [`DbConfig`] uses the names application code expects (`username`, not the
//! wire-level `user`) and is validated in full before any host call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use warp_core::{ConnectConfig, DEFAULT_POOL_SIZE, DbProxyError, Protocol};

use crate::error::{DbError, Operation};

/// Prefix of the environment variables read by [`DbConfig::from_env`].
pub const ENV_PREFIX: &str = "WARPGRID_DB_";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    /// Defaults to the protocol's well-known port.
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub pool_size: Option<u32>,
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("protocol", &self.protocol)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl DbConfig {
    /// Postgres settings on the default port with no password.
    pub fn new(host: &str, database: &str, username: &str) -> Self {
        Self {
            host: host.to_string(),
            port: None,
            database: database.to_string(),
            username: username.to_string(),
            password: None,
            protocol: Protocol::Postgres,
            pool_size: None,
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self {
            port: Some(port),
            ..self
        }
    }

    pub fn with_password(self, password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..self
        }
    }

    pub fn with_protocol(self, protocol: Protocol) -> Self {
        Self { protocol, ..self }
    }

    pub fn with_pool_size(self, pool_size: u32) -> Self {
        Self {
            pool_size: Some(pool_size),
            ..self
        }
    }

    /// Read `WARPGRID_DB_HOST`, `_PORT`, `_DATABASE`, `_USERNAME`,
    /// `_PASSWORD`, `_PROTOCOL` and `_POOL_SIZE` from `vars`.
    ///
    /// `_NAME` and `_USER` are accepted as aliases for `_DATABASE` and
    /// `_USERNAME`. Nothing is checked beyond number parsing here;
    /// [`DbConfig::to_connect_config`] does the rest.
    pub fn from_env(vars: &HashMap<String, String>) -> Result<Self, DbError> {
        let get = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| vars.get(&format!("{ENV_PREFIX}{name}")))
                .cloned()
        };
        let invalid =
            |msg: String| DbError::new(Operation::Connect, DbProxyError::InvalidConfig(msg));

        let protocol = match get(&["PROTOCOL"]) {
            Some(p) => p
                .parse::<Protocol>()
                .map_err(|e| DbError::new(Operation::Connect, e))?,
            None => Protocol::default(),
        };
        let port = get(&["PORT"])
            .map(|p| {
                p.trim()
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("port '{p}' is not a number in 1..=65535")))
            })
            .transpose()?;
        let pool_size = get(&["POOL_SIZE"])
            .map(|p| {
                p.trim()
                    .parse::<u32>()
                    .map_err(|_| invalid(format!("pool size '{p}' is not a number")))
            })
            .transpose()?;

        Ok(Self {
            host: get(&["HOST"]).unwrap_or_default(),
            port,
            database: get(&["DATABASE", "NAME"]).unwrap_or_default(),
            username: get(&["USERNAME", "USER"]).unwrap_or_default(),
            password: get(&["PASSWORD"]),
            protocol,
            pool_size,
        })
    }

    /// Read the process environment. See [`DbConfig::from_env`].
    pub fn from_process_env() -> Result<Self, DbError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::from_env(&vars)
    }

    /// Map onto the capability's config shape and validate it.
    pub fn to_connect_config(&self) -> Result<ConnectConfig, DbError> {
        let config = ConnectConfig {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port.unwrap_or_else(|| self.protocol.default_port()),
            database: self.database.clone(),
            user: self.username.clone(),
            password: self.password.clone(),
            pool_size: self.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        };
        config
            .validate()
            .map_err(|e| DbError::new(Operation::Connect, e))?;
        Ok(config)
    }
}
