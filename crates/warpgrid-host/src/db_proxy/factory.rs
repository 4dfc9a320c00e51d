//! Protocol dispatch for new connections.

use warp_core::{DbProxyError, Protocol};

use super::mysql::MysqlConnectionFactory;
use super::postgres::PostgresConnectionFactory;
use super::redis::RedisConnectionFactory;
use super::tcp::{TcpConnectionFactory, TlsConfig};
use super::{ConnectionBackend, ConnectionFactory, PoolConfig, PoolKey};

/// Routes each dial to the factory for the key's protocol. All three share
/// one TCP/TLS dialer.
#[derive(Debug, Clone)]
pub struct ProtocolConnectionFactory {
    postgres: PostgresConnectionFactory,
    mysql: MysqlConnectionFactory,
    redis: RedisConnectionFactory,
}

impl ProtocolConnectionFactory {
    pub fn new(tcp: TcpConnectionFactory, host_handshake: bool, max_frame_size: usize) -> Self {
        Self {
            postgres: PostgresConnectionFactory::new(tcp.clone(), host_handshake, max_frame_size),
            mysql: MysqlConnectionFactory::new(tcp.clone()),
            redis: RedisConnectionFactory::new(tcp),
        }
    }

    pub fn from_pool_config(config: &PoolConfig) -> Result<Self, DbProxyError> {
        let tcp = if config.use_tls {
            TcpConnectionFactory::with_tls(
                config.recv_timeout,
                config.connect_timeout,
                TlsConfig::for_verification(config.verify_certificates)?,
            )
        } else {
            TcpConnectionFactory::plain(config.recv_timeout, config.connect_timeout)
        };
        Ok(Self::new(tcp, config.host_handshake, config.max_frame_size))
    }
}

impl ConnectionFactory for ProtocolConnectionFactory {
    fn connect(
        &self,
        key: &PoolKey,
        password: Option<&str>,
    ) -> Result<Box<dyn ConnectionBackend>, DbProxyError> {
        match key.protocol {
            Protocol::Postgres => self.postgres.connect(key, password),
            Protocol::Mysql => self.mysql.connect(key, password),
            Protocol::Redis => self.redis.connect(key, password),
        }
    }
}
