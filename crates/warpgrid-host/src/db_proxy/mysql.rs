//! MySQL-specific connection backend and factory.
//!
//! Wraps a generic [`ConnectionBackend`] (typically a TCP backend) with
//! MySQL-aware health checking using the `COM_PING` command. All other
//! operations (send, recv, close) are pure byte passthrough: the guest
//! performs the MySQL handshake and speaks the wire protocol directly.
//!
//! Because the login belongs to the guest, a MySQL socket is never handed
//! to a second guest: check-in closes it instead of pooling it, so the
//! `COM_PING` check below only runs when a caller asks for one directly.
//!
//! # MySQL COM_PING Protocol
//!
//! ```text
//! Client → Server:
//!   [payload_len: 3 bytes LE] [seq_id: 1 byte] [COM_PING: 0x0e]
//!   = [0x01, 0x00, 0x00, 0x00, 0x0e]
//!
//! Server → Client (OK):
//!   [payload_len: 3 bytes LE] [seq_id: 1 byte] [0x00 = OK] ...
//!
//! Server → Client (ERR):
//!   [payload_len: 3 bytes LE] [seq_id: 1 byte] [0xff = ERR] ...
//! ```

use std::time::Duration;

use warp_core::DbProxyError;

use super::tcp::TcpConnectionFactory;
use super::{ConnectionBackend, ConnectionFactory, PoolKey};

/// MySQL COM_PING command code.
const COM_PING: u8 = 0x0e;

/// A MySQL COM_PING packet: 3-byte payload length (1) + sequence id (0) + command byte.
const COM_PING_PACKET: [u8; 5] = [0x01, 0x00, 0x00, 0x00, COM_PING];

/// MySQL packet header size (3 bytes length + 1 byte sequence).
const MYSQL_HEADER_SIZE: usize = 4;

/// MySQL OK response marker (first byte of payload).
const OK_MARKER: u8 = 0x00;

// ── MysqlBackend ─────────────────────────────────────────────────────

/// A [`ConnectionBackend`] wrapper that adds MySQL-specific health checking.
pub struct MysqlBackend {
    inner: Box<dyn ConnectionBackend>,
}

impl std::fmt::Debug for MysqlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlBackend")
            .field("inner", &self.inner)
            .finish()
    }
}

impl MysqlBackend {
    /// Wrap an existing backend with MySQL-aware health checking.
    pub fn new(inner: Box<dyn ConnectionBackend>) -> Self {
        Self { inner }
    }

    /// Read exactly one MySQL packet and return its payload. The whole
    /// packet is consumed so nothing is left for the next holder.
    fn read_packet(&mut self) -> Result<Vec<u8>, DbProxyError> {
        let mut buf = Vec::new();
        let mut need = MYSQL_HEADER_SIZE;
        while buf.len() < need {
            let chunk = self.inner.recv(need - buf.len())?;
            if chunk.is_empty() {
                return Err(DbProxyError::Closed("mysql server closed the connection".into()));
            }
            buf.extend_from_slice(&chunk);
            if buf.len() >= MYSQL_HEADER_SIZE && need == MYSQL_HEADER_SIZE {
                let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
                need = MYSQL_HEADER_SIZE + payload_len;
            }
        }
        Ok(buf.split_off(MYSQL_HEADER_SIZE))
    }

    fn com_ping(&mut self) -> Result<bool, DbProxyError> {
        self.inner.send(&COM_PING_PACKET)?;
        let payload = self.read_packet()?;
        Ok(payload.first() == Some(&OK_MARKER))
    }
}

impl ConnectionBackend for MysqlBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, DbProxyError> {
        self.inner.send(data)
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, DbProxyError> {
        self.inner.recv(max_bytes)
    }

    fn ping(&mut self, timeout: Duration) -> bool {
        if self.inner.set_read_timeout(Some(timeout)).is_err() {
            return false;
        }
        let ok = match self.com_ping() {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(error = %e, "mysql COM_PING failed");
                false
            }
        };
        ok && self.inner.set_read_timeout(None).is_ok()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), DbProxyError> {
        self.inner.set_read_timeout(timeout)
    }
}

// ── MysqlConnectionFactory ───────────────────────────────────────────

/// Factory creating MySQL connections with COM_PING health checking.
///
/// Delegates TCP/TLS connection establishment to a [`TcpConnectionFactory`],
/// then wraps the resulting backend in a [`MysqlBackend`].
#[derive(Debug, Clone)]
pub struct MysqlConnectionFactory {
    inner: TcpConnectionFactory,
}

impl MysqlConnectionFactory {
    pub fn new(inner: TcpConnectionFactory) -> Self {
        Self { inner }
    }
}

impl ConnectionFactory for MysqlConnectionFactory {
    fn connect(
        &self,
        key: &PoolKey,
        password: Option<&str>,
    ) -> Result<Box<dyn ConnectionBackend>, DbProxyError> {
        let tcp_backend = self.inner.connect(key, password)?;
        tracing::debug!(
            host = %key.host,
            port = key.port,
            "wrapping tcp connection with mysql COM_PING health check"
        );
        Ok(Box::new(MysqlBackend::new(tcp_backend)))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    use crate::db_proxy::tcp::tests::start_tcp_listener;

    /// Mock backend that replays scripted reads.
    #[derive(Debug, Default)]
    struct MockMysqlInner {
        reads: VecDeque<Vec<u8>>,
        send_fails: bool,
    }

    impl MockMysqlInner {
        fn replying(reads: &[&[u8]]) -> Self {
            Self {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                ..Self::default()
            }
        }
    }

    impl ConnectionBackend for MockMysqlInner {
        fn send(&mut self, data: &[u8]) -> Result<usize, DbProxyError> {
            if self.send_fails {
                return Err(DbProxyError::Closed("send failed".into()));
            }
            Ok(data.len())
        }

        fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, DbProxyError> {
            let Some(mut next) = self.reads.pop_front() else {
                return Err(DbProxyError::Timeout("no data".into()));
            };
            if next.len() > max_bytes {
                let rest = next.split_off(max_bytes);
                self.reads.push_front(rest);
            }
            Ok(next)
        }

        fn ping(&mut self, _timeout: Duration) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    /// OK packet: header (len 7, seq 1) + [0x00, affected 0, insert_id 0, status 2, warnings 0].
    const OK_PACKET: &[u8] = &[0x07, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

    #[test]
    fn com_ping_packet_format() {
        assert_eq!(COM_PING_PACKET, [0x01, 0x00, 0x00, 0x00, 0x0e]);
    }

    #[test]
    fn ping_ok_response() {
        let mut backend = MysqlBackend::new(Box::new(MockMysqlInner::replying(&[OK_PACKET])));
        assert!(backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn ping_consumes_whole_ok_packet() {
        let mut backend =
            MysqlBackend::new(Box::new(MockMysqlInner::replying(&[OK_PACKET, b"next"])));
        assert!(backend.ping(Duration::from_millis(50)));
        assert_eq!(backend.recv(16).unwrap(), b"next", "ping must not leave bytes behind");
    }

    #[test]
    fn ping_handles_fragmented_reply() {
        let mut backend = MysqlBackend::new(Box::new(MockMysqlInner::replying(&[
            &OK_PACKET[..2],
            &OK_PACKET[2..6],
            &OK_PACKET[6..],
        ])));
        assert!(backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn ping_err_response() {
        let err_packet: &[u8] = &[0x03, 0x00, 0x00, 0x01, 0xff, 0x15, 0x04];
        let mut backend = MysqlBackend::new(Box::new(MockMysqlInner::replying(&[err_packet])));
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn ping_eof_is_unhealthy() {
        let mut backend = MysqlBackend::new(Box::new(MockMysqlInner::replying(&[b""])));
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn ping_send_failure() {
        let inner = MockMysqlInner {
            send_fails: true,
            ..MockMysqlInner::default()
        };
        let mut backend = MysqlBackend::new(Box::new(inner));
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn send_and_recv_pass_through() {
        let mut backend = MysqlBackend::new(Box::new(MockMysqlInner::replying(&[b"\x01\x02"])));
        assert_eq!(backend.send(&[0x03, 0x00, 0x00, 0x00, 0x03]).unwrap(), 5);
        assert_eq!(backend.recv(64).unwrap(), vec![0x01, 0x02]);
    }

    #[test]
    fn factory_pings_real_socket() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut cmd = [0u8; 5];
            while stream.read_exact(&mut cmd).is_ok() {
                if cmd[4] == COM_PING {
                    stream.write_all(OK_PACKET).unwrap();
                }
            }
        });

        let factory = MysqlConnectionFactory::new(TcpConnectionFactory::plain(
            Duration::from_secs(2),
            Duration::from_secs(2),
        ));
        let key = PoolKey::with_protocol(
            "127.0.0.1",
            addr.port(),
            "app",
            "root",
            warp_core::Protocol::Mysql,
        );
        let mut backend = factory.connect(&key, None).unwrap();
        assert!(backend.ping(Duration::from_millis(500)));
        assert!(backend.ping(Duration::from_millis(500)));
    }
}
