//! Redis-specific connection backend and factory.
//!
//! Wraps a generic [`ConnectionBackend`] (typically a TCP backend) with
//! Redis-aware health checking using the `PING` command. When the caller
//! supplies a password the factory authenticates the socket with `AUTH`
//! before it is pooled, and selects the logical database when the pool key
//! names a non-zero index. Everything else is byte passthrough: the guest
//! speaks RESP directly.
//!
//! Before a socket goes back to the idle set it is sent `RESET` and the
//! same `AUTH`/`SELECT` are replayed, so a guest's `SELECT 7` or `AUTH` as
//! another user never reaches the next holder.
//!
//! # Redis PING/PONG Protocol
//!
//! ```text
//! Client → Server:
//!   PING\r\n        (inline command format)
//!
//! Server → Client:
//!   +PONG\r\n       (RESP Simple String response)
//! ```

use std::time::Duration;

use warp_core::DbProxyError;

use super::tcp::TcpConnectionFactory;
use super::{ConnectionBackend, ConnectionFactory, PoolKey};

/// Redis PING command in inline format (simplest, universally supported).
const REDIS_PING: &[u8] = b"PING\r\n";

/// Expected PONG response (RESP Simple String).
const REDIS_PONG: &[u8] = b"+PONG\r\n";

/// Redis 6.2+ `RESET`: back to a fresh, unauthenticated connection on db 0.
const REDIS_RESET: &[u8] = b"RESET\r\n";

const REDIS_RESET_OK: &[u8] = b"+RESET\r\n";

/// Longest single-line reply accepted from the server.
const MAX_LINE: usize = 4096;

/// Encode a command as a RESP array of bulk strings.
fn resp_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one CRLF-terminated reply line.
fn read_line(conn: &mut dyn ConnectionBackend) -> Result<Vec<u8>, DbProxyError> {
    let mut line = Vec::new();
    while !line.ends_with(b"\r\n") {
        if line.len() > MAX_LINE {
            return Err(DbProxyError::Protocol("redis reply line too long".into()));
        }
        let chunk = conn.recv(MAX_LINE)?;
        if chunk.is_empty() {
            return Err(DbProxyError::Closed("redis server closed the connection".into()));
        }
        line.extend_from_slice(&chunk);
    }
    Ok(line)
}

// ── RedisBackend ────────────────────────────────────────────────────

/// A [`ConnectionBackend`] wrapper that adds Redis-specific health checking.
///
/// All operations except `ping()` and `reset_session()` delegate directly to
/// the inner backend. `ping()` sends a Redis `PING` command and checks for a
/// `+PONG\r\n` response.
pub struct RedisBackend {
    inner: Box<dyn ConnectionBackend>,
    authenticated: bool,
    user: String,
    password: Option<String>,
    db_index: Option<u32>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("inner", &self.inner)
            .field("authenticated", &self.authenticated)
            .field("user", &self.user)
            .field("db_index", &self.db_index)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Wrap an existing backend with Redis-aware health checking.
    pub fn new(inner: Box<dyn ConnectionBackend>) -> Self {
        Self {
            inner,
            authenticated: false,
            user: String::new(),
            password: None,
            db_index: None,
        }
    }

    /// Authenticate and select the key's database on `inner`, then wrap it.
    pub fn prepare(
        mut inner: Box<dyn ConnectionBackend>,
        key: &PoolKey,
        password: Option<&str>,
    ) -> Result<Self, DbProxyError> {
        let db_index = select_index(&key.database)?;
        let authenticated = login(inner.as_mut(), &key.user, password, db_index)?;
        Ok(Self {
            inner,
            authenticated,
            user: key.user.clone(),
            password: password.map(str::to_string),
            db_index,
        })
    }

    /// `RESET` drops whatever the last holder did to the session (selected
    /// database, ACL user, MULTI, subscriptions), then the login for this
    /// socket's key is replayed.
    fn restore(&mut self) -> Result<(), DbProxyError> {
        self.inner.send(REDIS_RESET)?;
        let reply = read_line(self.inner.as_mut())?;
        if reply != REDIS_RESET_OK {
            return Err(DbProxyError::Protocol(format!(
                "redis RESET failed: {}",
                String::from_utf8_lossy(&reply).trim_end()
            )));
        }
        login(
            self.inner.as_mut(),
            &self.user,
            self.password.as_deref(),
            self.db_index,
        )?;
        Ok(())
    }
}

/// Send `AUTH` when a password is given and `SELECT` for a non-zero
/// database. Returns whether the socket was authenticated.
fn login(
    conn: &mut dyn ConnectionBackend,
    user: &str,
    password: Option<&str>,
    db_index: Option<u32>,
) -> Result<bool, DbProxyError> {
    let authenticated = match password {
        Some(password) => {
            let auth = if user.is_empty() || user == "default" {
                resp_command(&["AUTH", password])
            } else {
                resp_command(&["AUTH", user, password])
            };
            conn.send(&auth)?;
            let reply = read_line(conn)?;
            if !reply.starts_with(b"+OK") {
                return Err(DbProxyError::ConnectionRefused(format!(
                    "redis AUTH rejected: {}",
                    String::from_utf8_lossy(&reply).trim_end()
                )));
            }
            true
        }
        None => false,
    };

    if let Some(index) = db_index {
        conn.send(&resp_command(&["SELECT", &index.to_string()]))?;
        let reply = read_line(conn)?;
        if !reply.starts_with(b"+OK") {
            return Err(DbProxyError::Protocol(format!(
                "redis SELECT {index} failed: {}",
                String::from_utf8_lossy(&reply).trim_end()
            )));
        }
    }
    Ok(authenticated)
}

/// Logical database to `SELECT`, if any. Empty or `0` means the default.
fn select_index(database: &str) -> Result<Option<u32>, DbProxyError> {
    if database.is_empty() {
        return Ok(None);
    }
    let index: u32 = database.parse().map_err(|_| {
        DbProxyError::InvalidConfig(format!(
            "redis database must be a numeric index, got '{database}'"
        ))
    })?;
    Ok((index != 0).then_some(index))
}

impl ConnectionBackend for RedisBackend {
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
        if self.inner.send(REDIS_PING).is_err() {
            return false;
        }
        let pong = matches!(read_line(self.inner.as_mut()), Ok(line) if line == REDIS_PONG);
        pong && self.inner.set_read_timeout(None).is_ok()
    }

    fn reset_session(&mut self, timeout: Duration) -> bool {
        if self.inner.set_read_timeout(Some(timeout)).is_err() {
            return false;
        }
        if let Err(e) = self.restore() {
            tracing::debug!(error = %e, user = %self.user, "redis session reset failed");
            return false;
        }
        self.inner.set_read_timeout(None).is_ok()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), DbProxyError> {
        self.inner.set_read_timeout(timeout)
    }
}

// ── RedisConnectionFactory ──────────────────────────────────────────

/// Factory creating Redis connections with PING/PONG health checking.
///
/// Delegates TCP/TLS connection establishment to a [`TcpConnectionFactory`],
/// then wraps the resulting backend in a [`RedisBackend`].
#[derive(Debug, Clone)]
pub struct RedisConnectionFactory {
    inner: TcpConnectionFactory,
}

impl RedisConnectionFactory {
    pub fn new(inner: TcpConnectionFactory) -> Self {
        Self { inner }
    }
}

impl ConnectionFactory for RedisConnectionFactory {
    fn connect(
        &self,
        key: &PoolKey,
        password: Option<&str>,
    ) -> Result<Box<dyn ConnectionBackend>, DbProxyError> {
        // Reject a bad database name before dialing.
        select_index(&key.database)?;

        let mut tcp_backend = self.inner.connect(key, password)?;
        tcp_backend.set_read_timeout(Some(self.inner.connect_timeout()))?;
        let mut backend = RedisBackend::prepare(tcp_backend, key, password)?;
        backend.set_read_timeout(None)?;

        tracing::debug!(
            host = %key.host,
            port = key.port,
            authenticated = backend.authenticated,
            "redis connection ready"
        );
        Ok(Box::new(backend))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    use crate::db_proxy::tcp::tests::start_tcp_listener;

    /// Mock backend that records sent data and replays scripted reads.
    #[derive(Debug, Default)]
    struct MockRedisInner {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        reads: VecDeque<Vec<u8>>,
        send_fails: bool,
    }

    impl MockRedisInner {
        fn replying(reads: &[&[u8]]) -> Self {
            Self {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                ..Self::default()
            }
        }
    }

    impl ConnectionBackend for MockRedisInner {
        fn send(&mut self, data: &[u8]) -> Result<usize, DbProxyError> {
            if self.send_fails {
                return Err(DbProxyError::Closed("send failed".into()));
            }
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn recv(&mut self, _max_bytes: usize) -> Result<Vec<u8>, DbProxyError> {
            self.reads
                .pop_front()
                .ok_or_else(|| DbProxyError::Timeout("no data".into()))
        }

        fn ping(&mut self, _timeout: Duration) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    fn key(database: &str, user: &str) -> PoolKey {
        PoolKey::with_protocol("cache", 6379, database, user, warp_core::Protocol::Redis)
    }

    #[test]
    fn resp_command_encoding() {
        assert_eq!(
            resp_command(&["AUTH", "p w"]),
            b"*2\r\n$4\r\nAUTH\r\n$3\r\np w\r\n".to_vec()
        );
    }

    #[test]
    fn ping_receives_pong() {
        let inner = MockRedisInner::replying(&[b"+PONG\r\n"]);
        let sent = Arc::clone(&inner.sent);
        let mut backend = RedisBackend::new(Box::new(inner));

        assert!(backend.ping(Duration::from_millis(50)));
        assert_eq!(sent.lock().unwrap().as_slice(), &[REDIS_PING.to_vec()]);
    }

    #[test]
    fn ping_accepts_split_pong() {
        let inner = MockRedisInner::replying(&[b"+PO", b"NG\r\n"]);
        let mut backend = RedisBackend::new(Box::new(inner));
        assert!(backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn ping_rejects_error_and_unexpected_replies() {
        for reply in [&b"-ERR not authenticated\r\n"[..], b"+OK\r\n", b""] {
            let mut backend = RedisBackend::new(Box::new(MockRedisInner::replying(&[reply])));
            assert!(!backend.ping(Duration::from_millis(50)), "reply {reply:?}");
        }
    }

    #[test]
    fn ping_send_failure() {
        let inner = MockRedisInner {
            send_fails: true,
            ..MockRedisInner::default()
        };
        let mut backend = RedisBackend::new(Box::new(inner));
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn prepare_sends_auth_and_select() {
        let inner = MockRedisInner::replying(&[b"+OK\r\n", b"+OK\r\n"]);
        let sent = Arc::clone(&inner.sent);

        let backend = RedisBackend::prepare(Box::new(inner), &key("3", "default"), Some("pw"))
            .unwrap();
        assert!(backend.authenticated());
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &[resp_command(&["AUTH", "pw"]), resp_command(&["SELECT", "3"])]
        );
    }

    #[test]
    fn prepare_uses_acl_user() {
        let inner = MockRedisInner::replying(&[b"+OK\r\n"]);
        let sent = Arc::clone(&inner.sent);

        RedisBackend::prepare(Box::new(inner), &key("0", "svc"), Some("pw")).unwrap();
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &[resp_command(&["AUTH", "svc", "pw"])]
        );
    }

    #[test]
    fn prepare_without_password_sends_nothing() {
        let inner = MockRedisInner::default();
        let sent = Arc::clone(&inner.sent);

        let backend = RedisBackend::prepare(Box::new(inner), &key("0", "default"), None).unwrap();
        assert!(!backend.authenticated());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn rejected_auth_is_connection_refused() {
        let inner = MockRedisInner::replying(&[b"-WRONGPASS invalid username-password pair\r\n"]);
        let err = RedisBackend::prepare(Box::new(inner), &key("0", "default"), Some("bad"))
            .unwrap_err();
        assert!(matches!(err, DbProxyError::ConnectionRefused(ref m) if m.contains("WRONGPASS")));
    }

    #[test]
    fn reset_session_replays_login() {
        let inner = MockRedisInner::replying(&[b"+OK\r\n", b"+OK\r\n"]);
        let sent = Arc::clone(&inner.sent);
        let mut backend =
            RedisBackend::prepare(Box::new(inner), &key("4", "svc"), Some("pw")).unwrap();
        sent.lock().unwrap().clear();

        // Hand the same mock a script for the reset exchange.
        let mut replay = MockRedisInner::replying(&[b"+RESET\r\n", b"+OK\r\n", b"+OK\r\n"]);
        replay.sent = Arc::clone(&sent);
        backend.inner = Box::new(replay);

        assert!(backend.reset_session(Duration::from_millis(50)));
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &[
                REDIS_RESET.to_vec(),
                resp_command(&["AUTH", "svc", "pw"]),
                resp_command(&["SELECT", "4"]),
            ]
        );
    }

    #[test]
    fn reset_session_without_login_sends_only_reset() {
        let inner = MockRedisInner::replying(&[b"+RESET\r\n"]);
        let sent = Arc::clone(&inner.sent);
        let mut backend = RedisBackend::new(Box::new(inner));

        assert!(backend.reset_session(Duration::from_millis(50)));
        assert_eq!(sent.lock().unwrap().as_slice(), &[REDIS_RESET.to_vec()]);
    }

    #[test]
    fn reset_session_fails_on_old_server_or_silence() {
        let cases: [&[&[u8]]; 2] = [&[&b"-ERR unknown command 'RESET'\r\n"[..]], &[]];
        for reads in cases {
            let mut backend = RedisBackend::new(Box::new(MockRedisInner::replying(reads)));
            assert!(!backend.reset_session(Duration::from_millis(50)), "reads {reads:?}");
        }
    }

    #[test]
    fn non_numeric_database_is_invalid_config() {
        assert!(matches!(
            select_index("sessions"),
            Err(DbProxyError::InvalidConfig(_))
        ));
        assert_eq!(select_index("0").unwrap(), None);
        assert_eq!(select_index("").unwrap(), None);
        assert_eq!(select_index("5").unwrap(), Some(5));
    }

    /// Line-oriented fake server: answers PING, AUTH and SELECT.
    fn spawn_redis(password: &'static str) -> std::net::SocketAddr {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let text = String::from_utf8_lossy(&buf[..n]);
                let reply: &[u8] = if text.contains("PING") {
                    b"+PONG\r\n"
                } else if text.contains("AUTH") {
                    if text.contains(password) {
                        b"+OK\r\n"
                    } else {
                        b"-WRONGPASS invalid username-password pair\r\n"
                    }
                } else if text.contains("SELECT") {
                    b"+OK\r\n"
                } else {
                    b"-ERR unknown command\r\n"
                };
                if stream.write_all(reply).is_err() {
                    break;
                }
            }
        });
        addr
    }

    fn tcp_factory() -> RedisConnectionFactory {
        RedisConnectionFactory::new(TcpConnectionFactory::plain(
            Duration::from_secs(2),
            Duration::from_secs(2),
        ))
    }

    #[test]
    fn factory_authenticates_over_tcp() {
        let addr = spawn_redis("hunter2");
        let key = PoolKey::with_protocol(
            "127.0.0.1",
            addr.port(),
            "2",
            "default",
            warp_core::Protocol::Redis,
        );

        let mut backend = tcp_factory().connect(&key, Some("hunter2")).unwrap();
        assert!(backend.authenticated());
        assert!(backend.ping(Duration::from_millis(500)));

        backend.send(b"PING\r\n").unwrap();
        assert_eq!(backend.recv(64).unwrap(), b"+PONG\r\n");
    }

    #[test]
    fn factory_rejects_bad_password() {
        let addr = spawn_redis("hunter2");
        let key = PoolKey::with_protocol(
            "127.0.0.1",
            addr.port(),
            "0",
            "default",
            warp_core::Protocol::Redis,
        );
        let err = tcp_factory().connect(&key, Some("nope")).unwrap_err();
        assert!(matches!(err, DbProxyError::ConnectionRefused(_)), "got {err:?}");
    }

    #[test]
    fn factory_connect_refused() {
        let (listener, addr) = start_tcp_listener();
        drop(listener);
        let key = PoolKey::with_protocol(
            "127.0.0.1",
            addr.port(),
            "0",
            "default",
            warp_core::Protocol::Redis,
        );
        assert!(matches!(
            tcp_factory().connect(&key, None),
            Err(DbProxyError::ConnectionRefused(_))
        ));
    }
}
