//! Postgres-specific connection backend and factory.
//!
//! The factory dials the server, negotiates TLS with an `SSLRequest` when
//! configured, and (by default) performs the v3 startup handshake on the
//! host so pooled sockets are handed out already authenticated:
//!
//! ```text
//! Host → Server:  [SSLRequest → 'S' → TLS]  StartupMessage(user, database)
//! Server → Host:  Authentication(CleartextPassword)
//! Host → Server:  PasswordMessage
//! Server → Host:  AuthenticationOk, ParameterStatus*, BackendKeyData, ReadyForQuery
//! ```
//!
//! After that every byte is passthrough. The health probe is an empty
//! simple query, which a clean session answers with `EmptyQueryResponse`
//! followed by `ReadyForQuery('I')`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use warp_core::DbProxyError;
use warpgrid_pgwire::{
    AuthenticationRequest, BackendDecoder, BackendMessage, TransactionStatus,
    encode_password_message, encode_simple_query, encode_ssl_request, encode_startup,
};

use super::tcp::{TcpConnectionFactory, io_error};
use super::{ConnectionBackend, ConnectionFactory, PoolKey};

const READ_CHUNK: usize = 8192;

// ── PostgresBackend ─────────────────────────────────────────────────

/// A [`ConnectionBackend`] wrapper that adds a Postgres-level probe.
pub struct PostgresBackend {
    inner: Box<dyn ConnectionBackend>,
    authenticated: bool,
    max_frame_size: usize,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("inner", &self.inner)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl PostgresBackend {
    /// Wrap a socket on which the guest will perform the startup exchange.
    pub fn passthrough(inner: Box<dyn ConnectionBackend>, max_frame_size: usize) -> Self {
        Self {
            inner,
            authenticated: false,
            max_frame_size,
        }
    }

    /// Run the startup handshake on `inner` and wrap the authenticated socket.
    pub fn authenticate(
        mut inner: Box<dyn ConnectionBackend>,
        key: &PoolKey,
        password: Option<&str>,
        max_frame_size: usize,
    ) -> Result<Self, DbProxyError> {
        startup(inner.as_mut(), key, password, max_frame_size)?;
        Ok(Self {
            inner,
            authenticated: true,
            max_frame_size,
        })
    }

    fn probe_session(&mut self) -> Result<bool, DbProxyError> {
        self.inner.send(&encode_simple_query(""))?;

        let mut decoder = BackendDecoder::with_max_frame_size(self.max_frame_size);
        let mut saw_empty = false;
        loop {
            let chunk = self.inner.recv(READ_CHUNK)?;
            if chunk.is_empty() {
                return Ok(false);
            }
            decoder.feed(&chunk);
            while let Some(msg) = decoder
                .next_message()
                .map_err(|e| DbProxyError::Protocol(e.to_string()))?
            {
                match msg {
                    BackendMessage::EmptyQueryResponse => saw_empty = true,
                    BackendMessage::ReadyForQuery(status) => {
                        return Ok(saw_empty
                            && status == TransactionStatus::Idle
                            && decoder.buffered() == 0);
                    }
                    BackendMessage::NoticeResponse(_) | BackendMessage::ParameterStatus { .. } => {}
                    // Leftover results or an error: the session is not clean.
                    _ => return Ok(false),
                }
            }
        }
    }
}

impl ConnectionBackend for PostgresBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, DbProxyError> {
        self.inner.send(data)
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, DbProxyError> {
        self.inner.recv(max_bytes)
    }

    fn ping(&mut self, timeout: Duration) -> bool {
        if !self.authenticated {
            return self.inner.ping(timeout);
        }
        if self.inner.set_read_timeout(Some(timeout)).is_err() {
            return false;
        }
        let clean = self.probe_session().unwrap_or(false);
        clean && self.inner.set_read_timeout(None).is_ok()
    }

    fn close(&mut self) {
        if self.authenticated {
            let _ = self.inner.send(&warpgrid_pgwire::encode_terminate());
        }
        self.inner.close();
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), DbProxyError> {
        self.inner.set_read_timeout(timeout)
    }
}

/// Drive the startup exchange until `ReadyForQuery`.
fn startup(
    conn: &mut dyn ConnectionBackend,
    key: &PoolKey,
    password: Option<&str>,
    max_frame_size: usize,
) -> Result<(), DbProxyError> {
    conn.send(&encode_startup(&key.user, &key.database))?;

    let mut decoder = BackendDecoder::with_max_frame_size(max_frame_size);
    loop {
        let chunk = conn.recv(READ_CHUNK)?;
        if chunk.is_empty() {
            return Err(DbProxyError::Closed(
                "server closed the connection during startup".into(),
            ));
        }
        decoder.feed(&chunk);

        while let Some(msg) = decoder
            .next_message()
            .map_err(|e| DbProxyError::Protocol(format!("startup: {e}")))?
        {
            match msg {
                BackendMessage::Authentication(AuthenticationRequest::Ok) => {}
                BackendMessage::Authentication(AuthenticationRequest::CleartextPassword) => {
                    let password = password.ok_or_else(|| {
                        DbProxyError::Protocol(
                            "server requested a password but none was supplied".into(),
                        )
                    })?;
                    conn.send(&encode_password_message(password))?;
                }
                BackendMessage::Authentication(other) => {
                    return Err(DbProxyError::Protocol(format!(
                        "unsupported authentication method (code {})",
                        other.code()
                    )));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    if name == "server_version" {
                        tracing::debug!(
                            host = %key.host,
                            server_version = %value,
                            "postgres server"
                        );
                    }
                }
                BackendMessage::BackendKeyData { .. } | BackendMessage::NoticeResponse(_) => {}
                BackendMessage::ErrorResponse(fields) => {
                    return Err(DbProxyError::ConnectionRefused(fields.to_string()));
                }
                BackendMessage::ReadyForQuery(_) => {
                    tracing::debug!(
                        host = %key.host,
                        port = key.port,
                        database = %key.database,
                        user = %key.user,
                        "postgres startup complete"
                    );
                    return Ok(());
                }
                other => {
                    return Err(DbProxyError::Protocol(format!(
                        "unexpected message '{}' during startup",
                        other.tag() as char
                    )));
                }
            }
        }
    }
}

// ── PostgresConnectionFactory ───────────────────────────────────────

/// Factory creating Postgres connections.
///
/// With TLS enabled the server is asked to upgrade with an `SSLRequest`
/// first; a server that declines fails the connect rather than silently
/// falling back to plaintext.
#[derive(Debug, Clone)]
pub struct PostgresConnectionFactory {
    tcp: TcpConnectionFactory,
    host_handshake: bool,
    max_frame_size: usize,
}

impl PostgresConnectionFactory {
    pub fn new(tcp: TcpConnectionFactory, host_handshake: bool, max_frame_size: usize) -> Self {
        Self {
            tcp,
            host_handshake,
            max_frame_size,
        }
    }

    fn negotiate_tls(&self, stream: &mut TcpStream) -> Result<(), DbProxyError> {
        stream
            .write_all(&encode_ssl_request())
            .map_err(|e| io_error("ssl request", e))?;
        let mut answer = [0u8; 1];
        stream
            .read_exact(&mut answer)
            .map_err(|e| io_error("ssl request", e))?;
        match answer[0] {
            b'S' => Ok(()),
            b'N' => Err(DbProxyError::Protocol(
                "server does not accept TLS connections".into(),
            )),
            other => Err(DbProxyError::Protocol(format!(
                "unexpected SSLRequest answer 0x{other:02x}"
            ))),
        }
    }
}

impl ConnectionFactory for PostgresConnectionFactory {
    fn connect(
        &self,
        key: &PoolKey,
        password: Option<&str>,
    ) -> Result<Box<dyn ConnectionBackend>, DbProxyError> {
        let mut stream = self.tcp.open_stream(key)?;
        if self.tcp.uses_tls() {
            self.negotiate_tls(&mut stream)?;
        }
        let mut socket: Box<dyn ConnectionBackend> = Box::new(self.tcp.secure(key, stream)?);

        if !self.host_handshake {
            return Ok(Box::new(PostgresBackend::passthrough(
                socket,
                self.max_frame_size,
            )));
        }

        socket.set_read_timeout(Some(self.tcp.connect_timeout()))?;
        let mut backend =
            PostgresBackend::authenticate(socket, key, password, self.max_frame_size)?;
        backend.set_read_timeout(None)?;
        Ok(Box::new(backend))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use warpgrid_pgwire::{
        ErrorFields, FrontendMessage, StartupPacket, decode_startup,
    };

    use crate::db_proxy::tcp::tests::start_tcp_listener;

    // ── Scripted inner backend ──────────────────────────────────────

    #[derive(Debug, Default)]
    struct Scripted {
        replies: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl Scripted {
        fn replying(messages: &[BackendMessage]) -> Self {
            let mut bytes = Vec::new();
            for msg in messages {
                msg.encode_into(&mut bytes);
            }
            Self {
                replies: VecDeque::from([bytes]),
                sent: Vec::new(),
            }
        }
    }

    impl ConnectionBackend for Scripted {
        fn send(&mut self, data: &[u8]) -> Result<usize, DbProxyError> {
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn recv(&mut self, _max_bytes: usize) -> Result<Vec<u8>, DbProxyError> {
            self.replies
                .pop_front()
                .ok_or_else(|| DbProxyError::Timeout("no reply scripted".into()))
        }

        fn ping(&mut self, _timeout: Duration) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    fn authenticated(inner: Scripted) -> PostgresBackend {
        PostgresBackend {
            inner: Box::new(inner),
            authenticated: true,
            max_frame_size: warpgrid_pgwire::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    // ── Probe ───────────────────────────────────────────────────────

    #[test]
    fn probe_accepts_clean_idle_session() {
        let mut backend = authenticated(Scripted::replying(&[
            BackendMessage::EmptyQueryResponse,
            BackendMessage::ReadyForQuery(TransactionStatus::Idle),
        ]));
        assert!(backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn probe_rejects_open_transaction() {
        let mut backend = authenticated(Scripted::replying(&[
            BackendMessage::EmptyQueryResponse,
            BackendMessage::ReadyForQuery(TransactionStatus::InTransaction),
        ]));
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn probe_rejects_unread_results() {
        let mut backend = authenticated(Scripted::replying(&[
            BackendMessage::CommandComplete {
                tag: "SELECT 1".into(),
            },
            BackendMessage::ReadyForQuery(TransactionStatus::Idle),
            BackendMessage::EmptyQueryResponse,
            BackendMessage::ReadyForQuery(TransactionStatus::Idle),
        ]));
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn probe_fails_on_silence() {
        let mut backend = authenticated(Scripted::default());
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn unauthenticated_probe_delegates_to_socket() {
        let mut backend = PostgresBackend::passthrough(Box::new(Scripted::default()), 1024);
        assert!(backend.ping(Duration::from_millis(50)));
        assert!(!backend.authenticated());
    }

    // ── Startup ─────────────────────────────────────────────────────

    #[test]
    fn startup_rejects_md5_challenge() {
        let inner = Scripted::replying(&[BackendMessage::Authentication(
            AuthenticationRequest::Md5Password { salt: [1, 2, 3, 4] },
        )]);
        let key = PoolKey::new("db", 5432, "app", "alice");
        let err = PostgresBackend::authenticate(Box::new(inner), &key, Some("pw"), 1 << 20)
            .unwrap_err();
        assert!(matches!(err, DbProxyError::Protocol(ref m) if m.contains("code 5")));
    }

    #[test]
    fn startup_requires_password_when_challenged() {
        let inner = Scripted::replying(&[BackendMessage::Authentication(
            AuthenticationRequest::CleartextPassword,
        )]);
        let key = PoolKey::new("db", 5432, "app", "alice");
        let err = PostgresBackend::authenticate(Box::new(inner), &key, None, 1 << 20).unwrap_err();
        assert!(matches!(err, DbProxyError::Protocol(_)));
    }

    // ── Against a loopback server ───────────────────────────────────

    #[derive(Clone, Copy)]
    enum Auth {
        Trust,
        Cleartext(&'static str),
    }

    fn read_frame(stream: &mut TcpStream) -> Option<FrontendMessage> {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).ok()?;
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        stream.read_exact(&mut payload).ok()?;
        FrontendMessage::decode(header[0], &payload).ok().flatten()
    }

    fn read_startup(stream: &mut TcpStream) -> StartupPacket {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let mut packet = len.to_vec();
        packet.resize(i32::from_be_bytes(len) as usize, 0);
        stream.read_exact(&mut packet[4..]).unwrap();
        decode_startup(&packet).unwrap().unwrap().0
    }

    fn write_all(stream: &mut TcpStream, messages: &[BackendMessage]) {
        let mut out = Vec::new();
        for msg in messages {
            msg.encode_into(&mut out);
        }
        stream.write_all(&out).unwrap();
    }

    /// One-connection server that authenticates and then answers empty
    /// queries. Reports the startup user it saw.
    fn spawn_server(auth: Auth) -> (SocketAddr, std::sync::mpsc::Receiver<String>) {
        let (listener, addr) = start_tcp_listener();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let StartupPacket::Startup(startup) = read_startup(&mut stream) else {
                return;
            };
            let _ = tx.send(startup.user().unwrap_or_default().to_string());

            if let Auth::Cleartext(expected) = auth {
                write_all(
                    &mut stream,
                    &[BackendMessage::Authentication(
                        AuthenticationRequest::CleartextPassword,
                    )],
                );
                match read_frame(&mut stream) {
                    Some(FrontendMessage::PasswordMessage { password })
                        if password == expected => {}
                    _ => {
                        write_all(
                            &mut stream,
                            &[BackendMessage::ErrorResponse(ErrorFields::new(
                                "FATAL",
                                "28P01",
                                "password authentication failed",
                            ))],
                        );
                        return;
                    }
                }
            }

            write_all(
                &mut stream,
                &[
                    BackendMessage::Authentication(AuthenticationRequest::Ok),
                    BackendMessage::ParameterStatus {
                        name: "server_version".into(),
                        value: "16.2".into(),
                    },
                    BackendMessage::BackendKeyData {
                        process_id: 7,
                        secret_key: 11,
                    },
                    BackendMessage::ReadyForQuery(TransactionStatus::Idle),
                ],
            );

            while let Some(msg) = read_frame(&mut stream) {
                match msg {
                    FrontendMessage::Query { sql } if sql.is_empty() => write_all(
                        &mut stream,
                        &[
                            BackendMessage::EmptyQueryResponse,
                            BackendMessage::ReadyForQuery(TransactionStatus::Idle),
                        ],
                    ),
                    FrontendMessage::Terminate => break,
                    _ => {}
                }
            }
        });
        (addr, rx)
    }

    fn factory(host_handshake: bool) -> PostgresConnectionFactory {
        PostgresConnectionFactory::new(
            TcpConnectionFactory::plain(Duration::from_secs(2), Duration::from_secs(2)),
            host_handshake,
            warpgrid_pgwire::DEFAULT_MAX_FRAME_SIZE,
        )
    }

    #[test]
    fn trust_handshake_yields_authenticated_socket() {
        let (addr, users) = spawn_server(Auth::Trust);
        let key = PoolKey::new("127.0.0.1", addr.port(), "app", "alice");

        let mut backend = factory(true).connect(&key, None).unwrap();
        assert!(backend.authenticated());
        assert_eq!(users.recv().unwrap(), "alice");
        assert!(backend.ping(Duration::from_millis(500)));
        backend.close();
    }

    #[test]
    fn cleartext_password_is_sent_when_challenged() {
        let (addr, _) = spawn_server(Auth::Cleartext("s3cret"));
        let key = PoolKey::new("127.0.0.1", addr.port(), "app", "alice");

        let backend = factory(true).connect(&key, Some("s3cret")).unwrap();
        assert!(backend.authenticated());
    }

    #[test]
    fn wrong_password_is_refused() {
        let (addr, _) = spawn_server(Auth::Cleartext("s3cret"));
        let key = PoolKey::new("127.0.0.1", addr.port(), "app", "alice");

        let err = factory(true).connect(&key, Some("nope")).unwrap_err();
        assert!(
            matches!(err, DbProxyError::ConnectionRefused(ref m) if m.contains("28P01")),
            "got {err:?}"
        );
    }

    #[test]
    fn passthrough_mode_sends_nothing() {
        let (listener, addr) = start_tcp_listener();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let mut buf = [0u8; 16];
            matches!(stream.read(&mut buf), Err(_) | Ok(0))
        });

        let key = PoolKey::new("127.0.0.1", addr.port(), "app", "alice");
        let mut backend = factory(false).connect(&key, None).unwrap();
        assert!(!backend.authenticated());
        assert!(server.join().unwrap(), "host must not speak first");
        backend.close();
    }

    #[test]
    fn declined_ssl_request_fails_connect() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            if let StartupPacket::SslRequest = read_startup(&mut stream) {
                stream.write_all(b"N").unwrap();
            }
            std::thread::sleep(Duration::from_millis(100));
        });

        let tls = crate::db_proxy::tcp::TlsConfig::dangerous_no_verify().unwrap();
        let factory = PostgresConnectionFactory::new(
            TcpConnectionFactory::with_tls(Duration::from_secs(2), Duration::from_secs(2), tls),
            true,
            1 << 20,
        );
        let key = PoolKey::new("127.0.0.1", addr.port(), "app", "alice");
        let err = factory.connect(&key, None).unwrap_err();
        assert!(matches!(err, DbProxyError::Protocol(_)), "got {err:?}");
    }
}
