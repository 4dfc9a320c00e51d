//! TCP/TLS connection backend for database proxy wire protocol passthrough.
//!
//! Provides a [`TcpBackend`] that implements [`ConnectionBackend`] over a
//! plain TCP or TLS-wrapped TCP connection. The backend performs **no protocol
//! parsing**. It passes raw bytes between the guest and the remote database
//! server. TLS terminates here: the guest only ever sees plaintext.
//!
//! ```text
//! send(handle, bytes) → TcpBackend::send → [TLS encrypt] → TCP write
//! recv(handle, n)     → TcpBackend::recv → TCP read → [TLS decrypt] → bytes
//! ```

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use warp_core::DbProxyError;

use super::{ConnectionBackend, ConnectionFactory, PoolKey};

/// Map a socket error from an established connection onto the proxy
/// taxonomy.
pub(crate) fn io_error(op: &str, e: io::Error) -> DbProxyError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            DbProxyError::Timeout(format!("{op}: {e}"))
        }
        io::ErrorKind::InvalidData => DbProxyError::Protocol(format!("{op}: {e}")),
        _ => DbProxyError::Closed(format!("{op}: {e}")),
    }
}

/// Map a dial error onto the proxy taxonomy.
fn dial_error(target: &str, e: io::Error) -> DbProxyError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            DbProxyError::Timeout(format!("connect to {target}: {e}"))
        }
        _ => DbProxyError::ConnectionRefused(format!("connect to {target}: {e}")),
    }
}

// ── Transport ────────────────────────────────────────────────────────

enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

// ── TcpBackend ───────────────────────────────────────────────────────

/// A [`ConnectionBackend`] using TCP (optionally TLS) for wire passthrough.
pub struct TcpBackend {
    transport: Transport,
    /// Read deadline restored after a probe shortens it.
    recv_timeout: Duration,
}

impl std::fmt::Debug for TcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tls = matches!(self.transport, Transport::Tls(_));
        f.debug_struct("TcpBackend")
            .field("tls", &tls)
            .field("recv_timeout", &self.recv_timeout)
            .finish()
    }
}

impl TcpBackend {
    pub fn plain(stream: TcpStream, recv_timeout: Duration) -> Self {
        Self {
            transport: Transport::Plain(stream),
            recv_timeout,
        }
    }

    pub fn tls(
        stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
        recv_timeout: Duration,
    ) -> Self {
        Self {
            transport: Transport::Tls(Box::new(stream)),
            recv_timeout,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    fn tcp_stream(&self) -> &TcpStream {
        match &self.transport {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.sock,
        }
    }
}

impl ConnectionBackend for TcpBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, DbProxyError> {
        let result = match &mut self.transport {
            Transport::Plain(stream) => stream.write_all(data).and_then(|_| stream.flush()),
            Transport::Tls(stream) => stream.write_all(data).and_then(|_| stream.flush()),
        };
        result.map_err(|e| io_error("send", e))?;
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, DbProxyError> {
        let mut buf = vec![0u8; max_bytes];
        let n = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut buf),
            Transport::Tls(stream) => match stream.read(&mut buf) {
                // Peer dropped the socket without close_notify: still EOF.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
                other => other,
            },
        }
        .map_err(|e| io_error("recv", e))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Zero-byte liveness check: a peek that times out means the peer is
    /// quiet but connected; EOF or a socket error means it is gone.
    fn ping(&mut self, timeout: Duration) -> bool {
        let stream = self.tcp_stream();
        if stream.set_read_timeout(Some(timeout)).is_err() {
            return false;
        }

        let mut peek_buf = [0u8; 1];
        let alive = match stream.peek(&mut peek_buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        };

        let _ = stream.set_read_timeout(Some(self.recv_timeout));
        alive
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), DbProxyError> {
        let timeout = timeout.unwrap_or(self.recv_timeout);
        self.tcp_stream()
            .set_read_timeout(Some(timeout))
            .map_err(|e| io_error("set read timeout", e))
    }

    fn close(&mut self) {
        if let Transport::Tls(stream) = &mut self.transport {
            stream.conn.send_close_notify();
            let _ = stream.flush();
        }
        let _ = self.tcp_stream().shutdown(std::net::Shutdown::Both);
    }
}

// ── TlsConfig ────────────────────────────────────────────────────────

/// Client-side TLS settings shared by every connection a factory opens.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Verify servers against the Mozilla root store.
    pub fn with_system_roots() -> Result<Self, DbProxyError> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| DbProxyError::InvalidConfig(format!("tls protocol versions: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
        })
    }

    /// Accept any server certificate. Only for development databases with
    /// self-signed certificates (`verify_certificates = false`).
    pub fn dangerous_no_verify() -> Result<Self, DbProxyError> {
        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| DbProxyError::InvalidConfig(format!("tls protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
        })
    }

    /// Pick the verifier matching the pool's `verify_certificates` flag.
    pub fn for_verification(verify_certificates: bool) -> Result<Self, DbProxyError> {
        if verify_certificates {
            Self::with_system_roots()
        } else {
            tracing::warn!("tls certificate verification disabled for database connections");
            Self::dangerous_no_verify()
        }
    }
}

impl From<Arc<rustls::ClientConfig>> for TlsConfig {
    fn from(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self { client_config }
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

// ── TcpConnectionFactory ─────────────────────────────────────────────

/// Dials TCP (optionally TLS) connections to database servers.
///
/// Used on its own it performs **no protocol handshake**: the guest drives
/// the whole wire conversation. The protocol factories build on
/// [`open_stream`](Self::open_stream) and [`secure`](Self::secure).
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    recv_timeout: Duration,
    connect_timeout: Duration,
    tls_config: Option<TlsConfig>,
}

impl TcpConnectionFactory {
    pub fn plain(recv_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            recv_timeout,
            connect_timeout,
            tls_config: None,
        }
    }

    pub fn with_tls(
        recv_timeout: Duration,
        connect_timeout: Duration,
        tls_config: TlsConfig,
    ) -> Self {
        Self {
            recv_timeout,
            connect_timeout,
            tls_config: Some(tls_config),
        }
    }

    pub fn uses_tls(&self) -> bool {
        self.tls_config.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn recv_timeout(&self) -> Duration {
        self.recv_timeout
    }

    /// Resolve and dial the key's address. The stream's read timeout is
    /// the connect timeout, for use during handshakes.
    pub fn open_stream(&self, key: &PoolKey) -> Result<TcpStream, DbProxyError> {
        let target = format!("{}:{}", key.host, key.port);
        let addrs: Vec<_> = target
            .to_socket_addrs()
            .map_err(|e| {
                DbProxyError::ConnectionRefused(format!("resolve {target}: {e}"))
            })?
            .collect();

        let mut last_err = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.connect_timeout))
                        .map_err(|e| io_error("set read timeout", e))?;
                    // Disable Nagle's algorithm for request/response exchanges.
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(
                        host = %key.host,
                        port = key.port,
                        %addr,
                        "established tcp connection"
                    );
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => dial_error(&target, e),
            None => DbProxyError::ConnectionRefused(format!("no address found for {target}")),
        })
    }

    /// Wrap `stream` in TLS when configured, otherwise keep it plain.
    /// Restores the steady-state recv timeout either way.
    pub fn secure(&self, key: &PoolKey, stream: TcpStream) -> Result<TcpBackend, DbProxyError> {
        stream
            .set_read_timeout(Some(self.recv_timeout))
            .map_err(|e| io_error("set read timeout", e))?;

        let Some(tls) = &self.tls_config else {
            return Ok(TcpBackend::plain(stream, self.recv_timeout));
        };

        let server_name = rustls::pki_types::ServerName::try_from(key.host.as_str())
            .map_err(|e| {
                DbProxyError::InvalidConfig(format!("invalid tls server name '{}': {e}", key.host))
            })?
            .to_owned();
        let tls_conn = rustls::ClientConnection::new(Arc::clone(&tls.client_config), server_name)
            .map_err(|e| DbProxyError::Protocol(format!("tls session: {e}")))?;

        let mut tls_stream = rustls::StreamOwned::new(tls_conn, stream);
        // Finish the handshake now so certificate errors surface at connect.
        while tls_stream.conn.is_handshaking() {
            tls_stream
                .conn
                .complete_io(&mut tls_stream.sock)
                .map_err(|e| io_error("tls handshake", e))?;
        }
        Ok(TcpBackend::tls(tls_stream, self.recv_timeout))
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(
        &self,
        key: &PoolKey,
        _password: Option<&str>,
    ) -> Result<Box<dyn ConnectionBackend>, DbProxyError> {
        let stream = self.open_stream(key)?;
        Ok(Box::new(self.secure(key, stream)?))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;

    pub(crate) fn start_tcp_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        (listener, addr)
    }

    pub(crate) fn start_echo_server() -> std::net::SocketAddr {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn connected(addr: std::net::SocketAddr, timeout: Duration) -> TcpBackend {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(timeout)).unwrap();
        TcpBackend::plain(stream, timeout)
    }

    fn local_key(port: u16) -> PoolKey {
        PoolKey::new("127.0.0.1", port, "testdb", "user")
    }

    fn tls_server_config() -> Arc<rustls::ServerConfig> {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let server_cert = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
        let server_key =
            rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
        Arc::new(
            rustls::ServerConfig::builder_with_provider(
                rustls::crypto::ring::default_provider().into(),
            )
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![server_cert], server_key)
            .unwrap(),
        )
    }

    fn start_tls_echo_server() -> std::net::SocketAddr {
        let server_config = tls_server_config();
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let tls_conn = rustls::ServerConnection::new(server_config).unwrap();
            let mut tls_stream = rustls::StreamOwned::new(tls_conn, tcp_stream);
            let mut buf = [0u8; 4096];
            loop {
                match tls_stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tls_stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        addr
    }

    // ── TcpBackend ──────────────────────────────────────────────────

    #[test]
    fn send_and_recv_roundtrip() {
        let addr = start_echo_server();
        let mut backend = connected(addr, Duration::from_secs(2));

        assert_eq!(backend.send(b"hello world").unwrap(), 11);
        assert_eq!(backend.recv(1024).unwrap(), b"hello world");
    }

    #[test]
    fn recv_returns_partial_data() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"short").unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });

        let mut backend = connected(addr, Duration::from_secs(2));
        assert_eq!(backend.recv(1024).unwrap(), b"short");
    }

    #[test]
    fn recv_timeout_maps_to_timeout() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(2));
        });

        let mut backend = connected(addr, Duration::from_millis(100));
        assert!(matches!(backend.recv(1024), Err(DbProxyError::Timeout(_))));
    }

    #[test]
    fn recv_at_eof_is_empty() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut backend = connected(addr, Duration::from_secs(2));
        assert_eq!(backend.recv(16).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn large_payload_passthrough() {
        let addr = start_echo_server();
        let mut backend = connected(addr, Duration::from_secs(5));

        let payload: Vec<u8> = (0..65536).map(|i| (i % 256) as u8).collect();
        assert_eq!(backend.send(&payload).unwrap(), 65536);

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let chunk = backend.recv(payload.len() - received.len()).unwrap();
            if chunk.is_empty() {
                break;
            }
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn ping_healthy_connection() {
        let addr = start_echo_server();
        let mut backend = connected(addr, Duration::from_secs(2));
        assert!(backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn ping_closed_connection() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut backend = connected(addr, Duration::from_secs(2));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!backend.ping(Duration::from_millis(50)));
    }

    #[test]
    fn send_after_close_fails() {
        let addr = start_echo_server();
        let mut backend = connected(addr, Duration::from_millis(200));
        backend.close();
        assert!(backend.send(b"data").is_err());
    }

    #[test]
    fn io_error_mapping() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let garbage = io::Error::new(io::ErrorKind::InvalidData, "bad record");
        assert!(matches!(io_error("recv", timeout), DbProxyError::Timeout(_)));
        assert!(matches!(io_error("recv", reset), DbProxyError::Closed(_)));
        assert!(matches!(io_error("recv", garbage), DbProxyError::Protocol(_)));
    }

    // ── TcpConnectionFactory ────────────────────────────────────────

    #[test]
    fn factory_creates_working_connection() {
        let addr = start_echo_server();
        let factory = TcpConnectionFactory::plain(Duration::from_secs(2), Duration::from_secs(2));

        let mut backend = factory.connect(&local_key(addr.port()), None).unwrap();
        assert_eq!(backend.send(b"test").unwrap(), 4);
        assert_eq!(backend.recv(1024).unwrap(), b"test");
    }

    #[test]
    fn factory_connect_refused() {
        let (listener, addr) = start_tcp_listener();
        drop(listener);
        let factory = TcpConnectionFactory::plain(Duration::from_secs(1), Duration::from_secs(1));

        let err = factory.connect(&local_key(addr.port()), None).unwrap_err();
        assert!(matches!(err, DbProxyError::ConnectionRefused(_)), "got {err:?}");
    }

    #[test]
    fn factory_applies_recv_timeout() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(2));
        });

        let factory =
            TcpConnectionFactory::plain(Duration::from_millis(100), Duration::from_secs(2));
        let mut backend = factory.connect(&local_key(addr.port()), None).unwrap();
        assert!(matches!(backend.recv(1024), Err(DbProxyError::Timeout(_))));
    }

    // ── TLS ─────────────────────────────────────────────────────────

    #[test]
    fn tls_config_with_system_roots_succeeds() {
        assert!(TlsConfig::with_system_roots().is_ok());
        assert!(TlsConfig::for_verification(false).is_ok());
    }

    #[test]
    fn tls_passthrough_preserves_exact_bytes() {
        let addr = start_tls_echo_server();
        let factory = TcpConnectionFactory::with_tls(
            Duration::from_secs(2),
            Duration::from_secs(2),
            TlsConfig::dangerous_no_verify().unwrap(),
        );

        let mut backend = factory.connect(&local_key(addr.port()), None).unwrap();
        let pg_bytes: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];
        backend.send(&pg_bytes).unwrap();
        assert_eq!(
            backend.recv(1024).unwrap(),
            pg_bytes,
            "TLS must not modify wire bytes"
        );
    }

    #[test]
    fn tls_rejects_untrusted_certificate() {
        let addr = start_tls_echo_server();
        let factory = TcpConnectionFactory::with_tls(
            Duration::from_secs(2),
            Duration::from_secs(2),
            TlsConfig::with_system_roots().unwrap(),
        );

        let key = PoolKey::new("localhost", addr.port(), "testdb", "user");
        let result = factory.connect(&key, None);
        assert!(result.is_err(), "self-signed certificate must not verify");
    }

    #[test]
    fn debug_format_reports_tls_flag() {
        let addr = start_echo_server();
        let backend = connected(addr, Duration::from_secs(1));
        assert!(format!("{backend:?}").contains("tls: false"));
    }
}
