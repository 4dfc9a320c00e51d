//! Thin Postgres client over a proxied connection.
//!
//! The host normally authenticates pooled Postgres sockets itself, so a
//! fresh [`PgClient`] can send queries straight away. Hosts running in
//! guest-handshake mode hand out raw sockets; use
//! [`PgClient::connect_with_startup`] for those.
//!
//! Values travel in text format only. Closing the client returns the
//! socket to the host's pool, so it never sends Terminate.

use warp_core::{DatabaseProxy, DbProxyError, Protocol};
use warpgrid_pgwire::{
    AuthenticationRequest, BackendDecoder, BackendMessage, TransactionStatus, encode_bind,
    encode_describe_portal, encode_execute, encode_parse, encode_password_message,
    encode_simple_query, encode_startup, encode_sync,
};

use crate::config::DbConfig;
use crate::connection::Connection;
use crate::error::{DbError, Operation};

/// Bytes requested from the host per `recv`.
pub const RECV_CHUNK: u32 = 64 * 1024;

/// One row, every column decoded as text. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.values.get(idx)?.as_deref()
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.values.get(idx), Some(None))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }
}

/// Output of one SQL statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// CommandComplete tag, e.g. `SELECT 2` or `INSERT 0 1`.
    pub tag: String,
}

impl QueryResult {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of column `name` in row `row`.
    pub fn get(&self, row: usize, name: &str) -> Option<&str> {
        self.rows.get(row)?.get(self.column(name)?)
    }

    /// Row count from the command tag (its last word). 0 when the tag
    /// carries none, as for `BEGIN` or `CREATE TABLE`.
    pub fn rows_affected(&self) -> u64 {
        self.tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

pub struct PgClient<P: DatabaseProxy> {
    conn: Connection<P>,
    decoder: BackendDecoder,
    status: Option<TransactionStatus>,
    parameters: Vec<(String, String)>,
}

impl<P: DatabaseProxy> std::fmt::Debug for PgClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgClient")
            .field("conn", &self.conn)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<P: DatabaseProxy> PgClient<P> {
    /// Open a connection the host has already authenticated.
    pub fn connect(proxy: P, config: &DbConfig) -> Result<Self, DbError> {
        require_postgres(config)?;
        Ok(Self::from_connection(Connection::open(proxy, config)?))
    }

    /// Open a raw connection and run the startup exchange from the guest.
    /// Only cleartext password authentication is supported.
    pub fn connect_with_startup(proxy: P, config: &DbConfig) -> Result<Self, DbError> {
        require_postgres(config)?;
        let mut client = Self::from_connection(Connection::open(proxy, config)?);
        client.startup(config)?;
        Ok(client)
    }

    pub fn from_connection(conn: Connection<P>) -> Self {
        Self {
            conn,
            decoder: BackendDecoder::new(),
            status: None,
            parameters: Vec::new(),
        }
    }

    /// Transaction status from the most recent ReadyForQuery.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.status
    }

    /// Server parameter reported during a guest-side startup.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Run one or more `;`-separated statements with the simple protocol.
    pub fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryResult>, DbError> {
        self.conn.send_all(&encode_simple_query(sql))?;
        self.read_results(Operation::Query)
    }

    /// Run one statement with text parameters bound to `$1`, `$2`, ...
    ///
    /// The portal is described before it runs so the result carries
    /// column names.
    pub fn query(&mut self, sql: &str, params: &[Option<&str>]) -> Result<QueryResult, DbError> {
        let params: Vec<Option<&[u8]>> = params.iter().map(|p| p.map(str::as_bytes)).collect();
        let mut out = encode_parse("", sql, &[]);
        out.extend_from_slice(&encode_bind("", "", &params));
        out.extend_from_slice(&encode_describe_portal(""));
        out.extend_from_slice(&encode_execute("", 0));
        out.extend_from_slice(&encode_sync());
        self.conn.send_all(&out)?;
        let results = self.read_results(Operation::Query)?;
        Ok(results.into_iter().next().unwrap_or_default())
    }

    /// Run one statement and return the number of rows it affected.
    pub fn execute(&mut self, sql: &str, params: &[Option<&str>]) -> Result<u64, DbError> {
        Ok(self.query(sql, params)?.rows_affected())
    }

    /// Hand the connection back to the host.
    pub fn close(mut self) -> Result<(), DbError> {
        self.conn.close()
    }

    pub fn into_connection(self) -> Connection<P> {
        self.conn
    }

    fn startup(&mut self, config: &DbConfig) -> Result<(), DbError> {
        let op = Operation::Connect;
        self.conn
            .send_all(&encode_startup(&config.username, &config.database))?;
        loop {
            match self.next_message(op)? {
                BackendMessage::Authentication(AuthenticationRequest::Ok) => {}
                BackendMessage::Authentication(AuthenticationRequest::CleartextPassword) => {
                    let Some(password) = config.password.as_deref() else {
                        return Err(self.fail(op, "server requested a password, none configured"));
                    };
                    self.conn.send_all(&encode_password_message(password))?;
                }
                BackendMessage::Authentication(other) => {
                    let msg = format!("unsupported authentication method (code {})", other.code());
                    return Err(self.fail(op, &msg));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.push((name, value));
                }
                BackendMessage::ErrorResponse(fields) => {
                    let err = DbError::server(op, &fields);
                    self.conn.abandon(&err);
                    return Err(err);
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.status = Some(status);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Collect statement results up to ReadyForQuery. A server error is
    /// reported only after ReadyForQuery so the session stays in sync.
    fn read_results(&mut self, op: Operation) -> Result<Vec<QueryResult>, DbError> {
        let mut results = Vec::new();
        let mut current = QueryResult::default();
        let mut server_error = None;

        loop {
            match self.next_message(op)? {
                BackendMessage::RowDescription(fields) => {
                    current.columns = fields.into_iter().map(|f| f.name).collect();
                }
                BackendMessage::DataRow(row) => {
                    let values = row.to_strings().map_err(|e| {
                        let err = DbError::new(op, e);
                        self.conn.abandon(&err);
                        err
                    })?;
                    current.rows.push(Row { values });
                }
                BackendMessage::CommandComplete { tag } => {
                    current.tag = tag;
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::ErrorResponse(fields) => {
                    current = QueryResult::default();
                    if server_error.is_none() {
                        server_error = Some(fields);
                    }
                }
                BackendMessage::NoticeResponse(fields) => {
                    tracing::debug!(notice = %fields, "postgres notice");
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.status = Some(status);
                    break;
                }
                _ => {}
            }
        }

        match server_error {
            Some(fields) => Err(DbError::server(op, &fields)),
            None => Ok(results),
        }
    }

    fn next_message(&mut self, op: Operation) -> Result<BackendMessage, DbError> {
        loop {
            match self.decoder.next_message() {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(e) => {
                    let err = DbError::new(op, e);
                    self.conn.abandon(&err);
                    return Err(err);
                }
            }
            let chunk = self.conn.recv(RECV_CHUNK)?;
            if chunk.is_empty() {
                return Err(self.fail_closed(op));
            }
            self.decoder.feed(&chunk);
        }
    }

    fn fail(&mut self, op: Operation, msg: &str) -> DbError {
        let err = DbError::new(op, DbProxyError::Protocol(msg.to_string()));
        self.conn.abandon(&err);
        err
    }

    fn fail_closed(&mut self, op: Operation) -> DbError {
        let err = DbError::new(
            op,
            DbProxyError::Closed("server closed the connection".into()),
        );
        self.conn.abandon(&err);
        err
    }
}

fn require_postgres(config: &DbConfig) -> Result<(), DbError> {
    if config.protocol != Protocol::Postgres {
        return Err(DbError::new(
            Operation::Connect,
            DbProxyError::InvalidConfig(format!(
                "PgClient needs a postgres connection, got {}",
                config.protocol
            )),
        ));
    }
    Ok(())
}
