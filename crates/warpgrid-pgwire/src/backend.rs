//! Server-to-client messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PgWireError;
use crate::frame::{put_cstr, put_frame, put_nullable, split_frame};
use crate::reader::Reader;
use crate::DEFAULT_MAX_FRAME_SIZE;

/// Authentication request sub-types carried by an `'R'` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationRequest {
    /// 0: authentication succeeded.
    Ok,
    /// 3: server wants the password in clear text.
    CleartextPassword,
    /// 5: server wants an MD5-hashed password with this salt.
    Md5Password { salt: [u8; 4] },
    /// Any other sub-type (SASL, GSS, ...). Trailing data is dropped.
    Other(i32),
}

impl AuthenticationRequest {
    pub fn code(&self) -> i32 {
        match self {
            AuthenticationRequest::Ok => 0,
            AuthenticationRequest::CleartextPassword => 3,
            AuthenticationRequest::Md5Password { .. } => 5,
            AuthenticationRequest::Other(code) => *code,
        }
    }
}

/// Backend transaction status reported in ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `'I'`: not in a transaction block.
    Idle,
    /// `'T'`: inside a transaction block.
    InTransaction,
    /// `'E'`: inside a failed transaction block.
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary.
    pub format: i16,
}

impl FieldDescription {
    /// A text-format column not tied to any table.
    pub fn text(name: &str, type_oid: u32) -> Self {
        Self {
            name: name.to_string(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_len: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// Column values of one result row. `None` is SQL NULL; an empty value is
/// a zero-length, non-null field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataRow {
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    /// Build a row from text values.
    pub fn from_text(values: &[Option<&str>]) -> Self {
        Self {
            values: values
                .iter()
                .map(|v| v.map(|s| Bytes::copy_from_slice(s.as_bytes())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.values.get(idx), Some(None))
    }

    /// Text value of column `idx`. `None` for NULL, out-of-range, or
    /// non-UTF-8 columns.
    pub fn value_str(&self, idx: usize) -> Option<&str> {
        let bytes = self.values.get(idx)?.as_ref()?;
        std::str::from_utf8(bytes).ok()
    }

    /// Decode every column as UTF-8 text.
    pub fn to_strings(&self) -> Result<Vec<Option<String>>, PgWireError> {
        self.values
            .iter()
            .map(|v| match v {
                None => Ok(None),
                Some(bytes) => std::str::from_utf8(bytes)
                    .map(|s| Some(s.to_string()))
                    .map_err(|_| PgWireError::InvalidUtf8 { message: "DataRow" }),
            })
            .collect()
    }
}

/// Code/value pairs of an ErrorResponse or NoticeResponse, in wire order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorFields {
    pub fields: Vec<(u8, String)>,
}

impl ErrorFields {
    pub fn new(severity: &str, code: &str, message: &str) -> Self {
        Self {
            fields: vec![
                (b'S', severity.to_string()),
                (b'C', code.to_string()),
                (b'M', message.to_string()),
            ],
        }
    }

    pub fn with(mut self, code: u8, value: &str) -> Self {
        self.fields.push((code, value.to_string()));
        self
    }

    pub fn get(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    /// Localized severity, falling back to the non-localized `'V'` field.
    pub fn severity(&self) -> Option<&str> {
        self.get(b'S').or_else(|| self.get(b'V'))
    }

    /// SQLSTATE code.
    pub fn code(&self) -> Option<&str> {
        self.get(b'C')
    }

    pub fn message(&self) -> Option<&str> {
        self.get(b'M')
    }

    pub fn detail(&self) -> Option<&str> {
        self.get(b'D')
    }

    pub fn hint(&self) -> Option<&str> {
        self.get(b'H')
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.severity().unwrap_or("ERROR"),
            self.message().unwrap_or("<no message>")
        )?;
        if let Some(code) = self.code() {
            write!(f, " ({code})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthenticationRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),
    ParseComplete,
    BindComplete,
    RowDescription(Vec<FieldDescription>),
    DataRow(DataRow),
    CommandComplete { tag: String },
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
}

impl BackendMessage {
    /// Type byte this message is framed with.
    pub fn tag(&self) -> u8 {
        match self {
            BackendMessage::Authentication(_) => b'R',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ReadyForQuery(_) => b'Z',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::BindComplete => b'2',
            BackendMessage::RowDescription(_) => b'T',
            BackendMessage::DataRow(_) => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ErrorResponse(_) => b'E',
            BackendMessage::NoticeResponse(_) => b'N',
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Append this message's frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        put_frame(out, self.tag(), |b| match self {
            BackendMessage::Authentication(req) => {
                b.put_i32(req.code());
                if let AuthenticationRequest::Md5Password { salt } = req {
                    b.put_slice(salt);
                }
            }
            BackendMessage::ParameterStatus { name, value } => {
                put_cstr(b, name);
                put_cstr(b, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                b.put_i32(*process_id);
                b.put_i32(*secret_key);
            }
            BackendMessage::ReadyForQuery(status) => b.put_u8(status.as_byte()),
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::EmptyQueryResponse => {}
            BackendMessage::RowDescription(fields) => {
                b.put_i16(fields.len() as i16);
                for field in fields {
                    put_cstr(b, &field.name);
                    b.put_u32(field.table_oid);
                    b.put_i16(field.column_id);
                    b.put_u32(field.type_oid);
                    b.put_i16(field.type_len);
                    b.put_i32(field.type_modifier);
                    b.put_i16(field.format);
                }
            }
            BackendMessage::DataRow(row) => {
                b.put_i16(row.values.len() as i16);
                for value in &row.values {
                    put_nullable(b, value.as_deref());
                }
            }
            BackendMessage::CommandComplete { tag } => put_cstr(b, tag),
            BackendMessage::ErrorResponse(fields) | BackendMessage::NoticeResponse(fields) => {
                for (code, value) in &fields.fields {
                    b.put_u8(*code);
                    put_cstr(b, value);
                }
                b.put_u8(0);
            }
        });
    }
}

/// Messages fully decoded from a buffer and how many bytes they used.
/// Bytes past `consumed` belong to an incomplete trailing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed<M = BackendMessage> {
    pub messages: Vec<M>,
    pub consumed: usize,
}

/// Decode every complete backend frame in `buf`.
///
/// Unrecognized message types are skipped by their declared length. A
/// partial trailing frame is not an error; it is left unconsumed.
pub fn parse_backend_messages(buf: &[u8]) -> Result<Parsed, PgWireError> {
    parse_backend_messages_with_limit(buf, DEFAULT_MAX_FRAME_SIZE)
}

pub fn parse_backend_messages_with_limit(
    buf: &[u8],
    max_frame_size: usize,
) -> Result<Parsed, PgWireError> {
    let mut messages = Vec::new();
    let mut consumed = 0;
    while let Some(frame) = split_frame(&buf[consumed..], max_frame_size)? {
        if let Some(msg) = decode_frame(frame.tag, frame.payload)? {
            messages.push(msg);
        }
        consumed += frame.total_len;
    }
    Ok(Parsed { messages, consumed })
}

/// Decode a single frame payload. `Ok(None)` for unknown tags.
fn decode_frame(tag: u8, payload: &[u8]) -> Result<Option<BackendMessage>, PgWireError> {
    let msg = match tag {
        b'R' => {
            let mut r = Reader::new(payload, "Authentication");
            let req = match r.read_i32()? {
                0 => AuthenticationRequest::Ok,
                3 => AuthenticationRequest::CleartextPassword,
                5 => {
                    let salt = r.read_bytes(4)?;
                    AuthenticationRequest::Md5Password {
                        salt: [salt[0], salt[1], salt[2], salt[3]],
                    }
                }
                // SASL and friends carry variable trailing data.
                other => {
                    return Ok(Some(BackendMessage::Authentication(
                        AuthenticationRequest::Other(other),
                    )));
                }
            };
            r.expect_end()?;
            BackendMessage::Authentication(req)
        }
        b'S' => {
            let mut r = Reader::new(payload, "ParameterStatus");
            let name = r.read_cstr()?.to_string();
            let value = r.read_cstr()?.to_string();
            r.expect_end()?;
            BackendMessage::ParameterStatus { name, value }
        }
        b'K' => {
            let mut r = Reader::new(payload, "BackendKeyData");
            let process_id = r.read_i32()?;
            let secret_key = r.read_i32()?;
            r.expect_end()?;
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            }
        }
        b'Z' => {
            let mut r = Reader::new(payload, "ReadyForQuery");
            let b = r.read_u8()?;
            r.expect_end()?;
            let status = TransactionStatus::from_byte(b).ok_or_else(|| {
                PgWireError::malformed("ReadyForQuery", format!("unknown status {:?}", b as char))
            })?;
            BackendMessage::ReadyForQuery(status)
        }
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'I' => BackendMessage::EmptyQueryResponse,
        b'T' => BackendMessage::RowDescription(decode_row_description(payload)?),
        b'D' => BackendMessage::DataRow(decode_data_row(payload)?),
        b'C' => {
            let mut r = Reader::new(payload, "CommandComplete");
            let tag = r.read_cstr()?.to_string();
            r.expect_end()?;
            BackendMessage::CommandComplete { tag }
        }
        b'E' => BackendMessage::ErrorResponse(decode_error_fields(payload, "ErrorResponse")?),
        b'N' => BackendMessage::NoticeResponse(decode_error_fields(payload, "NoticeResponse")?),
        _ => return Ok(None),
    };
    Ok(Some(msg))
}

fn read_count(r: &mut Reader<'_>, message: &'static str) -> Result<usize, PgWireError> {
    let count = r.read_i16()?;
    usize::try_from(count)
        .map_err(|_| PgWireError::malformed(message, format!("negative count {count}")))
}

fn decode_row_description(payload: &[u8]) -> Result<Vec<FieldDescription>, PgWireError> {
    let mut r = Reader::new(payload, "RowDescription");
    let count = read_count(&mut r, "RowDescription")?;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        fields.push(FieldDescription {
            name: r.read_cstr()?.to_string(),
            table_oid: r.read_u32()?,
            column_id: r.read_i16()?,
            type_oid: r.read_u32()?,
            type_len: r.read_i16()?,
            type_modifier: r.read_i32()?,
            format: r.read_i16()?,
        });
    }
    r.expect_end()?;
    Ok(fields)
}

fn decode_data_row(payload: &[u8]) -> Result<DataRow, PgWireError> {
    let mut r = Reader::new(payload, "DataRow");
    let count = read_count(&mut r, "DataRow")?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(r.read_nullable()?);
    }
    r.expect_end()?;
    Ok(DataRow { values })
}

fn decode_error_fields(payload: &[u8], message: &'static str) -> Result<ErrorFields, PgWireError> {
    let mut r = Reader::new(payload, message);
    let mut fields = Vec::new();
    loop {
        let code = r.read_u8()?;
        if code == 0 {
            break;
        }
        fields.push((code, r.read_cstr()?.to_string()));
    }
    r.expect_end()?;
    Ok(ErrorFields { fields })
}

/// Incremental decoder for a backend byte stream.
///
/// Bytes are fed as they arrive from the socket; complete messages are
/// yielded in order and partial frames stay buffered.
#[derive(Debug)]
pub struct BackendDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for BackendDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, skipping unknown types. `Ok(None)` means
    /// more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>, PgWireError> {
        loop {
            let (msg, used) = match split_frame(&self.buf, self.max_frame_size)? {
                None => return Ok(None),
                Some(frame) => (decode_frame(frame.tag, frame.payload)?, frame.total_len),
            };
            self.buf.advance(used);
            if msg.is_some() {
                return Ok(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: u8) -> Vec<u8> {
        vec![b'Z', 0, 0, 0, 5, status]
    }

    #[test]
    fn auth_ok_wire_bytes() {
        let bytes = BackendMessage::Authentication(AuthenticationRequest::Ok).encode();
        assert_eq!(bytes, [b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn ready_for_query_wire_bytes() {
        let bytes = BackendMessage::ReadyForQuery(TransactionStatus::Idle).encode();
        assert_eq!(bytes, ready(b'I'));
    }

    #[test]
    fn concatenated_messages_split_in_order() {
        let mut buf = BackendMessage::Authentication(AuthenticationRequest::Ok).encode();
        buf.extend_from_slice(&ready(b'I'));

        let parsed = parse_backend_messages(&buf).unwrap();
        assert_eq!(parsed.consumed, buf.len());
        assert_eq!(
            parsed.messages,
            vec![
                BackendMessage::Authentication(AuthenticationRequest::Ok),
                BackendMessage::ReadyForQuery(TransactionStatus::Idle),
            ]
        );
    }

    #[test]
    fn partial_trailing_frame_is_left_for_next_read() {
        let mut buf = ready(b'T');
        let row = BackendMessage::DataRow(DataRow::from_text(&[Some("1")])).encode();
        buf.extend_from_slice(&row[..row.len() - 2]);

        let parsed = parse_backend_messages(&buf).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.consumed, 6);
    }

    #[test]
    fn unknown_types_are_skipped() {
        // NotificationResponse 'A' is not modelled.
        let mut buf = vec![b'A', 0, 0, 0, 8, 1, 2, 3, 4];
        buf.extend_from_slice(&ready(b'I'));
        let parsed = parse_backend_messages(&buf).unwrap();
        assert_eq!(
            parsed.messages,
            vec![BackendMessage::ReadyForQuery(TransactionStatus::Idle)]
        );
        assert_eq!(parsed.consumed, buf.len());
    }

    #[test]
    fn cleartext_password_request() {
        let buf = [b'R', 0, 0, 0, 8, 0, 0, 0, 3];
        let parsed = parse_backend_messages(&buf).unwrap();
        assert_eq!(
            parsed.messages,
            vec![BackendMessage::Authentication(
                AuthenticationRequest::CleartextPassword
            )]
        );
    }

    #[test]
    fn sasl_request_keeps_subtype() {
        let mut buf = Vec::new();
        put_frame(&mut buf, b'R', |b| {
            b.put_i32(10);
            put_cstr(b, "SCRAM-SHA-256");
            b.put_u8(0);
        });
        let parsed = parse_backend_messages(&buf).unwrap();
        assert_eq!(
            parsed.messages,
            vec![BackendMessage::Authentication(AuthenticationRequest::Other(10))]
        );
    }

    #[test]
    fn data_row_text_and_null() {
        let row = DataRow::from_text(&[Some("1"), Some("Alice")]);
        let parsed = parse_backend_messages(&BackendMessage::DataRow(row).encode()).unwrap();
        let BackendMessage::DataRow(row) = &parsed.messages[0] else {
            panic!("expected DataRow, got {:?}", parsed.messages);
        };
        assert_eq!(row.value_str(0), Some("1"));
        assert_eq!(row.value_str(1), Some("Alice"));

        let null_row = [b'D', 0, 0, 0, 10, 0, 1, 0xff, 0xff, 0xff, 0xff];
        let parsed = parse_backend_messages(&null_row).unwrap();
        let BackendMessage::DataRow(row) = &parsed.messages[0] else {
            panic!("expected DataRow");
        };
        assert_eq!(row.to_strings().unwrap(), vec![None]);
    }

    #[test]
    fn empty_value_is_not_null() {
        let row = DataRow::from_text(&[Some("")]);
        let parsed = parse_backend_messages(&BackendMessage::DataRow(row).encode()).unwrap();
        let BackendMessage::DataRow(row) = &parsed.messages[0] else {
            panic!("expected DataRow");
        };
        assert!(!row.is_null(0));
        assert_eq!(row.to_strings().unwrap(), vec![Some(String::new())]);
    }

    #[test]
    fn data_row_value_overrunning_frame_is_malformed() {
        // One column claiming 100 bytes inside a 10-byte frame.
        let buf = [b'D', 0, 0, 0, 10, 0, 1, 0, 0, 0, 100];
        assert!(matches!(
            parse_backend_messages(&buf),
            Err(PgWireError::Malformed { message: "DataRow", .. })
        ));
    }

    #[test]
    fn error_response_fields() {
        let fields = ErrorFields::new("ERROR", "42P01", "relation \"foo\" does not exist");
        let parsed =
            parse_backend_messages(&BackendMessage::ErrorResponse(fields).encode()).unwrap();
        let BackendMessage::ErrorResponse(fields) = &parsed.messages[0] else {
            panic!("expected ErrorResponse");
        };
        assert_eq!(fields.severity(), Some("ERROR"));
        assert_eq!(fields.code(), Some("42P01"));
        assert_eq!(fields.message(), Some("relation \"foo\" does not exist"));
        assert_eq!(
            fields.to_string(),
            "ERROR: relation \"foo\" does not exist (42P01)"
        );
    }

    #[test]
    fn unknown_ready_status_is_malformed() {
        assert!(parse_backend_messages(&ready(b'X')).is_err());
    }

    #[test]
    fn frame_limit_applies() {
        let row = BackendMessage::DataRow(DataRow::from_text(&[Some("0123456789")])).encode();
        assert!(matches!(
            parse_backend_messages_with_limit(&row, 8),
            Err(PgWireError::FrameTooLarge { tag: b'D', .. })
        ));
    }

    #[test]
    fn decoder_reassembles_byte_by_byte() {
        let mut stream = BackendMessage::CommandComplete {
            tag: "SELECT 1".into(),
        }
        .encode();
        stream.extend_from_slice(&ready(b'I'));

        let mut decoder = BackendDecoder::new();
        let mut out = Vec::new();
        for b in &stream {
            decoder.feed(std::slice::from_ref(b));
            while let Some(msg) = decoder.next_message().unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(
            out,
            vec![
                BackendMessage::CommandComplete {
                    tag: "SELECT 1".into()
                },
                BackendMessage::ReadyForQuery(TransactionStatus::Idle),
            ]
        );
        assert_eq!(decoder.buffered(), 0);
    }
}
