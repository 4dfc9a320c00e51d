//! Client-to-server messages.
//!
//! Extended-query values are always sent in text format: Bind carries zero
//! parameter and result format codes, which the server reads as "all text".

use bytes::{BufMut, Bytes};

use crate::backend::Parsed;
use crate::error::PgWireError;
use crate::frame::{patch_length, put_cstr, put_frame, put_nullable, split_frame};
use crate::reader::Reader;
use crate::{DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION_3, SSL_REQUEST_CODE};

/// StartupMessage with `user` and `database` parameters.
pub fn encode_startup(user: &str, database: &str) -> Vec<u8> {
    encode_startup_with_params(&[("user", user), ("database", database)])
}

/// StartupMessage with arbitrary parameters, in the given order.
pub fn encode_startup_with_params(params: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_i32(0);
    out.put_i32(PROTOCOL_VERSION_3);
    for (key, value) in params {
        put_cstr(&mut out, key);
        put_cstr(&mut out, value);
    }
    out.put_u8(0);
    patch_length(&mut out, 0);
    out
}

/// SSLRequest: `int32 8 | int32 80877103`.
pub fn encode_ssl_request() -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.put_i32(8);
    out.put_i32(SSL_REQUEST_CODE);
    out
}

pub fn encode_simple_query(sql: &str) -> Vec<u8> {
    let mut out = Vec::new();
    put_frame(&mut out, b'Q', |b| put_cstr(b, sql));
    out
}

pub fn encode_password_message(password: &str) -> Vec<u8> {
    let mut out = Vec::new();
    put_frame(&mut out, b'p', |b| put_cstr(b, password));
    out
}

pub fn encode_terminate() -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    put_frame(&mut out, b'X', |_| {});
    out
}

pub fn encode_sync() -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    put_frame(&mut out, b'S', |_| {});
    out
}

/// Parse: prepare `sql` as statement `name` (empty = unnamed).
pub fn encode_parse(name: &str, sql: &str, param_types: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    put_parse(&mut out, name, sql, param_types);
    out
}

/// Bind text-format `params` to `statement`, creating `portal`.
pub fn encode_bind(portal: &str, statement: &str, params: &[Option<&[u8]>]) -> Vec<u8> {
    let mut out = Vec::new();
    put_bind(&mut out, portal, statement, &[], params, &[]);
    out
}

/// Execute `portal`, returning at most `max_rows` rows (0 = no limit).
pub fn encode_execute(portal: &str, max_rows: i32) -> Vec<u8> {
    let mut out = Vec::new();
    put_frame(&mut out, b'E', |b| {
        put_cstr(b, portal);
        b.put_i32(max_rows);
    });
    out
}

/// Describe `portal`, so the server reports its RowDescription (or NoData).
pub fn encode_describe_portal(portal: &str) -> Vec<u8> {
    let mut out = Vec::new();
    put_describe(&mut out, b'P', portal);
    out
}

/// Parse, Bind, Execute and Sync, in that order, for a one-shot
/// parameterized query using the unnamed statement and portal. `None`
/// parameters are sent as NULL.
pub fn encode_extended_query(sql: &str, params: &[Option<&str>]) -> Vec<u8> {
    let params: Vec<Option<&[u8]>> = params.iter().map(|p| p.map(str::as_bytes)).collect();
    let mut out = Vec::new();
    put_parse(&mut out, "", sql, &[]);
    put_bind(&mut out, "", "", &[], &params, &[]);
    out.extend_from_slice(&encode_execute("", 0));
    out.extend_from_slice(&encode_sync());
    out
}

fn put_describe(out: &mut Vec<u8>, target: u8, name: &str) {
    put_frame(out, b'D', |b| {
        b.put_u8(target);
        put_cstr(b, name);
    });
}

fn put_parse(out: &mut Vec<u8>, name: &str, sql: &str, param_types: &[u32]) {
    put_frame(out, b'P', |b| {
        put_cstr(b, name);
        put_cstr(b, sql);
        b.put_i16(param_types.len() as i16);
        for oid in param_types {
            b.put_u32(*oid);
        }
    });
}

fn put_bind(
    out: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    param_formats: &[i16],
    params: &[Option<&[u8]>],
    result_formats: &[i16],
) {
    put_frame(out, b'B', |b| {
        put_cstr(b, portal);
        put_cstr(b, statement);
        b.put_i16(param_formats.len() as i16);
        for f in param_formats {
            b.put_i16(*f);
        }
        b.put_i16(params.len() as i16);
        for p in params {
            put_nullable(b, *p);
        }
        b.put_i16(result_formats.len() as i16);
        for f in result_formats {
            b.put_i16(*f);
        }
    });
}

/// Decoded StartupMessage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub protocol_version: i32,
    pub params: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn user(&self) -> Option<&str> {
        self.param("user")
    }

    pub fn database(&self) -> Option<&str> {
        self.param("database")
    }
}

/// First packet a client sends on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupPacket {
    Startup(StartupMessage),
    SslRequest,
}

/// Decode the untagged first packet of a connection.
///
/// Returns the packet and the bytes it occupied, or `Ok(None)` if the
/// packet is not fully buffered.
pub fn decode_startup(buf: &[u8]) -> Result<Option<(StartupPacket, usize)>, PgWireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length < 8 {
        return Err(PgWireError::InvalidLength { tag: 0, length });
    }
    let total = length as usize;
    if total - 4 > DEFAULT_MAX_FRAME_SIZE {
        return Err(PgWireError::FrameTooLarge {
            tag: 0,
            length: total - 4,
            max: DEFAULT_MAX_FRAME_SIZE,
        });
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut r = Reader::new(&buf[4..total], "StartupMessage");
    let protocol_version = r.read_i32()?;
    if protocol_version == SSL_REQUEST_CODE {
        r.expect_end()?;
        return Ok(Some((StartupPacket::SslRequest, total)));
    }
    if protocol_version != PROTOCOL_VERSION_3 {
        return Err(PgWireError::malformed(
            "StartupMessage",
            format!("unsupported protocol version {protocol_version}"),
        ));
    }
    let mut params = Vec::new();
    loop {
        let key = r.read_cstr()?;
        if key.is_empty() {
            break;
        }
        let value = r.read_cstr()?;
        params.push((key.to_string(), value.to_string()));
    }
    r.expect_end()?;
    Ok(Some((
        StartupPacket::Startup(StartupMessage {
            protocol_version,
            params,
        }),
        total,
    )))
}

/// Tagged client messages, as seen by a server or a wire-level test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query {
        sql: String,
    },
    Parse {
        name: String,
        sql: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Bytes>>,
        result_formats: Vec<i16>,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    /// `target` is `b'S'` for a statement or `b'P'` for a portal.
    Describe {
        target: u8,
        name: String,
    },
    Sync,
    PasswordMessage {
        password: String,
    },
    Terminate,
}

impl FrontendMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FrontendMessage::Query { sql } => encode_simple_query(sql),
            FrontendMessage::Parse {
                name,
                sql,
                param_types,
            } => encode_parse(name, sql, param_types),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                let params: Vec<Option<&[u8]>> = params.iter().map(|p| p.as_deref()).collect();
                let mut out = Vec::new();
                put_bind(&mut out, portal, statement, param_formats, &params, result_formats);
                out
            }
            FrontendMessage::Execute { portal, max_rows } => encode_execute(portal, *max_rows),
            FrontendMessage::Describe { target, name } => {
                let mut out = Vec::new();
                put_describe(&mut out, *target, name);
                out
            }
            FrontendMessage::Sync => encode_sync(),
            FrontendMessage::PasswordMessage { password } => encode_password_message(password),
            FrontendMessage::Terminate => encode_terminate(),
        }
    }

    /// Decode one frame payload. `Ok(None)` for types not modelled here.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Option<Self>, PgWireError> {
        let msg = match tag {
            b'Q' => {
                let mut r = Reader::new(payload, "Query");
                let sql = r.read_cstr()?.to_string();
                r.expect_end()?;
                FrontendMessage::Query { sql }
            }
            b'P' => {
                let mut r = Reader::new(payload, "Parse");
                let name = r.read_cstr()?.to_string();
                let sql = r.read_cstr()?.to_string();
                let count = read_count(&mut r, "Parse")?;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(r.read_u32()?);
                }
                r.expect_end()?;
                FrontendMessage::Parse {
                    name,
                    sql,
                    param_types,
                }
            }
            b'B' => {
                let mut r = Reader::new(payload, "Bind");
                let portal = r.read_cstr()?.to_string();
                let statement = r.read_cstr()?.to_string();
                let param_formats = read_i16_list(&mut r)?;
                let count = read_count(&mut r, "Bind")?;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    params.push(r.read_nullable()?);
                }
                let result_formats = read_i16_list(&mut r)?;
                r.expect_end()?;
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            b'E' => {
                let mut r = Reader::new(payload, "Execute");
                let portal = r.read_cstr()?.to_string();
                let max_rows = r.read_i32()?;
                r.expect_end()?;
                FrontendMessage::Execute { portal, max_rows }
            }
            b'D' => {
                let mut r = Reader::new(payload, "Describe");
                let target = r.read_u8()?;
                if target != b'S' && target != b'P' {
                    return Err(PgWireError::malformed(
                        "Describe",
                        format!("unknown target {:?}", target as char),
                    ));
                }
                let name = r.read_cstr()?.to_string();
                r.expect_end()?;
                FrontendMessage::Describe { target, name }
            }
            b'S' => FrontendMessage::Sync,
            b'X' => FrontendMessage::Terminate,
            b'p' => {
                let mut r = Reader::new(payload, "PasswordMessage");
                let password = r.read_cstr()?.to_string();
                r.expect_end()?;
                FrontendMessage::PasswordMessage { password }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

fn read_count(r: &mut Reader<'_>, message: &'static str) -> Result<usize, PgWireError> {
    let count = r.read_i16()?;
    usize::try_from(count)
        .map_err(|_| PgWireError::malformed(message, format!("negative count {count}")))
}

fn read_i16_list(r: &mut Reader<'_>) -> Result<Vec<i16>, PgWireError> {
    let count = read_count(r, "Bind")?;
    (0..count).map(|_| r.read_i16()).collect()
}

/// Decode every complete tagged client frame in `buf`. The startup packet
/// is untagged and must be split off with [`decode_startup`] first.
pub fn parse_frontend_messages(buf: &[u8]) -> Result<Parsed<FrontendMessage>, PgWireError> {
    let mut messages = Vec::new();
    let mut consumed = 0;
    while let Some(frame) = split_frame(&buf[consumed..], DEFAULT_MAX_FRAME_SIZE)? {
        if let Some(msg) = FrontendMessage::decode(frame.tag, frame.payload)? {
            messages.push(msg);
        }
        consumed += frame.total_len;
    }
    Ok(Parsed { messages, consumed })
}
