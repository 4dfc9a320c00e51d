//! Postgres v3.0 wire protocol codec.
//!
//! Pure encode/decode functions with no I/O. The database proxy host uses
//! it for its own startup handshake and health probes; guest SDKs use it to
//! speak Postgres over the raw byte pipe; tests use it to assert the pipe
//! delivered bytes unmodified.
//!
//! All integers are big-endian. Every backend frame is
//! `type:u8 | length:i32 | payload` where `length` counts itself but not
//! the type byte. Decoders bound each declared length by
//! [`DEFAULT_MAX_FRAME_SIZE`] (or a caller-supplied limit) before slicing,
//! and leave partial trailing frames for the next read.

pub mod backend;
pub mod error;
mod frame;
pub mod frontend;
mod reader;

pub use backend::{
    parse_backend_messages, parse_backend_messages_with_limit, AuthenticationRequest,
    BackendDecoder, BackendMessage, DataRow, ErrorFields, FieldDescription, Parsed,
    TransactionStatus,
};
pub use error::PgWireError;
pub use frontend::{
    decode_startup, encode_bind, encode_describe_portal, encode_execute, encode_extended_query,
    encode_parse, encode_password_message, encode_simple_query, encode_ssl_request,
    encode_startup, encode_startup_with_params, encode_sync, encode_terminate,
    parse_frontend_messages, FrontendMessage, StartupMessage, StartupPacket,
};

/// Protocol version 3.0 as sent in the StartupMessage (`3 << 16`).
pub const PROTOCOL_VERSION_3: i32 = 196_608;

/// Magic protocol code of an SSLRequest packet.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Upper bound on a single frame's declared length (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the `type:u8 | length:i32` header of a tagged frame.
pub const HEADER_LEN: usize = 5;
