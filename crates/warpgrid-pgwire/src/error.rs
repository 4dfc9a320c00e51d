//! Codec error types.

use thiserror::Error;

/// Errors raised while decoding Postgres frames.
///
/// A frame that is merely incomplete is never an error; decoders report
/// it by consuming nothing and waiting for more bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PgWireError {
    #[error("invalid length {length} for message type {:?}", *tag as char)]
    InvalidLength { tag: u8, length: i32 },

    #[error("message type {:?} declares {length} bytes, over the {max}-byte frame limit", *tag as char)]
    FrameTooLarge { tag: u8, length: usize, max: usize },

    #[error("malformed {message}: {reason}")]
    Malformed {
        message: &'static str,
        reason: String,
    },

    #[error("invalid UTF-8 in {message}")]
    InvalidUtf8 { message: &'static str },
}

impl PgWireError {
    pub(crate) fn malformed(message: &'static str, reason: impl Into<String>) -> Self {
        PgWireError::Malformed {
            message,
            reason: reason.into(),
        }
    }
}
