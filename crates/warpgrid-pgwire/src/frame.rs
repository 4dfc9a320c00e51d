//! Tagged frame splitting and length back-patching.

use bytes::BufMut;

use crate::error::PgWireError;
use crate::HEADER_LEN;

/// One complete `type | length | payload` frame borrowed from a buffer.
pub(crate) struct Frame<'a> {
    pub tag: u8,
    pub payload: &'a [u8],
    /// Bytes occupied in the source buffer, header included.
    pub total_len: usize,
}

/// Split the next frame off the front of `buf`.
///
/// Returns `Ok(None)` when the header or payload is not fully buffered yet.
/// Declared lengths are checked against `max_frame_size` before the
/// payload is sliced, so a hostile length never drives an allocation.
pub(crate) fn split_frame(
    buf: &[u8],
    max_frame_size: usize,
) -> Result<Option<Frame<'_>>, PgWireError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = buf[0];
    let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if length < 4 {
        return Err(PgWireError::InvalidLength { tag, length });
    }
    let body_len = length as usize - 4;
    if body_len > max_frame_size {
        return Err(PgWireError::FrameTooLarge {
            tag,
            length: body_len,
            max: max_frame_size,
        });
    }
    let total_len = HEADER_LEN + body_len;
    if buf.len() < total_len {
        return Ok(None);
    }
    Ok(Some(Frame {
        tag,
        payload: &buf[HEADER_LEN..total_len],
        total_len,
    }))
}

/// Append a tagged frame whose body is written by `body`, then patch the
/// length field to cover itself and the body.
pub(crate) fn put_frame(out: &mut Vec<u8>, tag: u8, body: impl FnOnce(&mut Vec<u8>)) {
    out.put_u8(tag);
    let len_at = out.len();
    out.put_i32(0);
    body(out);
    patch_length(out, len_at);
}

/// Overwrite the i32 at `len_at` with the number of bytes from there to
/// the end of `out`.
pub(crate) fn patch_length(out: &mut [u8], len_at: usize) {
    let len = (out.len() - len_at) as i32;
    out[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

pub(crate) fn put_cstr(out: &mut Vec<u8>, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

/// `-1` for NULL, otherwise a 4-byte length and the raw bytes.
pub(crate) fn put_nullable(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        None => out.put_i32(-1),
        Some(bytes) => {
            out.put_i32(bytes.len() as i32);
            out.put_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_header_waits() {
        assert!(split_frame(&[b'Z', 0, 0], 1024).unwrap().is_none());
    }

    #[test]
    fn incomplete_payload_waits() {
        assert!(split_frame(&[b'Z', 0, 0, 0, 5], 1024).unwrap().is_none());
    }

    #[test]
    fn length_below_four_is_rejected() {
        let err = split_frame(&[b'Z', 0, 0, 0, 3], 1024).err().unwrap();
        assert_eq!(err, PgWireError::InvalidLength { tag: b'Z', length: 3 });

        let negative = [b'D', 0xff, 0xff, 0xff, 0xf0];
        assert!(matches!(
            split_frame(&negative, 1024),
            Err(PgWireError::InvalidLength { .. })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        // Declares ~2 GiB with only the header present.
        let buf = [b'D', 0x7f, 0xff, 0xff, 0xff];
        assert!(matches!(
            split_frame(&buf, 1024),
            Err(PgWireError::FrameTooLarge { tag: b'D', max: 1024, .. })
        ));
    }

    #[test]
    fn put_frame_patches_length() {
        let mut out = Vec::new();
        put_frame(&mut out, b'C', |b| put_cstr(b, "SELECT 1"));
        assert_eq!(out[0], b'C');
        let len = i32::from_be_bytes([out[1], out[2], out[3], out[4]]) as usize;
        assert_eq!(len, out.len() - 1);

        let frame = split_frame(&out, 1024).unwrap().unwrap();
        assert_eq!(frame.payload, b"SELECT 1\0");
        assert_eq!(frame.total_len, out.len());
    }
}
