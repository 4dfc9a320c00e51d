//! Bounds-checked cursor over a single frame's payload.

use bytes::Bytes;

use crate::error::PgWireError;

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    message: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], message: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            message,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn short(&self, wanted: usize) -> PgWireError {
        PgWireError::malformed(
            self.message,
            format!(
                "needs {wanted} more bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            ),
        )
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, PgWireError> {
        let b = *self.data.get(self.pos).ok_or_else(|| self.short(1))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_i16(&mut self) -> Result<i16, PgWireError> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, PgWireError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, PgWireError> {
        Ok(self.read_i32()? as u32)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], PgWireError> {
        if len > self.remaining() {
            return Err(self.short(len));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Length-prefixed value: `-1` is NULL, otherwise that many raw bytes.
    pub(crate) fn read_nullable(&mut self) -> Result<Option<Bytes>, PgWireError> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        let len = usize::try_from(len).map_err(|_| {
            PgWireError::malformed(self.message, format!("negative value length {len}"))
        })?;
        Ok(Some(Bytes::copy_from_slice(self.read_bytes(len)?)))
    }

    /// NUL-terminated UTF-8 string.
    pub(crate) fn read_cstr(&mut self) -> Result<&'a str, PgWireError> {
        let rest = &self.data[self.pos..];
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            PgWireError::malformed(self.message, "unterminated string")
        })?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| PgWireError::InvalidUtf8 {
            message: self.message,
        })?;
        self.pos += nul + 1;
        Ok(s)
    }

    pub(crate) fn expect_end(&self) -> Result<(), PgWireError> {
        if self.remaining() != 0 {
            return Err(PgWireError::malformed(
                self.message,
                format!("{} trailing bytes", self.remaining()),
            ));
        }
        Ok(())
    }
}
