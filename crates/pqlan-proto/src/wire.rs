//! Field-level read/write helpers shared by both message families.

use bytes::{Buf, BufMut, Bytes};

use crate::{
    MAX_FIELD_SIZE, PROTOCOL_VERSION,
    errors::{ProtocolError, Result},
};

/// Write a u32-BE length prefix followed by `bytes`.
pub(crate) fn put_var(dst: &mut impl BufMut, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_FIELD_SIZE {
        return Err(ProtocolError::FieldTooLarge { size: bytes.len(), max: MAX_FIELD_SIZE });
    }
    dst.put_u32(bytes.len() as u32);
    dst.put_slice(bytes);
    Ok(())
}

/// Write the `[type][version]` header.
pub(crate) fn put_header(dst: &mut impl BufMut, type_byte: u8) {
    dst.put_u8(type_byte);
    dst.put_u8(PROTOCOL_VERSION);
}

/// Cursor over an input buffer with bounds-checked reads.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated { needed, available: self.buf.remaining() });
        }
        Ok(())
    }

    /// Read `[type][version]`, checking the version. Returns the type byte.
    pub(crate) fn header(&mut self) -> Result<u8> {
        self.need(2)?;
        let type_byte = self.buf.get_u8();
        let version = self.buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(type_byte)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Length-prefixed field. The length is checked against the limit before
    /// anything is copied.
    pub(crate) fn var(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        if len > MAX_FIELD_SIZE {
            return Err(ProtocolError::FieldTooLarge { size: len, max: MAX_FIELD_SIZE });
        }
        self.need(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Succeeds only if the whole input was consumed.
    pub(crate) fn finish(self) -> Result<()> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
