//! Little-endian cursor over an IL byte stream

use crate::IlError;

/// A bounds-checked little-endian reader over an IL instruction stream.
///
/// Offsets reported by [`IlCursor::offset`] are relative to the start of the
/// slice, which for method bodies is the first code byte (not the header).
#[derive(Clone)]
pub struct IlCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> IlCursor<'a> {
    /// Wrap a byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current offset into the stream.
    #[inline]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Reposition the cursor. Seeking past the end is allowed; the next read
    /// reports truncation.
    #[inline]
    pub fn seek(&mut self, offset: usize) {
        self.pos = offset;
    }

    /// True when every byte has been consumed.
    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Bytes remaining after the cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IlError> {
        if self.remaining() < n {
            return Err(IlError::Truncated(self.pos));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, IlError> {
        Ok(self.take(1)?[0])
    }

    /// Read one signed byte.
    pub fn read_i8(&mut self) -> Result<i8, IlError> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, IlError> {
        let s = self.take(2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, IlError> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    /// Read a little-endian i32.
    pub fn read_i32(&mut self) -> Result<i32, IlError> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, IlError> {
        let s = self.take(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(u64::from_le_bytes(b))
    }

    /// Read a little-endian i64.
    pub fn read_i64(&mut self) -> Result<i64, IlError> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a little-endian f32.
    pub fn read_f32(&mut self) -> Result<f32, IlError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Read a little-endian f64.
    pub fn read_f64(&mut self) -> Result<f64, IlError> {
        Ok(f64::from_bits(self.read_u64()?))
    }
}
