//! Little-endian field reader shared by the binary formats.

use crate::error::{CoreError, CoreResult};

/// Reads fixed-width little-endian fields from a byte slice, turning every
/// short read into a format-specific error.
pub(crate) struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    error: fn(String) -> CoreError,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(data: &'a [u8], error: fn(String) -> CoreError) -> Self {
        Self {
            data,
            pos: 0,
            error,
        }
    }

    pub(crate) fn take(&mut self, len: usize, field: &str) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| (self.error)(format!("unexpected end of data reading {field}")))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self, field: &str) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    pub(crate) fn u16(&mut self, field: &str) -> CoreResult<u16> {
        self.array(field).map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self, field: &str) -> CoreResult<u32> {
        self.array(field).map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self, field: &str) -> CoreResult<u64> {
        self.array(field).map(u64::from_le_bytes)
    }

    /// Fails if any bytes remain unread.
    pub(crate) fn finish(self) -> CoreResult<()> {
        if self.pos != self.data.len() {
            return Err((self.error)(format!(
                "trailing bytes: read {} of {}",
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }
}
