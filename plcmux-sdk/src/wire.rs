use crate::{DriverError, DriverResult};

/// Little-endian wire cursor over an optional byte buffer.
///
/// In probe mode (no buffer) every accessor bounds-checks against the stated
/// capacity and advances the offset without touching memory, so a layer can
/// size its headers by running its encode path once against no buffer and
/// reading back [`WireCursor::offset`]. Reads in probe mode yield zero.
///
/// Every accessor checks the full width of the value before advancing; a
/// failed access leaves the offset where it was.
#[derive(Debug)]
pub struct WireCursor<'a> {
    buf: Option<&'a mut [u8]>,
    capacity: usize,
    offset: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let capacity = buf.len();
        Self {
            buf: Some(buf),
            capacity,
            offset: 0,
        }
    }

    /// Start at `offset` instead of the beginning of the buffer.
    pub fn at(buf: &'a mut [u8], offset: usize) -> Self {
        let capacity = buf.len();
        Self {
            buf: Some(buf),
            capacity,
            offset,
        }
    }

    /// Sizing pass over a phantom buffer of `capacity` bytes.
    pub fn probe(capacity: usize) -> Self {
        Self {
            buf: None,
            capacity,
            offset: 0,
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset.min(self.capacity)
    }

    pub fn seek(&mut self, offset: usize) -> DriverResult<()> {
        if offset > self.capacity {
            return Err(DriverError::OutOfBounds {
                offset,
                capacity: self.capacity,
            });
        }
        self.offset = offset;
        Ok(())
    }

    fn check(&self, width: usize) -> DriverResult<()> {
        if self.offset + width > self.capacity {
            return Err(DriverError::OutOfBounds {
                offset: self.offset,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn put_bytes(&mut self, src: &[u8]) -> DriverResult<()> {
        self.check(src.len())?;
        if let Some(buf) = self.buf.as_deref_mut() {
            buf[self.offset..self.offset + src.len()].copy_from_slice(src);
        }
        self.offset += src.len();
        Ok(())
    }

    pub fn put_u8(&mut self, val: u8) -> DriverResult<()> {
        self.put_bytes(&[val])
    }

    pub fn put_u16_le(&mut self, val: u16) -> DriverResult<()> {
        self.put_bytes(&val.to_le_bytes())
    }

    pub fn put_u32_le(&mut self, val: u32) -> DriverResult<()> {
        self.put_bytes(&val.to_le_bytes())
    }

    pub fn put_u64_le(&mut self, val: u64) -> DriverResult<()> {
        self.put_bytes(&val.to_le_bytes())
    }

    fn read_into(&mut self, dst: &mut [u8]) -> DriverResult<()> {
        self.check(dst.len())?;
        if let Some(buf) = self.buf.as_deref() {
            dst.copy_from_slice(&buf[self.offset..self.offset + dst.len()]);
        }
        self.offset += dst.len();
        Ok(())
    }

    pub fn u8(&mut self) -> DriverResult<u8> {
        let mut raw = [0u8; 1];
        self.read_into(&mut raw)?;
        Ok(raw[0])
    }

    pub fn u16_le(&mut self) -> DriverResult<u16> {
        let mut raw = [0u8; 2];
        self.read_into(&mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn u32_le(&mut self) -> DriverResult<u32> {
        let mut raw = [0u8; 4];
        self.read_into(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn u64_le(&mut self) -> DriverResult<u64> {
        let mut raw = [0u8; 8];
        self.read_into(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }
}
