use crate::error::BlockError;

/// Bounds-checked forward cursor over an immutable byte buffer.
///
/// Every block materializes itself from one of these; reads past the end of
/// the buffer (or of the bounded window) are format errors, never panics.
pub struct BlockReader<'a> {
    data: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> BlockReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BlockReader {
            data,
            pos: 0,
            limit: data.len(),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.pos)
    }

    pub fn is_finished(&self) -> bool {
        self.pos >= self.limit
    }

    /// Absolute-position seek within the buffer.
    pub fn seek(&mut self, offset: usize) -> Result<(), BlockError> {
        if offset > self.limit {
            fail!(Format, "seek to {} past end of buffer ({})", offset, self.limit);
        }
        self.pos = offset;
        Ok(())
    }

    /// A reader over the same buffer whose end is capped at `end`, used to
    /// confine chunk payload reads to the declared chunk size.
    pub fn sub_reader(&self, start: usize, end: usize) -> Result<BlockReader<'a>, BlockError> {
        if end > self.data.len() || start > end {
            fail!(Format, "sub reader [{} - {}] outside buffer ({})", start, end, self.data.len());
        }
        Ok(BlockReader {
            data: self.data,
            pos: start,
            limit: end,
        })
    }

    pub fn read_u8(&mut self) -> Result<u8, BlockError> {
        if self.pos + 1 > self.limit {
            fail!(Format, "unexpected end of stream reading u8 at {}", self.pos);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, BlockError> {
        if self.pos + 2 > self.limit {
            fail!(Format, "unexpected end of stream reading u16 at {}", self.pos);
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32, BlockError> {
        if self.pos + 4 > self.limit {
            fail!(Format, "unexpected end of stream reading u32 at {}", self.pos);
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8], BlockError> {
        if self.remaining() < length {
            fail!(Format, "buffer too short for {} byte read at {}", length, self.pos);
        }
        let slice = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(slice)
    }

    /// Peek at the next u16 without consuming it.
    pub fn peek_u16(&self) -> Result<u16, BlockError> {
        if self.pos + 2 > self.limit {
            fail!(Format, "unexpected end of stream peeking u16 at {}", self.pos);
        }
        Ok(u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn reads_little_endian() {
        let data = [0x03, 0x00, 0x08, 0x00, 0x2c, 0x01, 0x00, 0x00];
        let mut r = BlockReader::new(&data);
        assert_eq!(r.read_u16().unwrap(), 0x0003);
        assert_eq!(r.read_u16().unwrap(), 0x0008);
        assert_eq!(r.read_u32().unwrap(), 0x012c);
        assert!(r.is_finished());
    }

    #[test]
    fn read_past_end_is_format_error() {
        let data = [0x01];
        let mut r = BlockReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 1);
        let err = r.read_u16().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn sub_reader_confines_reads() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let r = BlockReader::new(&data);
        let mut sub = r.sub_reader(2, 4).unwrap();
        assert_eq!(sub.read_u16().unwrap(), 0x0403);
        assert!(sub.read_u8().is_err());
    }

    #[test]
    fn seek_is_absolute() {
        let data = [0u8; 8];
        let mut r = BlockReader::new(&data);
        r.read_u32().unwrap();
        r.seek(2).unwrap();
        assert_eq!(r.position(), 2);
        assert!(r.seek(9).is_err());
    }
}
