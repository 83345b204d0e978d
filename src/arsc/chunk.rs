use crate::block::BlockReader;
use crate::error::BlockError;
use log::warn;

pub const RES_NULL_TYPE: u16 = 0x0000;
pub const RES_STRING_POOL_TYPE: u16 = 0x0001;
pub const RES_TABLE_TYPE: u16 = 0x0002;
pub const RES_XML_TYPE: u16 = 0x0003;
pub const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
pub const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
pub const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
pub const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
pub const RES_XML_CDATA_TYPE: u16 = 0x0104;
pub const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

pub const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;

/// Header shared by every chunk in the resource-table and binary-XML
/// formats: `{type: u16, header_size: u16, chunk_size: u32}` little-endian,
/// `chunk_size` covering the header and all nested chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub header_size: u16,
    pub chunk_size: u32,
    /// Absolute position of the header in the source buffer.
    pub start: usize,
}

impl ChunkHeader {
    pub const BYTES: usize = 8;

    pub fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }

    /// Read and validate a header. A declared size smaller than the header
    /// itself, smaller than `min_header`, or past the end of the buffer is
    /// a fatal format error: reported, never repaired.
    pub fn read_from(reader: &mut BlockReader<'_>, min_header: u16) -> Result<ChunkHeader, BlockError> {
        let start = reader.position();
        let chunk_type = reader.read_u16()?;
        let header_size = reader.read_u16()?;
        let chunk_size = reader.read_u32()?;
        if (header_size as usize) < Self::BYTES || header_size < min_header {
            fail!(Format, "chunk header size {} below minimum {}", header_size, min_header);
        }
        if (chunk_size as usize) < header_size as usize {
            fail!(Format, "chunk size {} smaller than header size {}", chunk_size, header_size);
        }
        let end = start
            .checked_add(chunk_size as usize)
            .ok_or_else(|| BlockError::format("chunk size overflow"))?;
        if end > start + Self::BYTES + reader.remaining() {
            fail!(Format, "chunk size {} extends past end of buffer", chunk_size);
        }
        Ok(ChunkHeader {
            chunk_type,
            header_size,
            chunk_size,
            start,
        })
    }

    /// Like [`read_from`](Self::read_from), with the one documented
    /// compatibility fix-up: a zero chunk type where an XML chunk is
    /// structurally required is coerced to `RES_XML_TYPE`. Some producer
    /// tools emit this defect; the coercion is explicit and logged.
    pub fn read_document_header(reader: &mut BlockReader<'_>) -> Result<ChunkHeader, BlockError> {
        let mut header = Self::read_from(reader, ChunkHeader::BYTES as u16)?;
        if header.chunk_type == RES_NULL_TYPE {
            warn!(
                "coercing zero chunk type to RES_XML_TYPE at offset {} (known producer defect)",
                header.start
            );
            header.chunk_type = RES_XML_TYPE;
        }
        if header.chunk_type != RES_XML_TYPE {
            fail!(Format, "expected RES_XML_TYPE document chunk, found 0x{:04x}", header.chunk_type);
        }
        Ok(header)
    }

    pub fn expect(&self, chunk_type: u16) -> Result<(), BlockError> {
        if self.chunk_type != chunk_type {
            fail!(Format, "expected chunk type 0x{:04x}, found 0x{:04x}", chunk_type, self.chunk_type);
        }
        Ok(())
    }
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, value: u16) -> usize {
    buf.extend_from_slice(&value.to_le_bytes());
    2
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) -> usize {
    buf.extend_from_slice(&value.to_le_bytes());
    4
}

pub(crate) fn write_u8(buf: &mut Vec<u8>, value: u8) -> usize {
    buf.push(value);
    1
}

pub(crate) fn write_chunk_header(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16, chunk_size: u32) -> usize {
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, chunk_size);
    ChunkHeader::BYTES
}

pub(crate) fn align4(value: usize) -> usize {
    (value + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockReader;
    use crate::error::ErrorKind;

    fn header_bytes(chunk_type: u16, header_size: u16, chunk_size: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_chunk_header(&mut buf, chunk_type, header_size, chunk_size);
        buf.resize(chunk_size as usize, 0);
        buf
    }

    #[test]
    fn round_trips_header() {
        let bytes = header_bytes(RES_STRING_POOL_TYPE, 28, 64);
        let mut reader = BlockReader::new(&bytes);
        let header = ChunkHeader::read_from(&mut reader, 8).unwrap();
        assert_eq!(header.chunk_type, RES_STRING_POOL_TYPE);
        assert_eq!(header.header_size, 28);
        assert_eq!(header.chunk_size, 64);
        assert_eq!(header.end(), 64);
    }

    #[test]
    fn rejects_size_below_header() {
        let bytes = header_bytes(RES_XML_TYPE, 8, 4);
        let mut reader = BlockReader::new(&bytes);
        let err = ChunkHeader::read_from(&mut reader, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn rejects_size_past_buffer() {
        let mut bytes = Vec::new();
        write_chunk_header(&mut bytes, RES_XML_TYPE, 8, 1024);
        let mut reader = BlockReader::new(&bytes);
        assert!(ChunkHeader::read_from(&mut reader, 8).is_err());
    }

    #[test]
    fn coerces_zero_type_at_document_root() {
        let bytes = header_bytes(RES_NULL_TYPE, 8, 8);
        let mut reader = BlockReader::new(&bytes);
        let header = ChunkHeader::read_document_header(&mut reader).unwrap();
        assert_eq!(header.chunk_type, RES_XML_TYPE);
    }

    #[test]
    fn does_not_coerce_other_types() {
        let bytes = header_bytes(RES_TABLE_TYPE, 8, 8);
        let mut reader = BlockReader::new(&bytes);
        assert!(ChunkHeader::read_document_header(&mut reader).is_err());
    }
}
