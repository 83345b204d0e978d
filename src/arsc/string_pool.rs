use crate::arsc::chunk::{
    align4, write_chunk_header, write_u16, write_u32, ChunkHeader, RES_STRING_POOL_TYPE,
};
use crate::block::{Block, BlockCounter, BlockId, BlockReader, ReferenceSet};
use crate::error::BlockError;
use bitflags::bitflags;
use log::info;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        const SORTED = 0x0000_0001;
        const UTF8 = 0x0000_0100;
    }
}

/// Identifies one field of one block that holds a pool index. Pool entries
/// track these so "strip unused" can prove an entry is dead and so index
/// renumbering knows which stored integers to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReference {
    pub owner: BlockId,
    pub slot: u8,
}

impl PoolReference {
    pub fn new(owner: BlockId, slot: u8) -> Self {
        PoolReference { owner, slot }
    }
}

#[derive(Debug)]
struct PoolEntry {
    value: String,
    refs: ReferenceSet<PoolReference>,
}

/// Maps pre-removal pool indices to post-removal indices. `None` means the
/// entry was removed; holders of such an index were proven unreferenced.
#[derive(Debug)]
pub struct IndexRemap {
    map: Vec<Option<u32>>,
}

impl IndexRemap {
    pub fn get(&self, old: u32) -> Option<u32> {
        self.map.get(old as usize).copied().flatten()
    }

    pub fn is_identity(&self) -> bool {
        self.map
            .iter()
            .enumerate()
            .all(|(i, new)| *new == Some(i as u32))
    }
}

/// The string pool chunk: interned values, stable contiguous indices, and a
/// back-reference set per entry.
#[derive(Debug)]
pub struct StringPoolChunk {
    id: BlockId,
    flags: PoolFlags,
    entries: Vec<PoolEntry>,
    style_offsets: Vec<u32>,
    style_data: Vec<u8>,
    /// Bumped on every structural change; open cursors compare against it.
    version: u64,
}

impl StringPoolChunk {
    pub fn new(flags: PoolFlags) -> Self {
        StringPoolChunk {
            id: BlockId::next(),
            flags,
            entries: Vec::new(),
            style_offsets: Vec::new(),
            style_data: Vec::new(),
            version: 0,
        }
    }

    pub fn read_from(reader: &mut BlockReader<'_>) -> Result<Self, BlockError> {
        let header = ChunkHeader::read_from(reader, 28)?;
        header.expect(RES_STRING_POOL_TYPE)?;
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = PoolFlags::from_bits_truncate(reader.read_u32()?);
        let strings_start = reader.read_u32()? as usize;
        let styles_start = reader.read_u32()? as usize;
        reader.seek(header.start + header.header_size as usize)?;

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }
        let mut style_offsets = Vec::with_capacity(style_count);
        for _ in 0..style_count {
            style_offsets.push(reader.read_u32()?);
        }

        let chunk_end = header.end();
        let strings_base = header.start + strings_start;
        let is_utf8 = flags.contains(PoolFlags::UTF8);

        let mut entries = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let mut body = reader.sub_reader(strings_base + offset, chunk_end)?;
            let value = if is_utf8 {
                read_utf8_string(&mut body)?
            } else {
                read_utf16_string(&mut body)?
            };
            entries.push(PoolEntry {
                value,
                refs: ReferenceSet::new(),
            });
        }

        let style_data = if style_count > 0 && styles_start != 0 {
            let mut body = reader.sub_reader(header.start + styles_start, chunk_end)?;
            body.read_bytes(chunk_end - (header.start + styles_start))?.to_vec()
        } else {
            Vec::new()
        };

        reader.seek(chunk_end)?;
        Ok(StringPoolChunk {
            id: BlockId::next(),
            flags,
            entries,
            style_offsets,
            style_data,
            version: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flags(&self) -> PoolFlags {
        self.flags
    }

    /// "Not found" is a sentinel, not an error.
    pub fn get(&self, index: u32) -> Option<&str> {
        self.entries.get(index as usize).map(|e| e.value.as_str())
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.value == value)
            .map(|i| i as u32)
    }

    /// Returns the index of an equal value if one is present, else appends.
    /// Dedup is by value equality, never identity.
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(index) = self.index_of(value) {
            return index;
        }
        let index = self.entries.len() as u32;
        self.entries.push(PoolEntry {
            value: value.to_string(),
            refs: ReferenceSet::new(),
        });
        self.version += 1;
        index
    }

    pub fn add_reference(&mut self, index: u32, reference: PoolReference) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            entry.refs.add(reference);
        }
    }

    pub fn remove_reference(&mut self, index: u32, reference: &PoolReference) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            entry.refs.remove(reference);
        }
    }

    pub fn reference_count(&self, index: u32) -> usize {
        self.entries
            .get(index as usize)
            .map(|e| e.refs.len())
            .unwrap_or(0)
    }

    pub fn has_reference(&self, index: u32) -> bool {
        self.reference_count(index) > 0
    }

    /// Drop every entry with an empty back-reference set, renumbering the
    /// survivors. The returned remap must be applied by the owning document
    /// to every block holding a pool index; that application is the one
    /// place other blocks' stored integers are mutated as a side effect.
    ///
    /// Entries backing style data are never removed.
    pub fn remove_unused_entries(&mut self) -> IndexRemap {
        let styled = self.style_offsets.len();
        let mut map = Vec::with_capacity(self.entries.len());
        let mut kept = Vec::with_capacity(self.entries.len());
        let mut removed = 0usize;
        for (index, entry) in self.entries.drain(..).enumerate() {
            if index < styled || !entry.refs.is_empty() {
                map.push(Some(kept.len() as u32));
                kept.push(entry);
            } else {
                map.push(None);
                removed += 1;
            }
        }
        self.entries = kept;
        if removed > 0 {
            self.version += 1;
            info!("removed {} unused string pool entries", removed);
        }
        IndexRemap { map }
    }

    /// Detached cursor over pool entries that fails fast when the pool is
    /// structurally modified between advances.
    pub fn cursor(&self) -> PoolCursor {
        PoolCursor {
            index: 0,
            version: self.version,
        }
    }

    fn encoded_string_len(&self, value: &str) -> usize {
        if self.flags.contains(PoolFlags::UTF8) {
            let char_len = value.encode_utf16().count();
            let byte_len = value.len();
            utf8_length_width(char_len) + utf8_length_width(byte_len) + byte_len + 1
        } else {
            let units = value.encode_utf16().count();
            let prefix = if units < 0x8000 { 2 } else { 4 };
            prefix + units * 2 + 2
        }
    }

    fn string_data_len(&self) -> usize {
        let raw: usize = self
            .entries
            .iter()
            .map(|e| self.encoded_string_len(&e.value))
            .sum();
        align4(raw)
    }

    fn strings_start(&self) -> usize {
        28 + 4 * (self.entries.len() + self.style_offsets.len())
    }
}

impl Block for StringPoolChunk {
    fn id(&self) -> BlockId {
        self.id
    }

    fn byte_size(&self) -> usize {
        let mut size = self.strings_start() + self.string_data_len();
        if !self.style_data.is_empty() {
            size += align4(self.style_data.len());
        }
        size
    }

    fn refresh(&mut self) {
        // Sizes and the strings_start/styles_start offsets are derived at
        // write time from current entries; nothing cached to rebuild.
    }

    fn write_to(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        let strings_start = self.strings_start();
        let string_data_len = self.string_data_len();
        let styles_start = if self.style_data.is_empty() {
            0
        } else {
            strings_start + string_data_len
        };

        write_chunk_header(out, RES_STRING_POOL_TYPE, 28, self.byte_size() as u32);
        write_u32(out, self.entries.len() as u32);
        write_u32(out, self.style_offsets.len() as u32);
        write_u32(out, self.flags.bits());
        write_u32(out, strings_start as u32);
        write_u32(out, styles_start as u32);

        let mut offset = 0u32;
        for entry in &self.entries {
            write_u32(out, offset);
            offset += self.encoded_string_len(&entry.value) as u32;
        }
        for style_offset in &self.style_offsets {
            write_u32(out, *style_offset);
        }
        for entry in &self.entries {
            if self.flags.contains(PoolFlags::UTF8) {
                write_utf8_string(out, &entry.value);
            } else {
                write_utf16_string(out, &entry.value);
            }
        }
        while (out.len() - start) < strings_start + string_data_len {
            out.push(0);
        }
        if !self.style_data.is_empty() {
            out.extend_from_slice(&self.style_data);
            while (out.len() - start) % 4 != 0 {
                out.push(0);
            }
        }
        out.len() - start
    }

    fn count_up_to(&self, counter: &mut BlockCounter) {
        if counter.found() {
            return;
        }
        if counter.is_target(self.id) {
            counter.mark_found();
            return;
        }
        counter.add(self.byte_size());
    }
}

/// Index-based cursor detached from the pool borrow; `next` re-validates
/// the pool's structural version on every advance.
pub struct PoolCursor {
    index: usize,
    version: u64,
}

impl PoolCursor {
    pub fn next<'a>(&mut self, pool: &'a StringPoolChunk) -> Result<Option<(u32, &'a str)>, BlockError> {
        if pool.version != self.version {
            fail!(Consistency, "string pool modified during iteration");
        }
        let index = self.index;
        if index >= pool.entries.len() {
            return Ok(None);
        }
        self.index += 1;
        Ok(Some((index as u32, pool.entries[index].value.as_str())))
    }
}

fn utf8_length_width(len: usize) -> usize {
    if len < 0x80 {
        1
    } else {
        2
    }
}

fn write_utf8_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.push((0x80 | ((len >> 8) & 0x7F)) as u8);
        out.push((len & 0xFF) as u8);
    }
}

fn write_utf8_string(out: &mut Vec<u8>, value: &str) {
    write_utf8_length(out, value.encode_utf16().count());
    write_utf8_length(out, value.len());
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn write_utf16_string(out: &mut Vec<u8>, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    if units.len() < 0x8000 {
        write_u16(out, units.len() as u16);
    } else {
        write_u16(out, 0x8000 | ((units.len() >> 16) as u16 & 0x7FFF));
        write_u16(out, (units.len() & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(out, unit);
    }
    write_u16(out, 0);
}

fn read_utf8_length(reader: &mut BlockReader<'_>) -> Result<usize, BlockError> {
    let first = reader.read_u8()?;
    if (first & 0x80) == 0 {
        Ok(first as usize)
    } else {
        let second = reader.read_u8()?;
        Ok((((first & 0x7F) as usize) << 8) | second as usize)
    }
}

fn read_utf8_string(reader: &mut BlockReader<'_>) -> Result<String, BlockError> {
    let _char_len = read_utf8_length(reader)?;
    let byte_len = read_utf8_length(reader)?;
    let bytes = reader.read_bytes(byte_len)?;
    let text = std::str::from_utf8(bytes)
        .map_err(|_| BlockError::format("invalid UTF-8 in string pool"))?
        .to_string();
    if reader.read_u8()? != 0 {
        fail!(Format, "missing UTF-8 string terminator");
    }
    Ok(text)
}

fn read_utf16_string(reader: &mut BlockReader<'_>) -> Result<String, BlockError> {
    let first = reader.read_u16()?;
    let char_count = if (first & 0x8000) == 0 {
        first as usize
    } else {
        let second = reader.read_u16()?;
        (((first & 0x7FFF) as usize) << 16) | second as usize
    };
    let mut units = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        units.push(reader.read_u16()?);
    }
    if reader.read_u16()? != 0 {
        fail!(Format, "missing UTF-16 string terminator");
    }
    String::from_utf16(&units).map_err(|_| BlockError::format("invalid UTF-16 in string pool"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample_pool() -> StringPoolChunk {
        let mut pool = StringPoolChunk::new(PoolFlags::empty());
        pool.intern("manifest");
        pool.intern("package");
        pool.intern("android");
        pool
    }

    #[test]
    fn intern_dedups_by_value() {
        let mut pool = sample_pool();
        assert_eq!(pool.intern("package"), 1);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.intern("versionCode"), 3);
    }

    #[test]
    fn round_trips_utf16() {
        let mut pool = sample_pool();
        pool.intern("\u{00e9}l\u{00e9}ment");
        let mut bytes = Vec::new();
        pool.write_to(&mut bytes);
        let mut reader = BlockReader::new(&bytes);
        let read = StringPoolChunk::read_from(&mut reader).unwrap();
        assert_eq!(read.len(), 4);
        assert_eq!(read.get(3), Some("\u{00e9}l\u{00e9}ment"));

        let mut again = Vec::new();
        read.write_to(&mut again);
        assert_eq!(bytes, again);
    }

    #[test]
    fn round_trips_utf8() {
        let mut pool = StringPoolChunk::new(PoolFlags::UTF8);
        pool.intern("res/layout/main.xml");
        pool.intern("");
        let mut bytes = Vec::new();
        let written = pool.write_to(&mut bytes);
        assert_eq!(written, pool.byte_size());
        let mut reader = BlockReader::new(&bytes);
        let read = StringPoolChunk::read_from(&mut reader).unwrap();
        assert_eq!(read.get(0), Some("res/layout/main.xml"));
        assert_eq!(read.get(1), Some(""));
    }

    #[test]
    fn remove_unused_renumbers_and_reports() {
        let mut pool = sample_pool();
        let owner = BlockId::next();
        pool.add_reference(0, PoolReference::new(owner, 0));
        pool.add_reference(2, PoolReference::new(owner, 1));

        let remap = pool.remove_unused_entries();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(0), Some("manifest"));
        assert_eq!(pool.get(1), Some("android"));
        assert_eq!(remap.get(0), Some(0));
        assert_eq!(remap.get(1), None);
        assert_eq!(remap.get(2), Some(1));
        assert!(!remap.is_identity());
    }

    #[test]
    fn reference_cell_promotion_is_transparent() {
        let mut pool = sample_pool();
        let a = PoolReference::new(BlockId::next(), 0);
        let b = PoolReference::new(BlockId::next(), 0);
        pool.add_reference(1, a);
        assert_eq!(pool.reference_count(1), 1);
        pool.add_reference(1, b);
        assert_eq!(pool.reference_count(1), 2);
        pool.remove_reference(1, &a);
        assert_eq!(pool.reference_count(1), 1);
        assert!(pool.has_reference(1));
    }

    #[test]
    fn cursor_fails_fast_on_structural_change() {
        let mut pool = sample_pool();
        let mut cursor = pool.cursor();
        assert_eq!(cursor.next(&pool).unwrap(), Some((0, "manifest")));
        pool.intern("fresh");
        let err = cursor.next(&pool).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn cursor_completes_when_untouched() {
        let pool = sample_pool();
        let mut cursor = pool.cursor();
        let mut seen = Vec::new();
        while let Some((_, value)) = cursor.next(&pool).unwrap() {
            seen.push(value.to_string());
        }
        assert_eq!(seen, vec!["manifest", "package", "android"]);
    }
}
