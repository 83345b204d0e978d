use crate::arsc::chunk::{write_chunk_header, write_u32, ChunkHeader, RES_XML_RESOURCE_MAP_TYPE};
use crate::block::{Block, BlockId, BlockReader, ReferenceSet};
use crate::error::BlockError;
use crate::arsc::string_pool::{IndexRemap, PoolReference};

/// One entry of the resource-ID table. The entry is parallel to the string
/// pool: the id at table index `i` names the attribute whose name string is
/// pool entry `i`.
#[derive(Debug)]
pub struct ResourceId {
    id: BlockId,
    value: u32,
    refs: ReferenceSet<PoolReference>,
}

impl ResourceId {
    pub fn new(value: u32) -> Self {
        ResourceId {
            id: BlockId::next(),
            value,
            refs: ReferenceSet::new(),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn set_value(&mut self, value: u32) {
        self.value = value;
    }

    pub fn add_reference(&mut self, reference: PoolReference) {
        self.refs.add(reference);
    }

    pub fn remove_reference(&mut self, reference: &PoolReference) {
        self.refs.remove(reference);
    }

    pub fn has_reference(&self) -> bool {
        !self.refs.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.refs.len()
    }
}

/// The RES_XML_RESOURCE_MAP_TYPE chunk: a flat array of u32 resource IDs.
#[derive(Debug)]
pub struct ResourceMapChunk {
    id: BlockId,
    ids: Vec<ResourceId>,
}

impl Default for ResourceMapChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMapChunk {
    pub fn new() -> Self {
        ResourceMapChunk {
            id: BlockId::next(),
            ids: Vec::new(),
        }
    }

    pub fn read_from(reader: &mut BlockReader<'_>) -> Result<Self, BlockError> {
        let header = ChunkHeader::read_from(reader, 8)?;
        header.expect(RES_XML_RESOURCE_MAP_TYPE)?;
        let count = (header.chunk_size as usize - header.header_size as usize) / 4;
        reader.seek(header.start + header.header_size as usize)?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(ResourceId::new(reader.read_u32()?));
        }
        reader.seek(header.end())?;
        Ok(ResourceMapChunk {
            id: BlockId::next(),
            ids,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&ResourceId> {
        self.ids.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut ResourceId> {
        self.ids.get_mut(index as usize)
    }

    pub fn push(&mut self, value: u32) -> u32 {
        self.ids.push(ResourceId::new(value));
        (self.ids.len() - 1) as u32
    }

    /// Table index of a resource id value; a sentinel `None` when absent.
    pub fn index_of(&self, value: u32) -> Option<u32> {
        self.ids
            .iter()
            .position(|id| id.value == value)
            .map(|i| i as u32)
    }

    /// The table is pool-parallel, so it never renumbers on its own: it
    /// follows the remap produced by the pool's strip-unused pass. Entries
    /// whose pool string was removed are dropped with it.
    pub fn apply_remap(&mut self, remap: &IndexRemap) {
        let mut kept = Vec::with_capacity(self.ids.len());
        for (index, id) in self.ids.drain(..).enumerate() {
            if remap.get(index as u32).is_some() {
                kept.push(id);
            }
        }
        self.ids = kept;
    }
}

impl Block for ResourceMapChunk {
    fn id(&self) -> BlockId {
        self.id
    }

    fn byte_size(&self) -> usize {
        ChunkHeader::BYTES + 4 * self.ids.len()
    }

    fn refresh(&mut self) {}

    fn write_to(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        write_chunk_header(out, RES_XML_RESOURCE_MAP_TYPE, 8, self.byte_size() as u32);
        for id in &self.ids {
            write_u32(out, id.value);
        }
        out.len() - start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut map = ResourceMapChunk::new();
        map.push(0x0101_0003);
        map.push(0x0101_021b);
        let mut bytes = Vec::new();
        let written = map.write_to(&mut bytes);
        assert_eq!(written, map.byte_size());

        let mut reader = BlockReader::new(&bytes);
        let read = ResourceMapChunk::read_from(&mut reader).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.get(1).unwrap().value(), 0x0101_021b);
        assert_eq!(read.index_of(0x0101_0003), Some(0));
        assert_eq!(read.index_of(0xdead_beef), None);
    }

    #[test]
    fn back_references_gate_removal() {
        let mut map = ResourceMapChunk::new();
        map.push(0x0101_0001);
        let user = PoolReference::new(BlockId::next(), 0);
        map.get_mut(0).unwrap().add_reference(user);
        assert!(map.get(0).unwrap().has_reference());
        map.get_mut(0).unwrap().remove_reference(&user);
        assert!(!map.get(0).unwrap().has_reference());
    }
}
