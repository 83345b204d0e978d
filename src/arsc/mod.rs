//! The "chunk" side of the crate: resource-table / binary-XML structures
//! built from `{type, header_size, chunk_size}` headers.

pub mod chunk;
pub mod resource_map;
pub mod string_pool;
pub mod xml;

pub use chunk::ChunkHeader;
pub use resource_map::ResourceMapChunk;
pub use string_pool::{IndexRemap, PoolCursor, PoolFlags, PoolReference, StringPoolChunk};
pub use xml::{ResXmlDocument, XmlAttribute, XmlEvent, XmlEventKind};
