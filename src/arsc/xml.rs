use crate::arsc::chunk::{
    write_chunk_header, write_u16, write_u32, write_u8, ChunkHeader, NO_ENTRY_INDEX,
    RES_XML_CDATA_TYPE, RES_XML_END_ELEMENT_TYPE, RES_XML_END_NAMESPACE_TYPE,
    RES_STRING_POOL_TYPE, RES_XML_RESOURCE_MAP_TYPE, RES_XML_START_ELEMENT_TYPE,
    RES_XML_START_NAMESPACE_TYPE, RES_XML_TYPE,
};
use crate::arsc::resource_map::ResourceMapChunk;
use crate::arsc::string_pool::{PoolFlags, PoolReference, StringPoolChunk};
use crate::block::{Block, BlockId, BlockReader};
use crate::error::BlockError;
use std::sync::atomic::{AtomicBool, Ordering};

pub const TYPE_NULL: u8 = 0x00;
pub const TYPE_REFERENCE: u8 = 0x01;
pub const TYPE_STRING: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_INT_DEC: u8 = 0x10;
pub const TYPE_INT_HEX: u8 = 0x11;
pub const TYPE_INT_BOOLEAN: u8 = 0x12;

// Reference slots used when registering pool back-references.
const SLOT_ELEMENT_NAME: u8 = 0;
const SLOT_ELEMENT_NS: u8 = 1;
const SLOT_ATTR_NAME: u8 = 2;
const SLOT_ATTR_NS: u8 = 3;
const SLOT_ATTR_RAW: u8 = 4;
const SLOT_ATTR_DATA: u8 = 5;
const SLOT_NS_PREFIX: u8 = 6;
const SLOT_NS_URI: u8 = 7;
const SLOT_CDATA: u8 = 8;

/// One 20-byte attribute record of a start-element chunk.
#[derive(Debug, Clone)]
pub struct XmlAttribute {
    pub ns_index: u32,
    pub name_index: u32,
    pub raw_value_index: u32,
    pub value_type: u8,
    pub data: u32,
}

impl XmlAttribute {
    const UNIT_SIZE: u16 = 20;

    fn read_from(reader: &mut BlockReader<'_>) -> Result<Self, BlockError> {
        let ns_index = reader.read_u32()?;
        let name_index = reader.read_u32()?;
        let raw_value_index = reader.read_u32()?;
        let size = reader.read_u16()?;
        if size != 8 {
            fail!(Format, "unexpected attribute value size {}", size);
        }
        let _res0 = reader.read_u8()?;
        let value_type = reader.read_u8()?;
        let data = reader.read_u32()?;
        Ok(XmlAttribute {
            ns_index,
            name_index,
            raw_value_index,
            value_type,
            data,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) -> usize {
        write_u32(out, self.ns_index);
        write_u32(out, self.name_index);
        write_u32(out, self.raw_value_index);
        write_u16(out, 8);
        write_u8(out, 0);
        write_u8(out, self.value_type);
        write_u32(out, self.data);
        Self::UNIT_SIZE as usize
    }
}

/// Payload of one body chunk of the document, in document order. The flat
/// event list (rather than a nested element tree) is what makes byte-exact
/// round trips trivial: writing is a linear walk.
#[derive(Debug)]
pub enum XmlEventKind {
    StartNamespace { prefix_index: u32, uri_index: u32 },
    EndNamespace { prefix_index: u32, uri_index: u32 },
    StartElement {
        ns_index: u32,
        name_index: u32,
        id_index: u16,
        class_index: u16,
        style_index: u16,
        attributes: Vec<XmlAttribute>,
    },
    EndElement { ns_index: u32, name_index: u32 },
    Cdata { data_index: u32, value_type: u8, data: u32 },
}

#[derive(Debug)]
pub struct XmlEvent {
    id: BlockId,
    pub line_number: u32,
    pub comment_index: u32,
    pub kind: XmlEventKind,
}

impl XmlEvent {
    pub fn new(kind: XmlEventKind, line_number: u32) -> Self {
        XmlEvent {
            id: BlockId::next(),
            line_number,
            comment_index: NO_ENTRY_INDEX,
            kind,
        }
    }

    fn chunk_type(&self) -> u16 {
        match self.kind {
            XmlEventKind::StartNamespace { .. } => RES_XML_START_NAMESPACE_TYPE,
            XmlEventKind::EndNamespace { .. } => RES_XML_END_NAMESPACE_TYPE,
            XmlEventKind::StartElement { .. } => RES_XML_START_ELEMENT_TYPE,
            XmlEventKind::EndElement { .. } => RES_XML_END_ELEMENT_TYPE,
            XmlEventKind::Cdata { .. } => RES_XML_CDATA_TYPE,
        }
    }
}

impl Block for XmlEvent {
    fn id(&self) -> BlockId {
        self.id
    }

    fn byte_size(&self) -> usize {
        match &self.kind {
            XmlEventKind::StartNamespace { .. } | XmlEventKind::EndNamespace { .. } => 24,
            XmlEventKind::StartElement { attributes, .. } => {
                36 + attributes.len() * XmlAttribute::UNIT_SIZE as usize
            }
            XmlEventKind::EndElement { .. } => 24,
            XmlEventKind::Cdata { .. } => 28,
        }
    }

    fn refresh(&mut self) {}

    fn write_to(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        write_chunk_header(out, self.chunk_type(), 16, self.byte_size() as u32);
        write_u32(out, self.line_number);
        write_u32(out, self.comment_index);
        match &self.kind {
            XmlEventKind::StartNamespace { prefix_index, uri_index }
            | XmlEventKind::EndNamespace { prefix_index, uri_index } => {
                write_u32(out, *prefix_index);
                write_u32(out, *uri_index);
            }
            XmlEventKind::StartElement {
                ns_index,
                name_index,
                id_index,
                class_index,
                style_index,
                attributes,
            } => {
                write_u32(out, *ns_index);
                write_u32(out, *name_index);
                write_u16(out, 20); // attributeStart
                write_u16(out, XmlAttribute::UNIT_SIZE);
                write_u16(out, attributes.len() as u16);
                write_u16(out, *id_index);
                write_u16(out, *class_index);
                write_u16(out, *style_index);
                for attribute in attributes {
                    attribute.write_to(out);
                }
            }
            XmlEventKind::EndElement { ns_index, name_index } => {
                write_u32(out, *ns_index);
                write_u32(out, *name_index);
            }
            XmlEventKind::Cdata { data_index, value_type, data } => {
                write_u32(out, *data_index);
                write_u16(out, 8);
                write_u8(out, 0);
                write_u8(out, *value_type);
                write_u32(out, *data);
            }
        }
        out.len() - start
    }
}

/// A parsed binary-XML document: header, string pool, optional resource-ID
/// map, and the flat body event list.
#[derive(Debug)]
pub struct ResXmlDocument {
    id: BlockId,
    pub string_pool: StringPoolChunk,
    pub resource_map: Option<ResourceMapChunk>,
    events: Vec<XmlEvent>,
    dirty: bool,
    destroyed: AtomicBool,
}

impl Default for ResXmlDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ResXmlDocument {
    pub fn new() -> Self {
        ResXmlDocument {
            id: BlockId::next(),
            string_pool: StringPoolChunk::new(PoolFlags::empty()),
            resource_map: None,
            events: Vec::new(),
            dirty: false,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Parse a whole document: header (with the documented zero-type
    /// coercion), then string pool, resource map and body chunks in order.
    pub fn read_bytes(data: &[u8]) -> Result<Self, BlockError> {
        let mut reader = BlockReader::new(data);
        let header = ChunkHeader::read_document_header(&mut reader)?;
        let mut chunk_reader = reader.sub_reader(header.start + header.header_size as usize, header.end())?;

        let mut document = ResXmlDocument::new();
        let mut pool_seen = false;
        while !chunk_reader.is_finished() {
            let position = chunk_reader.position();
            let peeked = chunk_reader.peek_u16()?;
            match peeked {
                RES_STRING_POOL_TYPE => {
                    if pool_seen {
                        fail!(Format, "duplicate string pool chunk at {}", position);
                    }
                    document.string_pool = StringPoolChunk::read_from(&mut chunk_reader)?;
                    pool_seen = true;
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    if document.resource_map.is_some() {
                        fail!(Format, "duplicate resource map chunk at {}", position);
                    }
                    document.resource_map = Some(ResourceMapChunk::read_from(&mut chunk_reader)?);
                }
                RES_XML_START_NAMESPACE_TYPE
                | RES_XML_END_NAMESPACE_TYPE
                | RES_XML_START_ELEMENT_TYPE
                | RES_XML_END_ELEMENT_TYPE
                | RES_XML_CDATA_TYPE => {
                    let event = read_event(&mut chunk_reader)?;
                    document.events.push(event);
                }
                other => {
                    fail!(Format, "unexpected chunk type 0x{:04x} at {}", other, position);
                }
            }
        }
        document.link_string_references();
        Ok(document)
    }

    pub fn events(&self) -> &[XmlEvent] {
        &self.events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn push_event(&mut self, event: XmlEvent) {
        self.register_event_references(self.events.len(), &event);
        self.events.push(event);
        self.dirty = true;
    }

    pub fn insert_event(&mut self, index: usize, event: XmlEvent) {
        self.register_event_references(index, &event);
        self.events.insert(index, event);
        self.dirty = true;
    }

    /// Detach an event; its pool back-references are released so a later
    /// strip-unused pass can reclaim strings only this event used.
    pub fn remove_event(&mut self, index: usize) -> XmlEvent {
        let event = self.events.remove(index);
        self.release_event_references(&event);
        self.dirty = true;
        event
    }

    /// Index of the first start-element event (the document element).
    pub fn document_element(&self) -> Option<usize> {
        self.events
            .iter()
            .position(|e| matches!(e.kind, XmlEventKind::StartElement { .. }))
    }

    pub fn event_mut(&mut self, index: usize) -> Option<&mut XmlEvent> {
        self.dirty = true;
        self.events.get_mut(index)
    }

    /// Intern `name`/`value` and append a string attribute to the
    /// start-element event at `index`.
    pub fn add_string_attribute(
        &mut self,
        index: usize,
        name: &str,
        value: &str,
    ) -> Result<(), BlockError> {
        let name_index = self.string_pool.intern(name);
        let value_index = self.string_pool.intern(value);
        let event = match self.events.get_mut(index) {
            Some(event) => event,
            None => fail!(Range, "event index out of range, should be [0 - {}]: {}", self.events.len() as i64 - 1, index),
        };
        let owner = event.id();
        match &mut event.kind {
            XmlEventKind::StartElement { attributes, .. } => {
                attributes.push(XmlAttribute {
                    ns_index: NO_ENTRY_INDEX,
                    name_index,
                    raw_value_index: value_index,
                    value_type: TYPE_STRING,
                    data: value_index,
                });
            }
            _ => fail!(Consistency, "event {} is not a start element", index),
        }
        self.string_pool
            .add_reference(name_index, PoolReference::new(owner, SLOT_ATTR_NAME));
        self.string_pool
            .add_reference(value_index, PoolReference::new(owner, SLOT_ATTR_RAW));
        self.dirty = true;
        Ok(())
    }

    /// Strip pool entries nothing references any more, then patch every
    /// stored index in the body and the resource map to the new numbering.
    pub fn strip_unused_strings(&mut self) {
        let remap = self.string_pool.remove_unused_entries();
        if remap.is_identity() {
            return;
        }
        let patch = |index: &mut u32| {
            if *index != NO_ENTRY_INDEX {
                if let Some(new) = remap.get(*index) {
                    *index = new;
                }
            }
        };
        for event in &mut self.events {
            patch(&mut event.comment_index);
            match &mut event.kind {
                XmlEventKind::StartNamespace { prefix_index, uri_index }
                | XmlEventKind::EndNamespace { prefix_index, uri_index } => {
                    patch(prefix_index);
                    patch(uri_index);
                }
                XmlEventKind::StartElement { ns_index, name_index, attributes, .. } => {
                    patch(ns_index);
                    patch(name_index);
                    for attribute in attributes {
                        patch(&mut attribute.ns_index);
                        patch(&mut attribute.name_index);
                        patch(&mut attribute.raw_value_index);
                        if attribute.value_type == TYPE_STRING {
                            patch(&mut attribute.data);
                        }
                    }
                }
                XmlEventKind::EndElement { ns_index, name_index } => {
                    patch(ns_index);
                    patch(name_index);
                }
                XmlEventKind::Cdata { data_index, value_type, data } => {
                    patch(data_index);
                    if *value_type == TYPE_STRING {
                        patch(data);
                    }
                }
            }
        }
        if let Some(map) = &mut self.resource_map {
            map.apply_remap(&remap);
        }
        self.dirty = true;
    }

    /// Recompute sizes bottom-up and clear the dirty flag; serialization is
    /// only byte-correct after this.
    pub fn refresh(&mut self) {
        self.string_pool.refresh();
        if let Some(map) = &mut self.resource_map {
            map.refresh();
        }
        for event in &mut self.events {
            event.refresh();
        }
        self.dirty = false;
    }

    pub fn byte_size(&self) -> usize {
        let mut size = ChunkHeader::BYTES + self.string_pool.byte_size();
        if let Some(map) = &self.resource_map {
            size += map.byte_size();
        }
        size += self.events.iter().map(Block::byte_size).sum::<usize>();
        size
    }

    /// Serialize the whole document. Writing with pending mutations (no
    /// refresh since the last edit) would produce stale declared sizes, so
    /// it is rejected rather than repaired.
    pub fn write_bytes(&self) -> Result<Vec<u8>, BlockError> {
        if self.dirty {
            fail!(Consistency, "document mutated since last refresh, call refresh() before writing");
        }
        let mut out = Vec::with_capacity(self.byte_size());
        write_chunk_header(&mut out, RES_XML_TYPE, 8, self.byte_size() as u32);
        self.string_pool.write_to(&mut out);
        if let Some(map) = &self.resource_map {
            map.write_to(&mut out);
        }
        for event in &self.events {
            event.write_to(&mut out);
        }
        Ok(out)
    }

    /// One-time teardown; callable from any thread any number of times,
    /// only the first call releases anything.
    pub fn destroy(&mut self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.clear();
        self.resource_map = None;
        self.string_pool = StringPoolChunk::new(self.string_pool.flags());
        self.dirty = false;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn link_string_references(&mut self) {
        let mut refs = Vec::new();
        for event in &self.events {
            refs.extend(event_references(event));
        }
        for (string_index, reference) in refs {
            self.string_pool.add_reference(string_index, reference);
        }
    }

    fn register_event_references(&mut self, _index: usize, event: &XmlEvent) {
        for (string_index, reference) in event_references(event) {
            self.string_pool.add_reference(string_index, reference);
        }
    }

    fn release_event_references(&mut self, event: &XmlEvent) {
        for (string_index, reference) in event_references(event) {
            self.string_pool.remove_reference(string_index, &reference);
        }
    }
}

/// Every (pool index, back-reference) pair an event contributes.
fn event_references(event: &XmlEvent) -> Vec<(u32, PoolReference)> {
    let owner = event.id();
    let mut refs = Vec::new();
    let mut push = |index: u32, slot: u8| {
        if index != NO_ENTRY_INDEX {
            refs.push((index, PoolReference::new(owner, slot)));
        }
    };
    match &event.kind {
        XmlEventKind::StartNamespace { prefix_index, uri_index }
        | XmlEventKind::EndNamespace { prefix_index, uri_index } => {
            push(*prefix_index, SLOT_NS_PREFIX);
            push(*uri_index, SLOT_NS_URI);
        }
        XmlEventKind::StartElement { ns_index, name_index, attributes, .. } => {
            push(*ns_index, SLOT_ELEMENT_NS);
            push(*name_index, SLOT_ELEMENT_NAME);
            for attribute in attributes {
                push(attribute.ns_index, SLOT_ATTR_NS);
                push(attribute.name_index, SLOT_ATTR_NAME);
                push(attribute.raw_value_index, SLOT_ATTR_RAW);
                if attribute.value_type == TYPE_STRING {
                    push(attribute.data, SLOT_ATTR_DATA);
                }
            }
        }
        XmlEventKind::EndElement { ns_index, name_index } => {
            push(*ns_index, SLOT_ELEMENT_NS);
            push(*name_index, SLOT_ELEMENT_NAME);
        }
        XmlEventKind::Cdata { data_index, value_type, data } => {
            push(*data_index, SLOT_CDATA);
            if *value_type == TYPE_STRING {
                push(*data, SLOT_CDATA);
            }
        }
    }
    refs
}

fn read_event(reader: &mut BlockReader<'_>) -> Result<XmlEvent, BlockError> {
    let header = ChunkHeader::read_from(reader, 16)?;
    let line_number = reader.read_u32()?;
    let comment_index = reader.read_u32()?;
    let kind = match header.chunk_type {
        RES_XML_START_NAMESPACE_TYPE => XmlEventKind::StartNamespace {
            prefix_index: reader.read_u32()?,
            uri_index: reader.read_u32()?,
        },
        RES_XML_END_NAMESPACE_TYPE => XmlEventKind::EndNamespace {
            prefix_index: reader.read_u32()?,
            uri_index: reader.read_u32()?,
        },
        RES_XML_START_ELEMENT_TYPE => {
            let ns_index = reader.read_u32()?;
            let name_index = reader.read_u32()?;
            let attribute_start = reader.read_u16()?;
            let attribute_size = reader.read_u16()?;
            if attribute_size != XmlAttribute::UNIT_SIZE {
                fail!(Format, "unsupported attribute unit size {}", attribute_size);
            }
            let attribute_count = reader.read_u16()?;
            let id_index = reader.read_u16()?;
            let class_index = reader.read_u16()?;
            let style_index = reader.read_u16()?;
            reader.seek(header.start + header.header_size as usize + attribute_start as usize)?;
            let mut attributes = Vec::with_capacity(attribute_count as usize);
            for _ in 0..attribute_count {
                attributes.push(XmlAttribute::read_from(reader)?);
            }
            XmlEventKind::StartElement {
                ns_index,
                name_index,
                id_index,
                class_index,
                style_index,
                attributes,
            }
        }
        RES_XML_END_ELEMENT_TYPE => XmlEventKind::EndElement {
            ns_index: reader.read_u32()?,
            name_index: reader.read_u32()?,
        },
        RES_XML_CDATA_TYPE => {
            let data_index = reader.read_u32()?;
            let size = reader.read_u16()?;
            if size != 8 {
                fail!(Format, "unexpected cdata value size {}", size);
            }
            let _res0 = reader.read_u8()?;
            let value_type = reader.read_u8()?;
            let data = reader.read_u32()?;
            XmlEventKind::Cdata {
                data_index,
                value_type,
                data,
            }
        }
        other => fail!(Format, "unexpected body chunk type 0x{:04x}", other),
    };
    reader.seek(header.end())?;
    let mut event = XmlEvent::new(kind, line_number);
    event.comment_index = comment_index;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_document() -> ResXmlDocument {
        let mut doc = ResXmlDocument::new();
        let manifest = doc.string_pool.intern("manifest");
        let package = doc.string_pool.intern("package");
        let value = doc.string_pool.intern("com.example.app");

        let start = XmlEvent::new(
            XmlEventKind::StartElement {
                ns_index: NO_ENTRY_INDEX,
                name_index: manifest,
                id_index: 0,
                class_index: 0,
                style_index: 0,
                attributes: vec![XmlAttribute {
                    ns_index: NO_ENTRY_INDEX,
                    name_index: package,
                    raw_value_index: value,
                    value_type: TYPE_STRING,
                    data: value,
                }],
            },
            1,
        );
        let end = XmlEvent::new(
            XmlEventKind::EndElement {
                ns_index: NO_ENTRY_INDEX,
                name_index: manifest,
            },
            3,
        );
        doc.push_event(start);
        doc.push_event(end);
        doc.refresh();
        doc
    }

    #[test]
    fn document_round_trips() {
        let doc = build_document();
        let bytes = doc.write_bytes().unwrap();

        let mut read = ResXmlDocument::read_bytes(&bytes).unwrap();
        read.refresh();
        let again = read.write_bytes().unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut doc = build_document();
        let once = doc.write_bytes().unwrap();
        doc.refresh();
        doc.refresh();
        let twice = doc.write_bytes().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn write_before_refresh_is_rejected() {
        let mut doc = build_document();
        doc.add_string_attribute(0, "versionName", "1.0").unwrap();
        let err = doc.write_bytes().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Consistency);
        doc.refresh();
        assert!(doc.write_bytes().is_ok());
    }

    #[test]
    fn strip_unused_renumbers_attribute_indices() {
        let mut doc = build_document();
        // Intern a string nothing references.
        doc.string_pool.intern("orphan");
        doc.refresh();
        let before = doc.string_pool.len();
        doc.strip_unused_strings();
        assert_eq!(doc.string_pool.len(), before - 1);

        // Attribute indices must still resolve to the same strings.
        let element = doc.document_element().unwrap();
        if let XmlEventKind::StartElement { attributes, name_index, .. } = &doc.events()[element].kind {
            assert_eq!(doc.string_pool.get(*name_index), Some("manifest"));
            assert_eq!(doc.string_pool.get(attributes[0].name_index), Some("package"));
            assert_eq!(
                doc.string_pool.get(attributes[0].raw_value_index),
                Some("com.example.app")
            );
        } else {
            panic!("expected start element");
        }
        doc.refresh();
        let bytes = doc.write_bytes().unwrap();
        let reread = ResXmlDocument::read_bytes(&bytes).unwrap();
        assert_eq!(reread.string_pool.len(), doc.string_pool.len());
    }

    #[test]
    fn removing_event_releases_references() {
        let mut doc = build_document();
        let element = doc.document_element().unwrap();
        doc.remove_event(element);
        // "package" and "com.example.app" were only used by the removed
        // element; "manifest" is still held by the end-element event.
        doc.strip_unused_strings();
        assert_eq!(doc.string_pool.len(), 1);
        assert_eq!(doc.string_pool.get(0), Some("manifest"));
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut doc = build_document();
        doc.destroy();
        assert!(doc.is_destroyed());
        assert_eq!(doc.event_count(), 0);
        doc.destroy();
        assert!(doc.is_destroyed());
    }

    #[test]
    fn zero_type_document_reads_with_coercion() {
        let doc = build_document();
        let mut bytes = doc.write_bytes().unwrap();
        bytes[0] = 0;
        bytes[1] = 0;
        let read = ResXmlDocument::read_bytes(&bytes).unwrap();
        assert_eq!(read.event_count(), 2);
    }
}
