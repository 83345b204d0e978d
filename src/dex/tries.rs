//! Try/catch structures: the tries array plus the encoded catch handler
//! list. Handler sets are shared between tries through `Rc`, mirroring the
//! on-disk sharing where several tries carry the same handler offset, and
//! mutation copies on write so editing one try never disturbs another.

use std::collections::HashMap;
use std::rc::Rc;

use crate::dex::leb::{sleb128_len, uleb128_len};
use crate::dex::{
    read_sleb128, read_u2, read_u4, read_uleb128, write_sleb128, write_u2, write_u4, write_uleb128,
};
use crate::error::BlockError;

/// One typed catch: the type index of the exception class and the
/// code-unit address of the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedHandler {
    pub type_index: u32,
    pub address: u32,
}

/// The handlers of one or more tries: zero or more typed catches tried in
/// order, then an optional catch-all address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandlerSet {
    typed: Vec<TypedHandler>,
    catch_all: Option<u32>,
}

impl HandlerSet {
    pub fn new() -> Self {
        HandlerSet::default()
    }

    pub fn typed(&self) -> &[TypedHandler] {
        &self.typed
    }

    pub fn add_typed(&mut self, type_index: u32, address: u32) {
        self.typed.push(TypedHandler {
            type_index,
            address,
        });
    }

    pub fn remove_typed(&mut self, index: usize) -> Result<TypedHandler, BlockError> {
        if index >= self.typed.len() {
            return Err(BlockError::range(
                "handler index",
                index as i64,
                0,
                self.typed.len() as i64 - 1,
            ));
        }
        Ok(self.typed.remove(index))
    }

    pub fn catch_all(&self) -> Option<u32> {
        self.catch_all
    }

    pub fn set_catch_all(&mut self, address: u32) {
        self.catch_all = Some(address);
    }

    pub fn clear_catch_all(&mut self) {
        self.catch_all = None;
    }

    pub fn is_empty(&self) -> bool {
        self.typed.is_empty() && self.catch_all.is_none()
    }

    /// The leading sleb128 of the encoded form: the typed-handler count,
    /// negated when a catch-all follows.
    fn size_field(&self) -> i32 {
        let count = self.typed.len() as i32;
        if self.catch_all.is_some() {
            -count
        } else {
            count
        }
    }

    fn encode(&self, buffer: &mut Vec<u8>) -> usize {
        let start = buffer.len();
        write_sleb128(buffer, self.size_field());
        for handler in &self.typed {
            write_uleb128(buffer, handler.type_index);
            write_uleb128(buffer, handler.address);
        }
        if let Some(address) = self.catch_all {
            write_uleb128(buffer, address);
        }
        buffer.len() - start
    }

    fn encoded_len(&self) -> usize {
        let mut len = sleb128_len(self.size_field());
        for handler in &self.typed {
            len += uleb128_len(handler.type_index) + uleb128_len(handler.address);
        }
        if let Some(address) = self.catch_all {
            len += uleb128_len(address);
        }
        len
    }

    fn decode(bytes: &[u8], ix: &mut usize) -> Result<Self, BlockError> {
        let size = read_sleb128(bytes, ix)?;
        if size == 0 {
            fail!(Format, "catch handler set with no handlers at index {}", *ix);
        }
        let count = size.unsigned_abs() as usize;
        let mut typed = Vec::with_capacity(count);
        for _ in 0..count {
            let type_index = read_uleb128(bytes, ix)?;
            let address = read_uleb128(bytes, ix)?;
            typed.push(TypedHandler {
                type_index,
                address,
            });
        }
        let catch_all = if size < 0 {
            Some(read_uleb128(bytes, ix)?)
        } else {
            None
        };
        Ok(HandlerSet { typed, catch_all })
    }
}

/// One guarded range: `unit_count` code units starting at `start_address`,
/// covered by a possibly shared [`HandlerSet`].
#[derive(Debug, Clone)]
pub struct TryItem {
    start_address: u32,
    unit_count: u16,
    handlers: Rc<HandlerSet>,
}

impl TryItem {
    pub fn new(start_address: u32, unit_count: u16, handlers: HandlerSet) -> Self {
        TryItem {
            start_address,
            unit_count,
            handlers: Rc::new(handlers),
        }
    }

    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    pub fn set_start_address(&mut self, address: u32) {
        self.start_address = address;
    }

    pub fn unit_count(&self) -> u16 {
        self.unit_count
    }

    pub fn set_unit_count(&mut self, count: u16) {
        self.unit_count = count;
    }

    pub fn end_address(&self) -> u32 {
        self.start_address + self.unit_count as u32
    }

    pub fn covers(&self, address: u32) -> bool {
        address >= self.start_address && address < self.end_address()
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// Mutable access to the handlers. When the set is shared with another
    /// try this detaches a private copy first, leaving the other try on the
    /// original set.
    pub fn handlers_mut(&mut self) -> &mut HandlerSet {
        Rc::make_mut(&mut self.handlers)
    }

    /// Make this try share the other's handler set. The shared set is
    /// written once.
    pub fn share_handlers_with(&mut self, other: &TryItem) {
        self.handlers = Rc::clone(&other.handlers);
    }

    pub fn shares_handlers_with(&self, other: &TryItem) -> bool {
        Rc::ptr_eq(&self.handlers, &other.handlers)
    }
}

/// The try/handler area of one method body: the fixed-width tries array
/// followed by the encoded catch handler list.
#[derive(Debug, Default)]
pub struct TryList {
    items: Vec<TryItem>,
}

impl TryList {
    pub fn new() -> Self {
        TryList { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TryItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TryItem> {
        self.items.get_mut(index)
    }

    pub fn push(&mut self, item: TryItem) {
        self.items.push(item);
    }

    pub fn remove(&mut self, index: usize) -> Result<TryItem, BlockError> {
        if index >= self.items.len() {
            return Err(BlockError::range(
                "try index",
                index as i64,
                0,
                self.items.len() as i64 - 1,
            ));
        }
        Ok(self.items.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TryItem> {
        self.items.iter()
    }

    /// Tries whose handler offsets coincide come back sharing one
    /// `Rc<HandlerSet>`.
    pub fn read(bytes: &[u8], ix: &mut usize, tries_size: usize) -> Result<Self, BlockError> {
        let mut raw = Vec::with_capacity(tries_size);
        for _ in 0..tries_size {
            let start_address = read_u4(bytes, ix)?;
            let unit_count = read_u2(bytes, ix)?;
            let handler_off = read_u2(bytes, ix)?;
            raw.push((start_address, unit_count, handler_off));
        }

        let list_start = *ix;
        let set_count = read_uleb128(bytes, ix)?;
        let mut by_offset: HashMap<u16, Rc<HandlerSet>> = HashMap::new();
        for _ in 0..set_count {
            let offset = (*ix - list_start) as u16;
            let set = HandlerSet::decode(bytes, ix)?;
            by_offset.insert(offset, Rc::new(set));
        }

        let mut items = Vec::with_capacity(tries_size);
        for (start_address, unit_count, handler_off) in raw {
            let handlers = match by_offset.get(&handler_off) {
                Some(set) => Rc::clone(set),
                None => fail!(
                    Format,
                    "try at address {} names handler offset {} which starts no handler set",
                    start_address,
                    handler_off
                ),
            };
            items.push(TryItem {
                start_address,
                unit_count,
                handlers,
            });
        }
        Ok(TryList { items })
    }

    /// Encoded size in bytes, agreeing exactly with [`TryList::write`].
    pub fn byte_size(&self) -> usize {
        if self.items.is_empty() {
            return 0;
        }
        let (sets, _) = self.unique_sets();
        let mut list_len = uleb128_len(sets.len() as u32);
        for set in &sets {
            list_len += set.encoded_len();
        }
        8 * self.items.len() + list_len
    }

    /// Deduplicated handler sets in first-use order, plus the set index
    /// for each try. Sets that encode to the same bytes collapse to one
    /// entry even when the `Rc`s differ.
    fn unique_sets(&self) -> (Vec<&HandlerSet>, Vec<usize>) {
        let mut sets: Vec<&HandlerSet> = Vec::new();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut indices = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let mut encoded = Vec::new();
            item.handlers.encode(&mut encoded);
            let index = match keys.iter().position(|k| *k == encoded) {
                Some(i) => i,
                None => {
                    keys.push(encoded);
                    sets.push(item.handlers.as_ref());
                    sets.len() - 1
                }
            };
            indices.push(index);
        }
        (sets, indices)
    }

    pub fn write(&self, buffer: &mut Vec<u8>) -> Result<usize, BlockError> {
        if self.items.is_empty() {
            return Ok(0);
        }
        for item in &self.items {
            if item.handlers.is_empty() {
                fail!(
                    Format,
                    "try at address {} has an empty handler set",
                    item.start_address
                );
            }
        }
        let (sets, indices) = self.unique_sets();

        // Encode the handler list into a scratch buffer first so each
        // try's handler offset is known before the tries array goes out.
        let mut list = Vec::new();
        write_uleb128(&mut list, sets.len() as u32);
        let mut offsets = Vec::with_capacity(sets.len());
        for set in &sets {
            offsets.push(list.len() as u16);
            set.encode(&mut list);
        }

        let start = buffer.len();
        for (item, &set_index) in self.items.iter().zip(&indices) {
            write_u4(buffer, item.start_address);
            write_u2(buffer, item.unit_count);
            write_u2(buffer, offsets[set_index]);
        }
        buffer.extend_from_slice(&list);
        Ok(buffer.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed_set(type_index: u32, address: u32) -> HandlerSet {
        let mut set = HandlerSet::new();
        set.add_typed(type_index, address);
        set
    }

    #[test]
    fn size_field_flips_sign_with_catch_all() {
        let mut set = typed_set(5, 0x20);
        let mut encoded = Vec::new();
        set.encode(&mut encoded);
        assert_eq!(encoded[0], 1);

        set.set_catch_all(0x30);
        let mut encoded = Vec::new();
        set.encode(&mut encoded);
        assert_eq!(encoded[0], 0x7F); // sleb128 for -1
        assert_eq!(*encoded.last().unwrap(), 0x30);
        assert_eq!(encoded.len(), set.encoded_len());
    }

    #[test]
    fn empty_handler_set_is_rejected_on_read() {
        let bytes = [0u8];
        let mut ix = 0;
        assert!(HandlerSet::decode(&bytes, &mut ix).is_err());
    }

    #[test]
    fn shared_offsets_become_shared_sets() {
        let mut list = TryList::new();
        let first = TryItem::new(0, 4, typed_set(7, 0x10));
        let mut second = TryItem::new(8, 4, HandlerSet::new());
        second.share_handlers_with(&first);
        list.push(first);
        list.push(second);

        let mut bytes = Vec::new();
        let written = list.write(&mut bytes).unwrap();
        assert_eq!(written, list.byte_size());

        let mut ix = 0;
        let read = TryList::read(&bytes, &mut ix, 2).unwrap();
        assert_eq!(ix, bytes.len());
        assert!(read.get(0).unwrap().shares_handlers_with(read.get(1).unwrap()));
        assert_eq!(read.get(1).unwrap().handlers().typed()[0].type_index, 7);
    }

    #[test]
    fn mutation_detaches_a_shared_set() {
        let mut list = TryList::new();
        let first = TryItem::new(0, 4, typed_set(7, 0x10));
        let mut second = TryItem::new(8, 4, HandlerSet::new());
        second.share_handlers_with(&first);
        list.push(first);
        list.push(second);

        list.get_mut(1).unwrap().handlers_mut().set_catch_all(0x40);
        assert!(!list.get(0).unwrap().shares_handlers_with(list.get(1).unwrap()));
        assert_eq!(list.get(0).unwrap().handlers().catch_all(), None);
        assert_eq!(list.get(1).unwrap().handlers().catch_all(), Some(0x40));
    }

    #[test]
    fn identical_but_unshared_sets_dedup_on_write() {
        let mut list = TryList::new();
        list.push(TryItem::new(0, 4, typed_set(7, 0x10)));
        list.push(TryItem::new(8, 4, typed_set(7, 0x10)));

        let mut bytes = Vec::new();
        list.write(&mut bytes).unwrap();
        let mut ix = 0;
        let read = TryList::read(&bytes, &mut ix, 2).unwrap();
        assert!(read.get(0).unwrap().shares_handlers_with(read.get(1).unwrap()));
        // one set in the list: uleb count 1
        assert_eq!(bytes[16], 1);
    }

    #[test]
    fn covers_is_half_open() {
        let item = TryItem::new(4, 3, typed_set(1, 0));
        assert!(!item.covers(3));
        assert!(item.covers(4));
        assert!(item.covers(6));
        assert!(!item.covers(7));
    }
}
