//! The generic block-tree model underneath every format in this crate.
//!
//! A [`Block`] owns a byte range and possibly ordered child blocks. Reading
//! materializes a tree from bytes; mutation edits the tree in place; a
//! bottom-up [`refresh`](Block::refresh) recomputes sizes and derived offset
//! fields, after which serialization is a plain linear write.

pub mod counter;
pub mod reader;
pub mod refs;

pub use counter::{offset_of, BlockCounter};
pub use reader::BlockReader;
pub use refs::ReferenceSet;

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity for a block, used by the offset-counting
/// traversal and by back-reference bookkeeping. Identity, not position:
/// a block keeps its id across edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

impl BlockId {
    pub fn next() -> Self {
        BlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The composable unit shared by chunk headers, string pools, XML elements,
/// DEX items and instructions.
///
/// `byte_size` is derived, never stored: it must equal the number of bytes
/// `write_to` emits, but only after a `refresh` following any mutation.
pub trait Block {
    fn id(&self) -> BlockId;

    fn byte_size(&self) -> usize;

    /// Recompute declared size/offset fields bottom-up. Idempotent.
    fn refresh(&mut self);

    /// Serialize into `out`, returning the number of bytes written.
    /// Only guaranteed byte-correct after `refresh`.
    fn write_to(&self, out: &mut Vec<u8>) -> usize;

    /// Counting traversal for offset resolution: add own bytes unless this
    /// block (or a descendant) is the counter's target, in which case stop.
    fn count_up_to(&self, counter: &mut BlockCounter) {
        if counter.found() {
            return;
        }
        if counter.is_target(self.id()) {
            counter.mark_found();
            return;
        }
        counter.add(self.byte_size());
    }
}

/// Ordered list of child blocks with exclusive ownership and a dirty flag
/// that structural edits raise and `refresh` clears.
#[derive(Debug)]
pub struct BlockList<T> {
    id: BlockId,
    items: Vec<T>,
    dirty: bool,
}

impl<T> Default for BlockList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockList<T> {
    pub fn new() -> Self {
        BlockList {
            id: BlockId::next(),
            items: Vec::new(),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.dirty = true;
        self.items.get_mut(index)
    }

    pub fn push(&mut self, item: T) {
        self.dirty = true;
        self.items.push(item);
    }

    pub fn insert(&mut self, index: usize, item: T) {
        self.dirty = true;
        self.items.insert(index, item);
    }

    /// Detach the child at `index`. The child is returned, not dropped:
    /// orphaning must not free entries still referenced elsewhere.
    pub fn remove(&mut self, index: usize) -> T {
        self.dirty = true;
        self.items.remove(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.dirty = true;
        self.items.iter_mut()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl<T: Block> Block for BlockList<T> {
    fn id(&self) -> BlockId {
        self.id
    }

    fn byte_size(&self) -> usize {
        self.items.iter().map(Block::byte_size).sum()
    }

    fn refresh(&mut self) {
        for item in &mut self.items {
            item.refresh();
        }
        self.dirty = false;
    }

    fn write_to(&self, out: &mut Vec<u8>) -> usize {
        let mut count = 0;
        for item in &self.items {
            count += item.write_to(out);
        }
        count
    }

    fn count_up_to(&self, counter: &mut BlockCounter) {
        if counter.found() {
            return;
        }
        if counter.is_target(self.id) {
            counter.mark_found();
            return;
        }
        for item in &self.items {
            item.count_up_to(counter);
            if counter.found() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed-size leaf used to exercise the container and counter.
    struct Leaf {
        id: BlockId,
        payload: Vec<u8>,
    }

    impl Leaf {
        fn new(payload: Vec<u8>) -> Self {
            Leaf {
                id: BlockId::next(),
                payload,
            }
        }
    }

    impl Block for Leaf {
        fn id(&self) -> BlockId {
            self.id
        }
        fn byte_size(&self) -> usize {
            self.payload.len()
        }
        fn refresh(&mut self) {}
        fn write_to(&self, out: &mut Vec<u8>) -> usize {
            out.extend_from_slice(&self.payload);
            self.payload.len()
        }
    }

    #[test]
    fn container_size_is_sum_of_children() {
        let mut list = BlockList::new();
        list.push(Leaf::new(vec![0; 3]));
        list.push(Leaf::new(vec![0; 5]));
        assert_eq!(list.byte_size(), 8);
    }

    #[test]
    fn offset_counting_stops_at_target() {
        let mut list = BlockList::new();
        list.push(Leaf::new(vec![1, 2, 3]));
        let target = {
            let leaf = Leaf::new(vec![4, 5]);
            let id = leaf.id();
            list.push(leaf);
            id
        };
        list.push(Leaf::new(vec![6]));

        assert_eq!(offset_of(&list, target), Some(3));
        assert_eq!(offset_of(&list, BlockId::next()), None);
    }

    #[test]
    fn dirty_flag_follows_mutation_and_refresh() {
        let mut list: BlockList<Leaf> = BlockList::new();
        assert!(!list.is_dirty());
        list.push(Leaf::new(vec![0]));
        assert!(list.is_dirty());
        list.refresh();
        assert!(!list.is_dirty());
        list.remove(0);
        assert!(list.is_dirty());
    }

    #[test]
    fn write_matches_byte_size() {
        let mut list = BlockList::new();
        list.push(Leaf::new(vec![9, 9]));
        list.push(Leaf::new(vec![7]));
        let mut out = Vec::new();
        let written = list.write_to(&mut out);
        assert_eq!(written, list.byte_size());
        assert_eq!(out, vec![9, 9, 7]);
    }
}
