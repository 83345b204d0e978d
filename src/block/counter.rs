use crate::block::{Block, BlockId};

/// Accumulates byte sizes during a tree walk until a target block is found.
///
/// This is how absolute offsets are resolved once layout is final: the walk
/// sums the sizes of everything preceding the target in tree order and stops
/// the moment the target is reached, so resolving one offset never costs
/// more than a single pass.
pub struct BlockCounter {
    target: BlockId,
    count: usize,
    found: bool,
}

impl BlockCounter {
    pub fn new(target: BlockId) -> Self {
        BlockCounter {
            target,
            count: 0,
            found: false,
        }
    }

    pub fn found(&self) -> bool {
        self.found
    }

    /// Byte offset accumulated so far; the target's absolute offset once
    /// [`found`](Self::found) is true.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_target(&self, id: BlockId) -> bool {
        id == self.target
    }

    pub fn mark_found(&mut self) {
        self.found = true;
    }

    pub fn add(&mut self, bytes: usize) {
        self.count += bytes;
    }
}

/// Walk `root` counting bytes up to (exclusive) the block with id `target`.
/// Returns `None` when the target is not a descendant of `root`.
pub fn offset_of(root: &dyn Block, target: BlockId) -> Option<usize> {
    let mut counter = BlockCounter::new(target);
    root.count_up_to(&mut counter);
    if counter.found() {
        Some(counter.count())
    } else {
        None
    }
}
