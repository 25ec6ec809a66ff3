//! Free space tracker built from segregated explicit free lists.
//!
//! Free blocks are grouped into [`NUM_CLASSES`] size classes. Each class is a
//! doubly linked list threaded through the payload of its free blocks, so
//! insertion and removal are O(1) given the block. New blocks are pushed at
//! the head of their class (LIFO order).
//!
//! ```text
//! class 0  (32)         ──► [32] ◄─► [32]
//! class 1  (33..=64)    ──► [48] ◄─► [64] ◄─► [40]
//! class 2  (65..=128)   ──► (empty)
//!   ...
//! class 15 (> 512 KiB)  ──► [1 MiB]
//! ```
//!
//! A search starts at the class of the requested size and moves to larger
//! classes until a block fits.

use crate::{
    block::{Block, MIN_BLOCK_SIZE},
    config::FitPolicy,
};

/// Number of segregated size classes.
pub(crate) const NUM_CLASSES: usize = 16;

const _: () = assert!(MIN_BLOCK_SIZE.is_power_of_two());

/// Returns the size class of a block of `size` bytes.
///
/// Class 0 holds blocks of exactly [`MIN_BLOCK_SIZE`] bytes, class `k` holds
/// blocks in `(MIN_BLOCK_SIZE << (k - 1), MIN_BLOCK_SIZE << k]`, and the last
/// class holds everything larger.
pub(crate) fn class_of(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    let bits = usize::BITS - (size - 1).leading_zeros();
    let min_bits = MIN_BLOCK_SIZE.trailing_zeros();
    let class = bits.saturating_sub(min_bits) as usize;
    class.min(NUM_CLASSES - 1)
}

/// Heads of the segregated free lists.
///
/// The lists themselves live inside the heap; this struct only owns the list
/// heads and a count of the blocks they hold.
#[derive(Debug)]
pub(crate) struct FreeLists {
    heads: [Option<Block>; NUM_CLASSES],
    len: usize,
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; NUM_CLASSES],
            len: 0,
        }
    }

    /// Forgets every list. The blocks themselves are left untouched.
    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }

    /// Number of blocks in all lists.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn head(&self, class: usize) -> Option<Block> {
        self.heads[class]
    }

    /// Pushes a free block at the head of its class.
    ///
    /// The block must be formatted as free and must not be in any list.
    pub(crate) fn insert(&mut self, block: Block) {
        debug_assert!(block.is_free(), "inserting an allocated block");
        let class = class_of(block.size());
        let head = self.heads[class];
        debug_assert_ne!(head, Some(block), "block is already listed");

        block.set_prev_free(None);
        block.set_next_free(head);
        if let Some(head) = head {
            head.set_prev_free(Some(block));
        }
        self.heads[class] = Some(block);
        self.len += 1;
    }

    /// Unlinks a free block from its class.
    ///
    /// The block must currently be in the list of its class, which means its
    /// size must not have changed since it was inserted.
    pub(crate) fn remove(&mut self, block: Block) {
        debug_assert!(block.is_free(), "removing an allocated block");
        debug_assert!(self.len > 0);
        let class = class_of(block.size());
        let prev = block.prev_free();
        let next = block.next_free();

        match prev {
            Some(prev) => prev.set_next_free(next),
            None => {
                debug_assert_eq!(self.heads[class], Some(block), "block is not listed");
                self.heads[class] = next;
            }
        }
        if let Some(next) = next {
            next.set_prev_free(prev);
        }
        self.len -= 1;
    }

    /// Finds a free block of at least `size` bytes without unlinking it.
    ///
    /// Returns `None` if no listed block is large enough.
    pub(crate) fn find_fit(&self, size: usize, policy: FitPolicy) -> Option<Block> {
        for class in class_of(size)..NUM_CLASSES {
            let found = match policy {
                FitPolicy::FirstFit => self.iter_class(class).find(|b| b.size() >= size),
                FitPolicy::BestFit => self.best_in_class(class, size),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    // Blocks of a lower class are always smaller than blocks of a higher
    // class, so the best block of the first class with a fit is the best
    // block overall.
    fn best_in_class(&self, class: usize, size: usize) -> Option<Block> {
        let mut best: Option<Block> = None;
        for block in self.iter_class(class) {
            let block_size = block.size();
            if block_size == size {
                return Some(block);
            }
            if block_size > size && best.is_none_or(|b| block_size < b.size()) {
                best = Some(block);
            }
        }
        best
    }

    /// Iterates over the blocks of one class, head first.
    pub(crate) fn iter_class(&self, class: usize) -> impl Iterator<Item = Block> + use<> {
        let mut next = self.heads[class];
        core::iter::from_fn(move || {
            let block = next?;
            next = block.next_free();
            Some(block)
        })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::{vec, vec::Vec};

    use super::*;
    use crate::block::Tags;

    struct TestHeap {
        buf: Vec<usize>,
    }

    impl TestHeap {
        fn new(bytes: usize) -> Self {
            Self {
                buf: vec![0; bytes / size_of::<usize>()],
            }
        }

        /// Formats a free block at byte `offset`.
        fn free_block(&mut self, offset: usize, size: usize) -> Block {
            unsafe {
                let block = Block::from_addr(self.buf.as_mut_ptr().cast::<u8>().add(offset));
                block.format(size, Tags::PREV_ALLOCATED);
                block
            }
        }
    }

    #[test]
    fn test_class_of() {
        assert_eq!(class_of(32), 0);
        assert_eq!(class_of(40), 1);
        assert_eq!(class_of(64), 1);
        assert_eq!(class_of(72), 2);
        assert_eq!(class_of(128), 2);
        assert_eq!(class_of(136), 3);
        assert_eq!(class_of(4096), 7);
        assert_eq!(class_of(4104), 8);
        assert_eq!(class_of(1 << 20), NUM_CLASSES - 1);
        assert_eq!(class_of(usize::MAX & !7), NUM_CLASSES - 1);
    }

    #[test]
    fn test_class_bounds_are_ordered() {
        let mut last = 0;
        for size in (MIN_BLOCK_SIZE..=(1 << 21)).step_by(8) {
            let class = class_of(size);
            assert!(class == last || class == last + 1);
            last = class;
        }
        assert_eq!(last, NUM_CLASSES - 1);
    }

    #[test]
    fn test_insert_remove() {
        let mut heap = TestHeap::new(512);
        let mut lists = FreeLists::new();
        let a = heap.free_block(0, 48);
        let b = heap.free_block(64, 64);
        let c = heap.free_block(160, 40);

        lists.insert(a);
        lists.insert(b);
        lists.insert(c);
        assert_eq!(lists.len(), 3);
        assert_eq!(lists.iter_class(1).collect::<Vec<_>>(), [c, b, a]);

        // middle
        lists.remove(b);
        assert_eq!(lists.iter_class(1).collect::<Vec<_>>(), [c, a]);
        assert_eq!(c.next_free(), Some(a));
        assert_eq!(a.prev_free(), Some(c));

        // head
        lists.remove(c);
        assert_eq!(lists.head(1), Some(a));
        assert_eq!(a.prev_free(), None);

        // last
        lists.remove(a);
        assert_eq!(lists.head(1), None);
        assert_eq!(lists.len(), 0);
    }

    #[test]
    fn test_find_fit_moves_to_larger_classes() {
        let mut heap = TestHeap::new(1024);
        let mut lists = FreeLists::new();
        let small = heap.free_block(0, 32);
        let large = heap.free_block(64, 512);
        lists.insert(small);
        lists.insert(large);

        assert_eq!(lists.find_fit(32, FitPolicy::FirstFit), Some(small));
        assert_eq!(lists.find_fit(40, FitPolicy::FirstFit), Some(large));
        assert_eq!(lists.find_fit(512, FitPolicy::BestFit), Some(large));
        assert_eq!(lists.find_fit(520, FitPolicy::FirstFit), None);
        assert_eq!(lists.find_fit(520, FitPolicy::BestFit), None);
    }

    #[test]
    fn test_first_fit_vs_best_fit() {
        let mut heap = TestHeap::new(1024);
        let mut lists = FreeLists::new();
        let loose = heap.free_block(0, 120);
        let tight = heap.free_block(128, 80);
        let exact = heap.free_block(256, 72);
        lists.insert(tight);
        lists.insert(exact);
        lists.insert(loose);

        // LIFO: the head of class 2 is the block inserted last
        assert_eq!(lists.find_fit(72, FitPolicy::FirstFit), Some(loose));
        assert_eq!(lists.find_fit(72, FitPolicy::BestFit), Some(exact));
        assert_eq!(lists.find_fit(76, FitPolicy::BestFit), Some(tight));
    }

    #[test]
    fn test_clear() {
        let mut heap = TestHeap::new(128);
        let mut lists = FreeLists::new();
        lists.insert(heap.free_block(0, 64));
        lists.clear();
        assert_eq!(lists.len(), 0);
        assert!((0..NUM_CLASSES).all(|class| lists.head(class).is_none()));
    }
}
