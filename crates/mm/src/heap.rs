//! Placement and reclamation policy.
//!
//! [`Allocator`] ties the block catalog and the free space tracker together
//! over a [`HeapRegion`]. The heap always has the shape
//!
//! ```text
//! heap_start                                              heap_end
//!   │                                                         │
//!   ▼                                                         ▼
//!   ┌─────────┬─────────┬─────────┬─────── ─ ─ ─┬──────────┬───┐
//!   │ block 0 │ block 1 │ block 2 │     ...     │ block n  │ E │
//!   └─────────┴─────────┴─────────┴─────── ─ ─ ─┴──────────┴───┘
//!                                                            ▲
//!                                        epilogue header ────┘
//! ```
//!
//! and grows by turning the old epilogue into the header of a new free block
//! and writing a new epilogue at the new end.
//!
//! # Invariants
//!
//! After every public operation returns:
//!
//! - the blocks tile `heap_start..heap_end - WORD` with no gaps or overlaps
//! - no two physically adjacent blocks are both free
//! - every free block is in exactly one free list, the one of its size class
//! - the `PREV_ALLOCATED` tag of every block (and of the epilogue) matches the
//!   state of its left neighbor
//!
//! [`Allocator::check`] verifies all of these.

use core::{iter::FusedIterator, marker::PhantomData, ptr};

use memlib::HeapRegion;
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    block::{ALIGNMENT, Block, HEADER_SIZE, MIN_BLOCK_SIZE, Tags, WORD, adjust_size},
    config::Config,
    error::{
        BadEpilogueSnafu, BrokenLinkSnafu, DiscontiguousSnafu, FooterMismatchSnafu,
        FreeCountMismatchSnafu, GrowSnafu, HeapCheckError, HeapError, InvalidSizeSnafu,
        ListedAllocatedSnafu, MisalignedPayloadSnafu, MisalignedSnafu, NotInitializedSnafu,
        OutOfBoundsSnafu, SizeOverflowSnafu, StalePrevTagSnafu, StrayLinkSnafu, UncoalescedSnafu,
        WrongClassSnafu,
    },
    free_list::{FreeLists, NUM_CLASSES, class_of},
};

/// A dynamic memory allocator managing one growable heap.
///
/// The allocator owns its region and all heap metadata; several allocators
/// can live side by side, each over its own region.
///
/// # Algorithm
///
/// - **Allocation**: the request is rounded up to a block size and looked up
///   in the segregated free lists using the configured [`FitPolicy`]. If no
///   block fits, the heap grows by at least [`Config::chunk_size`] bytes. A
///   block larger than needed is split when the remainder can form a block
///   of its own.
/// - **Deallocation**: the block is marked free and immediately coalesced
///   with free neighbors on both sides.
/// - **Reallocation**: shrinks in place, grows in place into a free right
///   neighbor (or into new heap space when the block is last), and otherwise
///   moves the payload to a new block.
///
/// # Thread Safety
///
/// The allocator is `Send` but not `Sync`. Use
/// [`LockedAllocator`](crate::LockedAllocator) for shared access.
///
/// [`FitPolicy`]: crate::FitPolicy
#[derive(Debug)]
pub struct Allocator<R> {
    region: R,
    config: Config,
    /// Address of the first block, null while uninitialized.
    heap_start: *mut u8,
    /// One past the epilogue header, null while uninitialized.
    heap_end: *mut u8,
    free_lists: FreeLists,
}

unsafe impl<R> Send for Allocator<R> where R: Send {}

/// A snapshot of one block, as yielded by [`Allocator::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub address: *mut u8,
    /// Address of the payload.
    pub payload: *mut u8,
    /// Total size of the block, metadata included.
    pub size: usize,
    /// Whether the block is owned by a caller.
    pub allocated: bool,
}

impl From<Block> for BlockInfo {
    fn from(block: Block) -> Self {
        Self {
            address: block.addr(),
            payload: block.payload(),
            size: block.size(),
            allocated: block.is_allocated(),
        }
    }
}

/// Heap summary returned by [`Allocator::check`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the region, epilogue included.
    pub heap_size: usize,
    /// Number of blocks, epilogue excluded.
    pub blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    /// Total size of allocated blocks, headers included.
    pub allocated_bytes: usize,
    /// Total size of free blocks, boundary tags included.
    pub free_bytes: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
}

/// An iterator over the blocks of a heap in address order.
#[derive(Debug)]
pub struct Blocks<'a> {
    next: Option<Block>,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.filter(|block| !block.is_epilogue())?;
        self.next = Some(block.next_physical());
        Some(block.into())
    }
}

impl FusedIterator for Blocks<'_> {}

impl<R> Allocator<R> {
    /// Creates an uninitialized allocator with the default [`Config`].
    ///
    /// [`init`](Self::init) must be called before allocating.
    #[must_use]
    pub const fn new(region: R) -> Self {
        Self::with_config(region, Config::new())
    }

    /// Creates an uninitialized allocator with the given configuration.
    #[must_use]
    pub const fn with_config(region: R, config: Config) -> Self {
        Self {
            region,
            config,
            heap_start: ptr::null_mut(),
            heap_end: ptr::null_mut(),
            free_lists: FreeLists::new(),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.heap_start.is_null()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn region(&self) -> &R {
        &self.region
    }

    #[must_use]
    pub fn into_region(self) -> R {
        self.region
    }

    /// Returns the number of heap bytes obtained from the region.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_end.addr() - self.heap_start.addr()
    }

    /// Returns an iterator over all blocks in address order.
    ///
    /// The iterator is empty while the allocator is uninitialized.
    pub fn blocks(&self) -> Blocks<'_> {
        let next = self
            .is_initialized()
            .then(|| unsafe { Block::from_addr(self.heap_start) });
        Blocks {
            next,
            _heap: PhantomData,
        }
    }

    fn epilogue_addr(&self) -> usize {
        self.heap_end.addr() - WORD
    }

    /// Resolves a payload pointer to its block if it can belong to this heap.
    ///
    /// The check is best effort: it only rejects pointers that are misaligned
    /// or outside the heap.
    fn owned_block(&self, payload: *mut u8) -> Option<Block> {
        if !self.is_initialized() || !payload.addr().is_multiple_of(ALIGNMENT) {
            return None;
        }
        let first_payload = self.heap_start.addr() + HEADER_SIZE;
        let last_payload = self.epilogue_addr().checked_sub(MIN_BLOCK_SIZE - HEADER_SIZE)?;
        if payload.addr() < first_payload || payload.addr() > last_payload {
            return None;
        }
        Some(unsafe { Block::from_payload(payload) })
    }

    /// Verifies every heap invariant and returns a summary of the heap.
    ///
    /// Intended for debugging and tests; the cost is linear in the number of
    /// blocks.
    pub fn check(&self) -> Result<HeapStats, HeapCheckError> {
        ensure!(self.is_initialized(), NotInitializedSnafu);

        let epilogue_addr = self.epilogue_addr();
        let mut stats = HeapStats {
            heap_size: self.heap_size(),
            ..HeapStats::default()
        };
        let mut block = unsafe { Block::from_addr(self.heap_start) };
        let mut prev_allocated = true;

        while block.addr().addr() != epilogue_addr {
            let address = block.addr().addr();
            let size = block.size();
            ensure!(size >= MIN_BLOCK_SIZE, InvalidSizeSnafu { address, size });
            ensure!(
                address
                    .checked_add(size)
                    .is_some_and(|end| end <= epilogue_addr),
                OutOfBoundsSnafu { address, size }
            );
            ensure!(
                block.payload().addr().is_multiple_of(ALIGNMENT),
                MisalignedPayloadSnafu {
                    address: block.payload().addr()
                }
            );
            ensure!(
                block.prev_allocated() == prev_allocated,
                StalePrevTagSnafu {
                    address,
                    tagged: block.prev_allocated(),
                    actual: prev_allocated,
                }
            );

            if block.is_free() {
                let (header, footer) = (block.header(), block.footer());
                ensure!(
                    header == footer,
                    FooterMismatchSnafu {
                        address,
                        header,
                        footer
                    }
                );
                ensure!(prev_allocated, UncoalescedSnafu { address });
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free = stats.largest_free.max(size);
            } else {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
            }
            stats.blocks += 1;
            prev_allocated = block.is_allocated();
            block = block.next_physical();
        }

        let header = block.header();
        ensure!(
            block.is_epilogue() && block.is_allocated(),
            BadEpilogueSnafu {
                address: epilogue_addr,
                header
            }
        );
        ensure!(
            block.prev_allocated() == prev_allocated,
            StalePrevTagSnafu {
                address: epilogue_addr,
                tagged: block.prev_allocated(),
                actual: prev_allocated,
            }
        );

        self.check_free_lists(stats.free_blocks)?;
        Ok(stats)
    }

    fn check_free_lists(&self, in_heap: usize) -> Result<(), HeapCheckError> {
        let recorded = self.free_lists.len();
        let mut listed = 0;
        for class in 0..NUM_CLASSES {
            let mut prev = None;
            let mut cursor = self.free_lists.head(class);
            while let Some(block) = cursor {
                let address = block.addr().addr();
                // more listed blocks than free blocks means a cycle or a stray
                ensure!(
                    listed < in_heap,
                    FreeCountMismatchSnafu {
                        in_heap,
                        in_lists: listed + 1,
                        recorded
                    }
                );
                ensure!(
                    address >= self.heap_start.addr()
                        && address < self.epilogue_addr()
                        && address.is_multiple_of(ALIGNMENT),
                    StrayLinkSnafu { address }
                );
                ensure!(block.is_free(), ListedAllocatedSnafu { address });
                let size = block.size();
                ensure!(size >= MIN_BLOCK_SIZE, InvalidSizeSnafu { address, size });
                ensure!(
                    class_of(size) == class,
                    WrongClassSnafu {
                        address,
                        size,
                        class
                    }
                );
                ensure!(block.prev_free() == prev, BrokenLinkSnafu { address });
                listed += 1;
                prev = Some(block);
                cursor = block.next_free();
            }
        }
        ensure!(
            listed == in_heap && listed == recorded,
            FreeCountMismatchSnafu {
                in_heap,
                in_lists: listed,
                recorded
            }
        );
        Ok(())
    }
}

impl<R> Allocator<R>
where
    R: HeapRegion,
{
    /// Resets the region and lays out a fresh heap of one free chunk.
    ///
    /// Calling `init` again later is a full reset: every pointer handed out
    /// before becomes invalid.
    ///
    /// On failure the allocator stays uninitialized and every allocation
    /// returns `None`.
    pub fn init(&mut self) -> Result<(), HeapError> {
        self.region.reset();
        self.free_lists.clear();
        self.heap_start = ptr::null_mut();
        self.heap_end = ptr::null_mut();

        let start = self
            .region
            .grow(WORD)
            .context(GrowSnafu { size: WORD })?
            .as_ptr();
        ensure!(
            start.addr().is_multiple_of(ALIGNMENT),
            MisalignedSnafu {
                address: start.addr()
            }
        );
        let epilogue = unsafe { Block::from_addr(start) };
        epilogue.format(0, Tags::ALLOCATED | Tags::PREV_ALLOCATED);
        self.heap_start = start;
        self.heap_end = start.wrapping_add(WORD);

        if let Err(err) = self.extend_heap(self.config.chunk_size) {
            self.heap_start = ptr::null_mut();
            self.heap_end = ptr::null_mut();
            return Err(err);
        }
        log::debug!("heap initialized: heap_size={}", self.heap_size());
        Ok(())
    }

    /// Allocates a block with at least `size` bytes of payload.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`]; the payload contents
    /// are unspecified.
    ///
    /// Returns `None` if `size` is zero, if the allocator is not initialized
    /// or if the region cannot grow enough. A failed allocation leaves the
    /// heap untouched.
    ///
    /// # Examples
    ///
    /// ```
    /// use memlib::MemLib;
    /// use mm::Allocator;
    ///
    /// let mut allocator = Allocator::new(MemLib::with_capacity(1 << 16));
    /// allocator.init().unwrap();
    ///
    /// let ptr = allocator.alloc(24).unwrap();
    /// assert_eq!(ptr.addr() % mm::ALIGNMENT, 0);
    /// unsafe { allocator.free(ptr) };
    /// ```
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        if !self.is_initialized() {
            log::warn!("alloc: allocator is not initialized, size={size}");
            return None;
        }
        let Some(asize) = adjust_size(size) else {
            log::debug!("alloc: size overflows, size={size}");
            return None;
        };

        let block = match self.free_lists.find_fit(asize, self.config.fit) {
            Some(block) => block,
            None => match self.extend_heap(asize.max(self.config.chunk_size)) {
                Ok(block) => block,
                Err(err) => {
                    log::debug!("alloc: out of memory, size={size}: {err}");
                    return None;
                }
            },
        };
        debug_assert!(block.size() >= asize);

        self.free_lists.remove(block);
        self.carve(block, block.size(), asize);
        log::trace!(
            "alloc: size={size} -> {:p}, block_size={}",
            block.payload(),
            block.size()
        );
        Some(block.payload())
    }

    /// Allocates zeroed memory for an array of `count` elements of `size`
    /// bytes each.
    ///
    /// Returns `None` if the total size overflows or the allocation fails.
    pub fn calloc(&mut self, count: usize, size: usize) -> Option<*mut u8> {
        let Some(bytes) = count.checked_mul(size) else {
            log::debug!("calloc: size overflows, count={count}, size={size}");
            return None;
        };
        let ptr = self.alloc(bytes)?;
        unsafe { ptr.write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Releases a block for reuse.
    ///
    /// A null pointer is ignored. Pointers outside the heap and blocks that
    /// are already free (double free) are reported through the logger and
    /// ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` is null or was returned by this allocator since the last
    ///   [`init`](Self::init)
    /// - the payload is not used after this call
    ///
    /// The double-free check relies on the block header still being intact
    /// and is not a substitute for the first requirement.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(block) = self.owned_block(ptr) else {
            log::warn!("free: pointer does not belong to the heap: {ptr:p}");
            return;
        };
        if block.is_free() {
            log::warn!("free: block is already free: {ptr:p}");
            return;
        }
        log::trace!("free: {ptr:p}, block_size={}", block.size());
        self.release(block);
    }

    /// Resizes the block at `ptr` to hold at least `size` bytes.
    ///
    /// - a null `ptr` behaves as [`alloc`](Self::alloc)
    /// - a zero `size` behaves as [`free`](Self::free) and returns `None`
    /// - otherwise the block is resized in place when possible, or moved to
    ///   a new block with the first `min(old, size)` payload bytes copied
    ///
    /// Returns `None` if no block of the requested size can be found; the
    /// original block is then left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free). On success the old pointer must not be
    /// used unless it equals the returned one.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        if ptr.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            unsafe { self.free(ptr) };
            return None;
        }
        let Some(block) = self.owned_block(ptr).filter(|block| block.is_allocated()) else {
            log::warn!("realloc: pointer is not an allocated block: {ptr:p}");
            return None;
        };
        let Some(asize) = adjust_size(size) else {
            log::debug!("realloc: size overflows, size={size}");
            return None;
        };

        let old_size = block.size();
        if asize <= old_size {
            self.shrink_in_place(block, asize);
            log::trace!("realloc: {ptr:p} shrunk in place, size={size}");
            return Some(ptr);
        }
        if self.grow_in_place(block, asize) {
            log::trace!("realloc: {ptr:p} grown in place, size={size}");
            return Some(ptr);
        }

        let new_ptr = self.alloc(size)?;
        let copy_size = (old_size - HEADER_SIZE).min(size);
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, copy_size) };
        self.release(block);
        log::trace!("realloc: {ptr:p} moved to {new_ptr:p}, size={size}");
        Some(new_ptr)
    }

    /// Returns the number of payload bytes usable through `ptr`.
    ///
    /// Returns 0 for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this allocator.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let block = unsafe { Block::from_payload(ptr) };
        debug_assert!(block.is_allocated());
        block.size() - HEADER_SIZE
    }

    /// Grows the heap by at least `bytes` bytes and returns the resulting
    /// free block, already coalesced and listed.
    fn extend_heap(&mut self, bytes: usize) -> Result<Block, HeapError> {
        let size = bytes
            .max(MIN_BLOCK_SIZE)
            .checked_next_multiple_of(ALIGNMENT)
            .context(SizeOverflowSnafu { requested: bytes })?;
        let start = self.region.grow(size).context(GrowSnafu { size })?.as_ptr();
        ensure!(
            start == self.heap_end,
            DiscontiguousSnafu {
                expected: self.heap_end.addr(),
                actual: start.addr(),
            }
        );

        // the old epilogue header becomes the header of the new block
        let block = unsafe { Block::from_addr(start.wrapping_sub(WORD)) };
        block.format(size, Tags::prev(block.prev_allocated()));
        self.heap_end = start.wrapping_add(size);
        let epilogue = unsafe { Block::from_addr(self.heap_end.wrapping_sub(WORD)) };
        epilogue.format(0, Tags::ALLOCATED);

        log::debug!(
            "heap grown by {size} bytes, heap_size={}",
            self.heap_size()
        );
        Ok(self.coalesce(block))
    }

    /// Marks `block` allocated with `asize` bytes taken from the `total`
    /// contiguous unlisted bytes starting at it, and lists the remainder as
    /// a free block when it is large enough to stand alone.
    fn carve(&mut self, block: Block, total: usize, asize: usize) {
        debug_assert!(total >= asize);
        let prev = Tags::prev(block.prev_allocated());
        if total - asize >= MIN_BLOCK_SIZE {
            block.format(asize, Tags::ALLOCATED | prev);
            let rest = block.next_physical();
            rest.format(total - asize, Tags::PREV_ALLOCATED);
            self.free_lists.insert(rest);
        } else {
            block.format(total, Tags::ALLOCATED | prev);
            block.next_physical().set_prev_allocated(true);
        }
    }

    /// Marks an allocated block free and merges it with its neighbors.
    fn release(&mut self, block: Block) {
        debug_assert!(block.is_allocated());
        block.format(block.size(), Tags::prev(block.prev_allocated()));
        block.next_physical().set_prev_allocated(false);
        self.coalesce(block);
    }

    /// Merges an unlisted free block with its free neighbors and lists the
    /// result.
    fn coalesce(&mut self, block: Block) -> Block {
        debug_assert!(block.is_free());
        let mut block = block;
        let mut size = block.size();

        let next = block.next_physical();
        if next.is_free() {
            self.free_lists.remove(next);
            size += next.size();
        }
        if !block.prev_allocated() {
            let prev = block.prev_physical();
            debug_assert!(prev.is_free() && prev.prev_allocated());
            self.free_lists.remove(prev);
            size += prev.size();
            block = prev;
        }

        block.format(size, Tags::prev(block.prev_allocated()));
        self.free_lists.insert(block);
        block
    }

    fn shrink_in_place(&mut self, block: Block, asize: usize) {
        let size = block.size();
        if size - asize < MIN_BLOCK_SIZE {
            return;
        }
        block.format(asize, Tags::ALLOCATED | Tags::prev(block.prev_allocated()));
        let rest = block.next_physical();
        rest.format(size - asize, Tags::PREV_ALLOCATED);
        rest.next_physical().set_prev_allocated(false);
        self.coalesce(rest);
    }

    fn grow_in_place(&mut self, block: Block, asize: usize) -> bool {
        let mut next = block.next_physical();
        let mut available = block.size();
        if next.is_free() {
            available += next.size();
        }

        if available < asize {
            let tail = if next.is_free() {
                next.next_physical()
            } else {
                next
            };
            if !tail.is_epilogue() {
                return false;
            }
            // the new space coalesces with a free `next`, or becomes `next`
            if let Err(err) = self.extend_heap(asize - available) {
                log::debug!("realloc: cannot grow heap in place: {err}");
                return false;
            }
            next = block.next_physical();
            available = block.size() + next.size();
        }
        debug_assert!(next.is_free() && available >= asize);

        self.free_lists.remove(next);
        self.carve(block, available, asize);
        true
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use memlib::{Exhausted, MemLib};

    use super::*;
    use crate::config::FitPolicy;

    const INITIAL_HEAP_SIZE: usize = WORD + Config::DEFAULT_CHUNK_SIZE;

    fn with_test_allocator<F>(capacity: usize, config: Config, test_fn: F)
    where
        F: FnOnce(&mut Allocator<MemLib>),
    {
        let mut allocator = Allocator::with_config(MemLib::with_capacity(capacity), config);
        allocator.init().unwrap();
        test_fn(&mut allocator);
        allocator.check().unwrap();
    }

    fn with_default_allocator<F>(test_fn: F)
    where
        F: FnOnce(&mut Allocator<MemLib>),
    {
        with_test_allocator(1 << 20, Config::new(), test_fn);
    }

    unsafe fn assert_filled(ptr: *mut u8, len: usize, byte: u8) {
        for i in 0..len {
            assert_eq!(unsafe { ptr.add(i).read() }, byte, "offset {i} of {ptr:p}");
        }
    }

    fn assert_disjoint(ranges: &[(*mut u8, usize)]) {
        let mut ranges = ranges.to_vec();
        ranges.sort_by_key(|(ptr, _)| ptr.addr());
        for pair in ranges.windows(2) {
            let (a, a_len) = pair[0];
            let (b, _) = pair[1];
            assert!(a.addr() + a_len <= b.addr(), "{a:p}+{a_len} overlaps {b:p}");
        }
    }

    #[test]
    fn test_init_creates_one_free_chunk() {
        with_default_allocator(|allocator| {
            let stats = allocator.check().unwrap();
            assert_eq!(stats.heap_size, INITIAL_HEAP_SIZE);
            assert_eq!(stats.blocks, 1);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, Config::DEFAULT_CHUNK_SIZE);
            assert_eq!(allocator.region().heap_size(), INITIAL_HEAP_SIZE);
        });
    }

    #[test]
    fn test_alloc_zero() {
        with_default_allocator(|allocator| {
            assert!(allocator.alloc(0).is_none());
            assert_eq!(allocator.check().unwrap().allocated_blocks, 0);
        });
    }

    #[test]
    fn test_alignment() {
        with_default_allocator(|allocator| {
            for size in 1..=200 {
                let ptr = allocator.alloc(size).unwrap();
                assert_eq!(ptr.addr() % ALIGNMENT, 0, "size={size}");
            }
        });
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        with_default_allocator(|allocator| unsafe {
            let sizes = [1, 7, 8, 24, 40, 100, 1000, 3, 4096, 17, 64, 9000];
            let mut live = Vec::new();
            for (i, &size) in sizes.iter().enumerate() {
                let ptr = allocator.alloc(size).unwrap();
                assert!(allocator.usable_size(ptr) >= size);
                ptr.write_bytes(u8::try_from(i).unwrap(), size);
                live.push((ptr, size));
            }
            assert_disjoint(&live);
            for (i, &(ptr, size)) in live.iter().enumerate() {
                assert_filled(ptr, size, u8::try_from(i).unwrap());
            }
        });
    }

    #[test]
    fn test_reuse_after_free() {
        with_default_allocator(|allocator| unsafe {
            let ptr = allocator.alloc(100).unwrap();
            let _guard = allocator.alloc(8).unwrap();
            let heap_size = allocator.heap_size();

            for _ in 0..100 {
                allocator.free(ptr);
                assert_eq!(allocator.alloc(100), Some(ptr));
            }
            allocator.free(ptr);
            assert_eq!(allocator.alloc(80), Some(ptr));
            assert_eq!(allocator.heap_size(), heap_size);
        });
    }

    #[test]
    fn test_reuse_scenario() {
        with_default_allocator(|allocator| unsafe {
            let baseline = allocator.blocks().count();
            let heap_size = allocator.heap_size();

            let a = allocator.alloc(24).unwrap();
            let a_size = allocator.usable_size(a);
            let b = allocator.alloc(40).unwrap();
            allocator.free(a);
            let c = allocator.alloc(16).unwrap();
            assert!(a.addr() <= c.addr() && c.addr() + 16 <= a.addr() + a_size);
            assert_eq!(allocator.heap_size(), heap_size);

            allocator.free(b);
            allocator.free(c);
            assert_eq!(allocator.blocks().count(), baseline);
            let stats = allocator.check().unwrap();
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.allocated_blocks, 0);
        });
    }

    #[test]
    fn test_coalescing_in_both_orders() {
        for reversed in [false, true] {
            with_default_allocator(|allocator| unsafe {
                let a = allocator.alloc(64).unwrap();
                let b = allocator.alloc(64).unwrap();
                let _guard = allocator.alloc(64).unwrap();
                let merged_size = allocator.usable_size(a) + allocator.usable_size(b) + HEADER_SIZE;

                if reversed {
                    allocator.free(b);
                    allocator.free(a);
                } else {
                    allocator.free(a);
                    allocator.free(b);
                }

                let merged = allocator
                    .blocks()
                    .find(|info| !info.allocated && info.payload == a)
                    .unwrap();
                assert_eq!(merged.size, merged_size + HEADER_SIZE);
                assert_eq!(allocator.alloc(merged_size), Some(a));
            });
        }
    }

    #[test]
    fn test_coalescing_three_blocks() {
        with_default_allocator(|allocator| unsafe {
            let a = allocator.alloc(64).unwrap();
            let b = allocator.alloc(64).unwrap();
            let c = allocator.alloc(64).unwrap();
            let _guard = allocator.alloc(64).unwrap();

            allocator.free(a);
            allocator.free(c);
            assert_eq!(allocator.check().unwrap().free_blocks, 3);

            allocator.free(b);
            let stats = allocator.check().unwrap();
            assert_eq!(stats.free_blocks, 2);
            let merged = allocator.blocks().next().unwrap();
            assert_eq!(merged.payload, a);
            assert_eq!(merged.size, 3 * 72);
        });
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        with_default_allocator(|allocator| unsafe {
            let a = allocator.alloc(64).unwrap();
            let _guard = allocator.alloc(8).unwrap();
            allocator.free(a);

            // 72-byte block, 48 needed: a 24-byte remainder cannot stand alone
            let b = allocator.alloc(40).unwrap();
            assert_eq!(b, a);
            assert_eq!(allocator.usable_size(b), 64);
        });
    }

    #[test]
    fn test_heap_grows_on_demand() {
        with_default_allocator(|allocator| unsafe {
            let big = allocator.alloc(3 * Config::DEFAULT_CHUNK_SIZE).unwrap();
            assert!(allocator.heap_size() > INITIAL_HEAP_SIZE);
            big.write_bytes(0xab, 3 * Config::DEFAULT_CHUNK_SIZE);
            assert!(allocator.region().contains(big, 3 * Config::DEFAULT_CHUNK_SIZE));

            allocator.free(big);
            let stats = allocator.check().unwrap();
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, stats.heap_size - WORD);
        });
    }

    #[test]
    fn test_realloc_null_and_zero() {
        with_default_allocator(|allocator| unsafe {
            let ptr = allocator.realloc(ptr::null_mut(), 32).unwrap();
            assert_eq!(allocator.check().unwrap().allocated_blocks, 1);
            assert!(allocator.realloc(ptr, 0).is_none());
            assert_eq!(allocator.check().unwrap().allocated_blocks, 0);
        });
    }

    #[test]
    fn test_realloc_shrinks_in_place() {
        with_default_allocator(|allocator| unsafe {
            let ptr = allocator.alloc(200).unwrap();
            let _guard = allocator.alloc(8).unwrap();
            ptr.write_bytes(0x42, 200);

            assert_eq!(allocator.realloc(ptr, 50), Some(ptr));
            assert_filled(ptr, 50, 0x42);
            assert_eq!(allocator.usable_size(ptr), 56);
            assert_eq!(allocator.check().unwrap().free_blocks, 2);

            // growing back into the freed tail does not move the block
            assert_eq!(allocator.realloc(ptr, 200), Some(ptr));
            assert_filled(ptr, 50, 0x42);
        });
    }

    #[test]
    fn test_realloc_grows_into_free_neighbor() {
        with_default_allocator(|allocator| unsafe {
            let ptr = allocator.alloc(64).unwrap();
            let next = allocator.alloc(64).unwrap();
            let _guard = allocator.alloc(64).unwrap();
            ptr.write_bytes(0x17, 64);
            allocator.free(next);
            let heap_size = allocator.heap_size();

            assert_eq!(allocator.realloc(ptr, 120), Some(ptr));
            assert_filled(ptr, 64, 0x17);
            assert_eq!(allocator.heap_size(), heap_size);
            assert_eq!(allocator.check().unwrap().allocated_blocks, 2);
        });
    }

    #[test]
    fn test_realloc_grows_heap_at_tail() {
        with_default_allocator(|allocator| unsafe {
            let ptr = allocator.alloc(4000).unwrap();
            ptr.write_bytes(0x99, 4000);

            assert_eq!(allocator.realloc(ptr, 8000), Some(ptr));
            assert_filled(ptr, 4000, 0x99);
            assert_eq!(allocator.heap_size(), INITIAL_HEAP_SIZE + (8008 - 4096));
            let stats = allocator.check().unwrap();
            assert_eq!(stats.free_blocks, 0);
            assert_eq!(stats.allocated_blocks, 1);
        });
    }

    #[test]
    fn test_realloc_moves_block() {
        with_default_allocator(|allocator| unsafe {
            let ptr = allocator.alloc(64).unwrap();
            let _pinned = allocator.alloc(64).unwrap();
            for i in 0..64 {
                ptr.add(i).write(u8::try_from(i).unwrap());
            }

            let moved = allocator.realloc(ptr, 1000).unwrap();
            assert_ne!(moved, ptr);
            for i in 0..64 {
                assert_eq!(moved.add(i).read(), u8::try_from(i).unwrap());
            }
            let old = allocator.blocks().find(|info| info.payload == ptr).unwrap();
            assert!(!old.allocated);
        });
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        with_test_allocator(INITIAL_HEAP_SIZE, Config::new(), |allocator| unsafe {
            let ptr = allocator.alloc(64).unwrap();
            let _guard = allocator.alloc(64).unwrap();
            ptr.write_bytes(0x5c, 64);

            assert!(allocator.realloc(ptr, 100_000).is_none());
            assert_filled(ptr, 64, 0x5c);
            assert!(allocator.blocks().any(|info| info.payload == ptr && info.allocated));
        });
    }

    #[test]
    fn test_exhausted_region() {
        let mut allocator = Allocator::new(Exhausted);
        assert!(allocator.init().is_err());
        assert!(!allocator.is_initialized());
        for size in [1, 8, 4096] {
            assert!(allocator.alloc(size).is_none());
        }
        assert!(allocator.calloc(4, 4).is_none());
        assert_eq!(allocator.check(), Err(HeapCheckError::NotInitialized));
        assert_eq!(allocator.blocks().count(), 0);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        with_test_allocator(INITIAL_HEAP_SIZE, Config::new(), |allocator| unsafe {
            let before = allocator.check().unwrap();
            assert!(allocator.alloc(1 << 16).is_none());
            assert_eq!(allocator.check().unwrap(), before);

            let ptr = allocator.alloc(16).unwrap();
            ptr.write_bytes(0, 16);
            allocator.free(ptr);
        });
    }

    #[test]
    fn test_size_overflow() {
        with_default_allocator(|allocator| {
            assert!(allocator.alloc(usize::MAX).is_none());
            assert!(allocator.alloc(usize::MAX - 4).is_none());
            assert!(allocator.calloc(usize::MAX, 2).is_none());
        });
    }

    #[test]
    fn test_double_free_is_ignored() {
        with_default_allocator(|allocator| unsafe {
            let a = allocator.alloc(32).unwrap();
            let _guard = allocator.alloc(32).unwrap();
            allocator.free(a);
            let stats = allocator.check().unwrap();

            allocator.free(a);
            assert_eq!(allocator.check().unwrap(), stats);
            assert!(allocator.realloc(a, 64).is_none());
            assert_eq!(allocator.check().unwrap(), stats);
        });
    }

    #[test]
    fn test_foreign_pointer_is_ignored() {
        with_default_allocator(|allocator| unsafe {
            let mut local = [0_u64; 4];
            let stats = allocator.check().unwrap();
            allocator.free(local.as_mut_ptr().cast());
            allocator.free(ptr::null_mut());
            assert_eq!(allocator.check().unwrap(), stats);
        });
    }

    #[test]
    fn test_calloc_zeroes_memory() {
        with_default_allocator(|allocator| unsafe {
            let dirty = allocator.alloc(256).unwrap();
            dirty.write_bytes(0xff, 256);
            allocator.free(dirty);

            let ptr = allocator.calloc(32, 8).unwrap();
            assert_filled(ptr, 256, 0);
        });
    }

    #[test]
    fn test_fit_policies() {
        for (fit, expect_exact) in [(FitPolicy::FirstFit, false), (FitPolicy::BestFit, true)] {
            with_test_allocator(1 << 20, Config::new().with_fit(fit), |allocator| unsafe {
                let exact = allocator.alloc(72).unwrap();
                let _g1 = allocator.alloc(8).unwrap();
                let loose = allocator.alloc(112).unwrap();
                let _g2 = allocator.alloc(8).unwrap();

                // both blocks share a size class; `loose` ends up at the head
                allocator.free(exact);
                allocator.free(loose);

                let ptr = allocator.alloc(72).unwrap();
                if expect_exact {
                    assert_eq!(ptr, exact);
                } else {
                    assert_eq!(ptr, loose);
                }
            });
        }
    }

    #[test]
    fn test_init_resets_heap() {
        with_default_allocator(|allocator| {
            for size in [10, 200, 5000] {
                allocator.alloc(size).unwrap();
            }
            allocator.init().unwrap();
            let stats = allocator.check().unwrap();
            assert_eq!(stats.heap_size, INITIAL_HEAP_SIZE);
            assert_eq!(stats.blocks, 1);
        });
    }

    #[test]
    fn test_blocks_tile_heap() {
        with_default_allocator(|allocator| unsafe {
            let a = allocator.alloc(10).unwrap();
            let _b = allocator.alloc(300).unwrap();
            let _c = allocator.alloc(5000).unwrap();
            allocator.free(a);

            let mut expected = allocator.blocks().next().unwrap().address;
            let mut total = 0;
            for info in allocator.blocks() {
                assert_eq!(info.address, expected);
                assert_eq!(info.payload.addr(), info.address.addr() + HEADER_SIZE);
                expected = info.address.wrapping_add(info.size);
                total += info.size;
            }
            assert_eq!(total + WORD, allocator.heap_size());
        });
    }

    #[test]
    fn test_check_detects_corruption() {
        let mut allocator = Allocator::new(MemLib::with_capacity(1 << 16));
        allocator.init().unwrap();
        let first = allocator.blocks().next().unwrap();
        assert!(!first.allocated);
        unsafe {
            let footer = first
                .address
                .add(first.size - WORD)
                .cast::<usize>();
            footer.write(footer.read() ^ 0x100);
        }
        assert!(matches!(
            allocator.check(),
            Err(HeapCheckError::FooterMismatch { .. })
        ));
    }

    #[test]
    fn test_check_detects_stale_tag() {
        let mut allocator = Allocator::new(MemLib::with_capacity(1 << 16));
        allocator.init().unwrap();
        let _a = allocator.alloc(32).unwrap();
        let b = allocator.alloc(32).unwrap();
        unsafe {
            // clear PREV_ALLOCATED on `b` even though `a` is allocated
            let header = b.sub(HEADER_SIZE).cast::<usize>();
            header.write(header.read() & !Tags::PREV_ALLOCATED.bits());
        }
        assert!(matches!(
            allocator.check(),
            Err(HeapCheckError::StalePrevTag {
                tagged: false,
                actual: true,
                ..
            })
        ));
    }

    #[test]
    fn test_check_detects_stray_link() {
        let mut allocator = Allocator::new(MemLib::with_capacity(1 << 16));
        allocator.init().unwrap();
        let a = allocator.alloc(64).unwrap();
        let _guard = allocator.alloc(64).unwrap();
        unsafe { allocator.free(a) };
        allocator.check().unwrap();

        let stray = allocator.region().heap_lo().wrapping_sub(64);
        unsafe {
            // next link of the freed block lives in its first payload word
            a.cast::<*mut u8>().write(stray);
        }
        assert_eq!(
            allocator.check(),
            Err(HeapCheckError::StrayLink {
                address: stray.addr()
            })
        );
    }

    struct XorShift(u64);

    impl XorShift {
        fn below(&mut self, n: usize) -> usize {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            usize::try_from(x % u64::try_from(n).unwrap()).unwrap()
        }
    }

    fn run_random_workload(fit: FitPolicy) {
        with_test_allocator(4 << 20, Config::new().with_fit(fit), |allocator| unsafe {
            let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
            let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
            for step in 0..3000_usize {
                let op = if live.is_empty() { 0 } else { rng.below(3) };
                match op {
                    0 => {
                        let size = 1 + rng.below(512);
                        let tag = u8::try_from(step % 251).unwrap();
                        let ptr = allocator.alloc(size).unwrap();
                        assert_eq!(ptr.addr() % ALIGNMENT, 0);
                        ptr.write_bytes(tag, size);
                        live.push((ptr, size, tag));
                    }
                    1 => {
                        let (ptr, size, tag) = live.swap_remove(rng.below(live.len()));
                        assert_filled(ptr, size, tag);
                        allocator.free(ptr);
                    }
                    _ => {
                        let index = rng.below(live.len());
                        let (ptr, size, tag) = live[index];
                        let new_size = 1 + rng.below(1024);
                        let new_ptr = allocator.realloc(ptr, new_size).unwrap();
                        assert_eq!(new_ptr.addr() % ALIGNMENT, 0);
                        assert_filled(new_ptr, size.min(new_size), tag);
                        new_ptr.write_bytes(tag, new_size);
                        live[index] = (new_ptr, new_size, tag);
                    }
                }
                allocator.check().unwrap();
                let ranges = live.iter().map(|&(ptr, size, _)| (ptr, size)).collect::<Vec<_>>();
                assert_disjoint(&ranges);
            }

            for (ptr, size, tag) in live {
                assert_filled(ptr, size, tag);
                allocator.free(ptr);
            }
            let stats = allocator.check().unwrap();
            assert_eq!(stats.allocated_blocks, 0);
            assert_eq!(stats.free_blocks, 1);
        });
    }

    #[test]
    fn test_random_workload_first_fit() {
        run_random_workload(FitPolicy::FirstFit);
    }

    #[test]
    fn test_random_workload_best_fit() {
        run_random_workload(FitPolicy::BestFit);
    }
}
