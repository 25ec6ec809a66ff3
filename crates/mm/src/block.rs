//! Block catalog: the in-heap encoding of block metadata.
//!
//! Every byte of the heap belongs to exactly one block. A block starts with a
//! one-word header holding its size and state tags. Free blocks additionally
//! keep a footer (a copy of the header) in their last word and thread the
//! free list through their first two payload words:
//!
//! ```text
//! Allocated Block:
//! ┌────────────────┬──────────────────────────────────────────┐
//! │ size | A | P   │ payload (size - 8 bytes)                 │
//! └────────────────┴──────────────────────────────────────────┘
//!                  ▲
//!                  └── pointer returned to the caller
//!
//! Free Block:
//! ┌────────────────┬──────────┬──────────┬─────────┬──────────────┐
//! │ size | 0 | P   │ next     │ prev     │ unused  │ size | 0 | P │
//! └────────────────┴──────────┴──────────┴─────────┴──────────────┘
//!
//! A = ALLOCATED, P = PREV_ALLOCATED
//! ```
//!
//! Allocated blocks carry no footer. The `PREV_ALLOCATED` tag of the
//! following block records whether the footer of its left neighbor may be
//! read, which is all boundary-tag coalescing needs.
//!
//! The heap is terminated by an epilogue: a zero-sized header tagged
//! `ALLOCATED`.
//!
//! All raw reads and writes of heap metadata happen in this module.

use core::ptr::{self, NonNull};

use bitflags::bitflags;

/// Size of a header, footer or free-list link.
pub(crate) const WORD: usize = 8;

/// Alignment of every block and every payload returned by the allocator.
pub const ALIGNMENT: usize = 8;

pub(crate) const HEADER_SIZE: usize = WORD;
pub(crate) const FOOTER_SIZE: usize = WORD;

/// Smallest block that can hold a header, two free-list links and a footer.
pub(crate) const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 2 * WORD + FOOTER_SIZE;

const SIZE_MASK: usize = !(ALIGNMENT - 1);

const _: () = assert!(size_of::<usize>() == WORD);
const _: () = assert!(size_of::<*mut u8>() <= WORD);
const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(HEADER_SIZE.is_multiple_of(ALIGNMENT));
const _: () = assert!(MIN_BLOCK_SIZE.is_multiple_of(ALIGNMENT));

bitflags! {
    /// State tags stored in the low bits of a header word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Tags: usize {
        /// The block is owned by a caller.
        const ALLOCATED = 1 << 0;
        /// The physically preceding block is allocated (or does not exist).
        const PREV_ALLOCATED = 1 << 1;
    }
}

const _: () = assert!(Tags::all().bits() & SIZE_MASK == 0);

impl Tags {
    pub(crate) fn prev(prev_allocated: bool) -> Self {
        if prev_allocated {
            Self::PREV_ALLOCATED
        } else {
            Self::empty()
        }
    }
}

/// Computes the block size needed to serve a request of `size` payload bytes.
///
/// Returns `None` if the computation overflows.
pub(crate) fn adjust_size(size: usize) -> Option<usize> {
    let size = size.checked_add(HEADER_SIZE)?.checked_next_multiple_of(ALIGNMENT)?;
    Some(size.max(MIN_BLOCK_SIZE))
}

/// A handle to a block inside a heap.
///
/// A `Block` is the address of the block's header word. Every accessor
/// trusts the invariant established by [`Block::from_addr`]; the handle is
/// `Copy` and carries no lifetime, so it must not be used once the heap it
/// points into has been reset or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    /// Creates a handle from the address of a block header.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `addr` is aligned to [`ALIGNMENT`] and points to a header word inside
    ///   a heap owned by the calling allocator (the epilogue counts)
    /// - if the header is not written yet, the caller formats it before any
    ///   other accessor is used
    /// - the heap outlives every use of the handle
    pub(crate) unsafe fn from_addr(addr: *mut u8) -> Self {
        debug_assert!(addr.addr().is_multiple_of(ALIGNMENT), "misaligned block");
        let Some(addr) = NonNull::new(addr) else {
            panic!("block address must not be null");
        };
        Self(addr)
    }

    /// Creates a handle from a payload pointer previously returned by
    /// [`payload`](Self::payload).
    ///
    /// # Safety
    ///
    /// Same as [`from_addr`](Self::from_addr) for `payload - HEADER_SIZE`.
    pub(crate) unsafe fn from_payload(payload: *mut u8) -> Self {
        unsafe { Self::from_addr(payload.wrapping_sub(HEADER_SIZE)) }
    }

    pub(crate) fn addr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Returns the payload pointer handed to callers.
    pub(crate) fn payload(self) -> *mut u8 {
        self.addr().wrapping_add(HEADER_SIZE)
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn word(self, offset: usize) -> *mut usize {
        self.addr().wrapping_add(offset).cast::<usize>()
    }

    /// The footer word of the physically preceding block.
    #[expect(clippy::cast_ptr_alignment)]
    fn prev_footer(self) -> *mut usize {
        self.addr().wrapping_sub(FOOTER_SIZE).cast::<usize>()
    }

    /// A free-list link stored `offset` bytes into the payload.
    #[expect(clippy::cast_ptr_alignment)]
    fn link(self, offset: usize) -> *mut *mut u8 {
        self.payload().wrapping_add(offset).cast::<*mut u8>()
    }

    fn read_word(self, offset: usize) -> usize {
        unsafe { self.word(offset).read() }
    }

    fn write_word(self, offset: usize, value: usize) {
        unsafe { self.word(offset).write(value) }
    }

    pub(crate) fn header(self) -> usize {
        self.read_word(0)
    }

    /// Returns the footer word. Only meaningful for free blocks.
    pub(crate) fn footer(self) -> usize {
        self.read_word(self.size() - FOOTER_SIZE)
    }

    /// Total size of the block in bytes, metadata included.
    pub(crate) fn size(self) -> usize {
        self.header() & SIZE_MASK
    }

    pub(crate) fn tags(self) -> Tags {
        Tags::from_bits_truncate(self.header())
    }

    pub(crate) fn is_allocated(self) -> bool {
        self.tags().contains(Tags::ALLOCATED)
    }

    pub(crate) fn is_free(self) -> bool {
        !self.is_allocated()
    }

    pub(crate) fn prev_allocated(self) -> bool {
        self.tags().contains(Tags::PREV_ALLOCATED)
    }

    pub(crate) fn is_epilogue(self) -> bool {
        self.size() == 0
    }

    /// Writes the header, and the footer if the block is free.
    pub(crate) fn format(self, size: usize, tags: Tags) {
        debug_assert!(size.is_multiple_of(ALIGNMENT));
        debug_assert!(size == 0 || size >= MIN_BLOCK_SIZE || tags.contains(Tags::ALLOCATED));
        let word = size | tags.bits();
        self.write_word(0, word);
        if !tags.contains(Tags::ALLOCATED) {
            debug_assert!(size >= MIN_BLOCK_SIZE);
            self.write_word(size - FOOTER_SIZE, word);
        }
    }

    /// Updates the `PREV_ALLOCATED` tag, keeping the footer in sync.
    pub(crate) fn set_prev_allocated(self, prev_allocated: bool) {
        let mut tags = self.tags();
        tags.set(Tags::PREV_ALLOCATED, prev_allocated);
        self.format(self.size(), tags);
    }

    /// Returns the block that physically follows this one.
    ///
    /// Must not be called on the epilogue.
    pub(crate) fn next_physical(self) -> Self {
        debug_assert!(!self.is_epilogue());
        unsafe { Self::from_addr(self.addr().wrapping_add(self.size())) }
    }

    /// Returns the block that physically precedes this one.
    ///
    /// Only valid when [`prev_allocated`](Self::prev_allocated) is `false`,
    /// because the lookup goes through the neighbor's footer.
    pub(crate) fn prev_physical(self) -> Self {
        debug_assert!(!self.prev_allocated());
        let footer = unsafe { self.prev_footer().read() };
        let size = footer & SIZE_MASK;
        debug_assert!(size >= MIN_BLOCK_SIZE);
        unsafe { Self::from_addr(self.addr().wrapping_sub(size)) }
    }

    fn read_link(self, offset: usize) -> Option<Self> {
        debug_assert!(self.is_free());
        let link = unsafe { self.link(offset).read() };
        NonNull::new(link).map(Self)
    }

    fn write_link(self, offset: usize, link: Option<Self>) {
        debug_assert!(self.is_free());
        let link = link.map_or(ptr::null_mut(), Self::addr);
        unsafe { self.link(offset).write(link) }
    }

    /// Next block in the same free list.
    pub(crate) fn next_free(self) -> Option<Self> {
        self.read_link(0)
    }

    /// Previous block in the same free list.
    pub(crate) fn prev_free(self) -> Option<Self> {
        self.read_link(WORD)
    }

    pub(crate) fn set_next_free(self, next: Option<Self>) {
        self.write_link(0, next);
    }

    pub(crate) fn set_prev_free(self, prev: Option<Self>) {
        self.write_link(WORD, prev);
    }
}
