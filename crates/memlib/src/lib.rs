//! Simulated memory system for heap allocators.
//!
//! This crate provides the region-growth primitive that a heap allocator sits
//! on top of. A region is a single contiguous byte range that can only grow at
//! its high end, in the manner of `sbrk(2)`:
//!
//! ```text
//!  heap_lo                          brk                       capacity
//!    │                               │                            │
//!    ▼                               ▼                            ▼
//!    ┌───────────────────────────────┬────────────────────────────┐
//!    │     bytes handed out so far   │   not yet handed out       │
//!    └───────────────────────────────┴────────────────────────────┘
//!                                    └── grow(n) returns this address
//!                                        and moves brk forward by n
//! ```
//!
//! # Available Regions
//!
//! - [`MemLib`]: a fixed-capacity buffer obtained once from the global
//!   allocator. Growth fails with [`GrowError::Exhausted`] once the break
//!   would pass the capacity.
//! - [`Exhausted`]: a region that never grows. Useful for exercising the
//!   out-of-memory paths of an allocator.
//!
//! # Usage Example
//!
//! ```rust
//! use memlib::{HeapRegion as _, MemLib};
//!
//! let mut mem = MemLib::with_capacity(8192);
//! let first = mem.grow(4096).unwrap();
//! let second = mem.grow(4096).unwrap();
//! assert_eq!(first.as_ptr().wrapping_add(4096), second.as_ptr());
//! assert!(mem.grow(1).is_err());
//! ```

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::alloc::{alloc, dealloc, handle_alloc_error};
use core::{alloc::Layout, ptr::NonNull};

use snafu::{OptionExt as _, Snafu, ensure};

/// Default capacity of a [`MemLib`] region (20 MiB).
pub const DEFAULT_CAPACITY: usize = 20 * (1 << 20);

/// Page size reported by [`MemLib::page_size`].
pub const PAGE_SIZE: usize = 4096;

/// Alignment of the first byte of a [`MemLib`] region.
pub const REGION_ALIGN: usize = 16;

/// The error type returned when a region cannot grow.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GrowError {
    #[snafu(display(
        "region exhausted: requested={requested} bytes, remaining={remaining} bytes"
    ))]
    Exhausted { requested: usize, remaining: usize },
    #[snafu(display("region growth is unavailable"))]
    Unavailable,
}

/// The error type returned when a [`MemLib`] region cannot be created.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CreateError {
    #[snafu(display("region capacity must not be zero"))]
    ZeroCapacity,
    #[snafu(display("region capacity does not form a valid layout: capacity={capacity}"))]
    InvalidLayout { capacity: usize },
    #[snafu(display("failed to allocate region buffer: size={}", layout.size()))]
    AllocFailed { layout: Layout },
}

/// A contiguous memory region that grows only at its high end.
///
/// This is the boundary between an allocator and whatever supplies it with
/// raw memory.
pub trait HeapRegion {
    /// Extends the region by exactly `incr` bytes.
    ///
    /// Returns the address of the first new byte, which is always the
    /// previous end of the region. On failure the region is left unchanged.
    fn grow(&mut self, incr: usize) -> Result<NonNull<u8>, GrowError>;

    /// Shrinks the region back to zero bytes.
    ///
    /// All pointers previously returned by [`grow`](Self::grow) become
    /// dangling from the allocator's point of view.
    fn reset(&mut self);
}

/// A fixed-capacity simulated heap.
///
/// The whole capacity is reserved up front; [`grow`](HeapRegion::grow) only
/// moves the break.
#[derive(Debug)]
pub struct MemLib {
    start: NonNull<u8>,
    brk: usize,
    layout: Layout,
}

// The buffer is exclusively owned by `MemLib`.
unsafe impl Send for MemLib {}

impl Default for MemLib {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLib {
    /// Creates a region with [`DEFAULT_CAPACITY`] bytes of capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a region that can grow up to `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or does not form a valid layout, and
    /// aborts through [`handle_alloc_error`] if the buffer cannot be
    /// allocated. Use [`try_with_capacity`](Self::try_with_capacity) to get
    /// these failures as errors.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        match Self::try_with_capacity(capacity) {
            Ok(mem) => mem,
            Err(CreateError::AllocFailed { layout }) => handle_alloc_error(layout),
            Err(err) => panic!("{err}"),
        }
    }

    /// Creates a region that can grow up to `capacity` bytes, reporting
    /// failures instead of panicking.
    pub fn try_with_capacity(capacity: usize) -> Result<Self, CreateError> {
        ensure!(capacity > 0, ZeroCapacitySnafu);
        let layout = Layout::from_size_align(capacity, REGION_ALIGN)
            .ok()
            .context(InvalidLayoutSnafu { capacity })?;
        let start = NonNull::new(unsafe { alloc(layout) }).context(AllocFailedSnafu { layout })?;
        Ok(Self {
            start,
            brk: 0,
            layout,
        })
    }

    /// Returns the address of the first byte of the region.
    #[must_use]
    pub fn heap_lo(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    /// Returns the address of the last byte of the region.
    ///
    /// For an empty region this is one byte before [`heap_lo`](Self::heap_lo).
    #[must_use]
    pub fn heap_hi(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.brk).wrapping_sub(1)
    }

    /// Returns the number of bytes handed out so far.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.brk
    }

    /// Returns the maximum size of the region.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the page size of the simulated system.
    #[must_use]
    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns `true` if `ptr..ptr + len` lies inside the handed-out bytes.
    #[must_use]
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let lo = self.start.addr().get();
        let Some(end) = ptr.addr().checked_add(len) else {
            return false;
        };
        lo <= ptr.addr() && end <= lo + self.brk
    }
}

impl HeapRegion for MemLib {
    fn grow(&mut self, incr: usize) -> Result<NonNull<u8>, GrowError> {
        let remaining = self.layout.size() - self.brk;
        ensure!(
            incr <= remaining,
            ExhaustedSnafu {
                requested: incr,
                remaining
            }
        );
        let old_brk = unsafe { self.start.add(self.brk) };
        self.brk += incr;
        log::trace!("region grown by {incr} bytes, size={}", self.brk);
        Ok(old_brk)
    }

    fn reset(&mut self) {
        self.brk = 0;
    }
}

impl Drop for MemLib {
    fn drop(&mut self) {
        unsafe { dealloc(self.start.as_ptr(), self.layout) }
    }
}

/// A region that refuses every growth request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

impl HeapRegion for Exhausted {
    fn grow(&mut self, _incr: usize) -> Result<NonNull<u8>, GrowError> {
        UnavailableSnafu.fail()
    }

    fn reset(&mut self) {}
}
