//! Error types of the allocator.

use memlib::GrowError;
use snafu::Snafu;

/// The error type returned when the heap cannot be set up or extended.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapError {
    #[snafu(display("failed to grow heap region by {size} bytes"))]
    Grow {
        size: usize,
        #[snafu(source)]
        source: GrowError,
    },
    #[snafu(display("heap extension size overflows: requested={requested}"))]
    SizeOverflow { requested: usize },
    #[snafu(display("region returned misaligned memory: address={address:#x}"))]
    Misaligned { address: usize },
    #[snafu(display(
        "region growth is not contiguous: expected={expected:#x}, actual={actual:#x}"
    ))]
    Discontiguous { expected: usize, actual: usize },
}

/// A violated heap invariant reported by [`Allocator::check`].
///
/// [`Allocator::check`]: crate::Allocator::check
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapCheckError {
    #[snafu(display("allocator is not initialized"))]
    NotInitialized,
    #[snafu(display("block out of heap bounds: address={address:#x}, size={size}"))]
    OutOfBounds { address: usize, size: usize },
    #[snafu(display("misaligned payload: address={address:#x}"))]
    MisalignedPayload { address: usize },
    #[snafu(display("invalid block size: address={address:#x}, size={size}"))]
    InvalidSize { address: usize, size: usize },
    #[snafu(display(
        "header and footer disagree: address={address:#x}, header={header:#x}, footer={footer:#x}"
    ))]
    FooterMismatch {
        address: usize,
        header: usize,
        footer: usize,
    },
    #[snafu(display("adjacent free blocks escaped coalescing: address={address:#x}"))]
    Uncoalesced { address: usize },
    #[snafu(display(
        "previous-allocated tag is stale: address={address:#x}, tagged={tagged}, actual={actual}"
    ))]
    StalePrevTag {
        address: usize,
        tagged: bool,
        actual: bool,
    },
    #[snafu(display("malformed epilogue: address={address:#x}, header={header:#x}"))]
    BadEpilogue { address: usize, header: usize },
    #[snafu(display("free list link points outside the heap: address={address:#x}"))]
    StrayLink { address: usize },
    #[snafu(display("allocated block found in free list: address={address:#x}"))]
    ListedAllocated { address: usize },
    #[snafu(display(
        "free block filed under wrong size class: address={address:#x}, size={size}, class={class}"
    ))]
    WrongClass {
        address: usize,
        size: usize,
        class: usize,
    },
    #[snafu(display("free list links are not symmetric: address={address:#x}"))]
    BrokenLink { address: usize },
    #[snafu(display(
        "free block count mismatch: in_heap={in_heap}, in_lists={in_lists}, recorded={recorded}"
    ))]
    FreeCountMismatch {
        in_heap: usize,
        in_lists: usize,
        recorded: usize,
    },
}
