//! A boundary-tag heap allocator with segregated free lists.
//!
//! This crate implements the classic `malloc`/`free`/`realloc` interface on
//! top of a contiguous region that grows only at its high end (see
//! [`memlib::HeapRegion`]). It is `no_std` and keeps all of its metadata
//! inside the heap itself.
//!
//! # Architecture
//!
//! The allocator is split into three layers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Allocator: placement and reclamation policy          │
//! │   init / alloc / free / realloc / calloc / check     │
//! ├──────────────────────────┬───────────────────────────┤
//! │ free lists               │ block catalog             │
//! │   16 segregated classes  │   header | payload |      │
//! │   LIFO, doubly linked    │   footer (free only)      │
//! ├──────────────────────────┴───────────────────────────┤
//! │ HeapRegion (memlib): grow-only contiguous memory     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! - **Block catalog**: every block starts with a header word holding its
//!   size and two tags, `ALLOCATED` and `PREV_ALLOCATED`. Free blocks also
//!   keep a footer so that their right neighbor can find them.
//! - **Free lists**: free blocks are kept in size-class lists threaded
//!   through their payloads. A fit is searched from the class of the request
//!   upward, with either first-fit or best-fit ([`FitPolicy`]).
//! - **Policy**: blocks are split when the remainder can stand alone, freed
//!   blocks are coalesced with both neighbors immediately, and the heap grows
//!   by at least [`Config::chunk_size`] bytes when nothing fits.
//!
//! Every payload is aligned to [`ALIGNMENT`] bytes.
//!
//! # Usage Example
//!
//! ```rust
//! use memlib::MemLib;
//! use mm::Allocator;
//!
//! let mut allocator = Allocator::new(MemLib::new());
//! allocator.init().unwrap();
//!
//! let a = allocator.alloc(24).unwrap();
//! let b = allocator.alloc(40).unwrap();
//! unsafe {
//!     a.write_bytes(0xaa, 24);
//!     let a = allocator.realloc(a, 200).unwrap();
//!     assert_eq!(a.read(), 0xaa);
//!     allocator.free(a);
//!     allocator.free(b);
//! }
//!
//! let stats = allocator.check().unwrap();
//! assert_eq!(stats.allocated_blocks, 0);
//! ```
//!
//! # Thread Safety
//!
//! [`Allocator`] needs `&mut self` for every mutating operation. Wrap it in a
//! [`LockedAllocator`] to share it between threads or to install it as a
//! [`GlobalAlloc`](core::alloc::GlobalAlloc).

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use memlib::{GrowError, HeapRegion};

pub use self::{
    block::ALIGNMENT,
    config::{Config, FitPolicy, ParseFitPolicyError},
    error::{HeapCheckError, HeapError},
    heap::{Allocator, BlockInfo, Blocks, HeapStats},
    locked::LockedAllocator,
};

mod block;
pub mod config;
pub mod error;
mod free_list;
mod heap;
pub mod locked;
