//! Shared access to an [`Allocator`] behind a spin lock.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use memlib::HeapRegion;
use spin::{Mutex, MutexGuard};

use crate::{block::ALIGNMENT, heap::Allocator};

/// An [`Allocator`] wrapped in a spin lock.
///
/// Every operation takes the lock for its whole duration, so operations from
/// different threads are serialized. The wrapper implements [`GlobalAlloc`]
/// for layouts whose alignment does not exceed [`ALIGNMENT`]; stricter
/// layouts are refused with a null pointer.
///
/// # Examples
///
/// ```
/// use core::alloc::{GlobalAlloc as _, Layout};
///
/// use memlib::MemLib;
/// use mm::{Allocator, LockedAllocator};
///
/// let mut allocator = Allocator::new(MemLib::with_capacity(1 << 16));
/// allocator.init().unwrap();
/// let locked = LockedAllocator::new(allocator);
///
/// let layout = Layout::from_size_align(64, 8).unwrap();
/// let ptr = unsafe { locked.alloc(layout) };
/// assert!(!ptr.is_null());
/// unsafe { locked.dealloc(ptr, layout) };
/// ```
#[derive(Debug)]
pub struct LockedAllocator<R> {
    inner: Mutex<Allocator<R>>,
}

impl<R> LockedAllocator<R> {
    #[must_use]
    pub const fn new(allocator: Allocator<R>) -> Self {
        Self {
            inner: Mutex::new(allocator),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> MutexGuard<'_, Allocator<R>> {
        self.inner.lock()
    }

    #[must_use]
    pub fn into_inner(self) -> Allocator<R> {
        self.inner.into_inner()
    }
}

fn is_supported(layout: Layout) -> bool {
    layout.align() <= ALIGNMENT
}

unsafe impl<R> GlobalAlloc for LockedAllocator<R>
where
    R: HeapRegion + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !is_supported(layout) {
            log::debug!("refusing over-aligned layout: {layout:?}");
            return ptr::null_mut();
        }
        self.lock().alloc(layout.size()).unwrap_or_default()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.lock().free(ptr) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if !is_supported(layout) {
            log::debug!("refusing over-aligned layout: {layout:?}");
            return ptr::null_mut();
        }
        self.lock().calloc(1, layout.size()).unwrap_or_default()
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !is_supported(layout) {
            return ptr::null_mut();
        }
        unsafe { self.lock().realloc(ptr, new_size) }.unwrap_or_default()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;
    extern crate std;

    use alloc::vec::Vec;
    use std::thread;

    use memlib::MemLib;

    use super::*;

    fn locked_allocator(capacity: usize) -> LockedAllocator<MemLib> {
        let mut allocator = Allocator::new(MemLib::with_capacity(capacity));
        allocator.init().unwrap();
        LockedAllocator::new(allocator)
    }

    #[test]
    fn test_global_alloc_roundtrip() {
        let locked = locked_allocator(1 << 16);
        let layout = Layout::from_size_align(100, 8).unwrap();
        unsafe {
            let ptr = locked.alloc(layout);
            assert!(!ptr.is_null());
            ptr.write_bytes(0x3c, 100);

            let grown = locked.realloc(ptr, layout, 400);
            assert!(!grown.is_null());
            for i in 0..100 {
                assert_eq!(grown.add(i).read(), 0x3c);
            }
            locked.dealloc(grown, Layout::from_size_align(400, 8).unwrap());
        }
        let stats = locked.lock().check().unwrap();
        assert_eq!(stats.allocated_blocks, 0);
    }

    #[test]
    fn test_alloc_zeroed() {
        let locked = locked_allocator(1 << 16);
        let layout = Layout::array::<u64>(32).unwrap();
        unsafe {
            let dirty = locked.alloc(layout);
            dirty.write_bytes(0xee, layout.size());
            locked.dealloc(dirty, layout);

            let ptr = locked.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            assert!((0..layout.size()).all(|i| ptr.add(i).read() == 0));
        }
    }

    #[test]
    fn test_over_aligned_layout_is_refused() {
        let locked = locked_allocator(1 << 16);
        let layout = Layout::from_size_align(64, 64).unwrap();
        unsafe {
            assert!(locked.alloc(layout).is_null());
            assert!(locked.alloc_zeroed(layout).is_null());
        }
        assert_eq!(locked.lock().check().unwrap().allocated_blocks, 0);
    }

    #[test]
    fn test_out_of_memory_returns_null() {
        let locked = locked_allocator(8 + 4096);
        let layout = Layout::from_size_align(1 << 20, 8).unwrap();
        assert!(unsafe { locked.alloc(layout) }.is_null());
    }

    #[test]
    fn test_concurrent_use() {
        let locked = locked_allocator(8 << 20);
        thread::scope(|s| {
            for id in 0..4_u8 {
                let locked = &locked;
                s.spawn(move || {
                    let mut live = Vec::new();
                    for round in 0..500_usize {
                        let size = 1 + (round * 37 + usize::from(id) * 11) % 300;
                        let layout = Layout::from_size_align(size, 8).unwrap();
                        let ptr = unsafe { locked.alloc(layout) };
                        assert!(!ptr.is_null());
                        unsafe { ptr.write_bytes(id, size) };
                        live.push((ptr.expose_provenance(), layout));
                        if round % 3 == 0 {
                            let (addr, layout) = live.swap_remove(0);
                            let ptr = ptr::with_exposed_provenance_mut::<u8>(addr);
                            assert!((0..layout.size()).all(|i| unsafe { ptr.add(i).read() } == id));
                            unsafe { locked.dealloc(ptr, layout) };
                        }
                    }
                    for (addr, layout) in live {
                        let ptr = ptr::with_exposed_provenance_mut::<u8>(addr);
                        assert!((0..layout.size()).all(|i| unsafe { ptr.add(i).read() } == id));
                        unsafe { locked.dealloc(ptr, layout) };
                    }
                });
            }
        });

        let stats = locked.lock().check().unwrap();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }
}
