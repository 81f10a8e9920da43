//! Kernel heap: `kmalloc`/`kfree` over a VMM-backed arena.
//!
//! The arena is a contiguous virtual range starting at [`HEAP_START`] in
//! higher-half kernel space. The first initialisation maps 4 MiB and
//! installs a single free block; when no block fits, the arena grows by
//! mapping further pages. Blocks form a singly linked list of headers laid
//! out in the arena itself; allocation is best fit, release coalesces with
//! both neighbours (the predecessor is found with a forward scan -- the
//! list is short enough that a doubly linked list is not worth its extra
//! invariants).
//!
//! `kmalloc` must not be called from interrupt context: the heap lock is
//! not interrupt-safe and growth can take the VMM and PMM locks.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use crate::error::KernelResult;

/// Base of the kernel heap arena.
pub const HEAP_START: u64 = 0xFFFF_8000_0000_0000;
/// Hard ceiling for arena growth (256 MiB).
pub const HEAP_MAX_SIZE: usize = 256 * 1024 * 1024;
/// Pages mapped by the first initialisation (4 MiB).
pub const HEAP_INITIAL_SIZE: usize = 4 * 1024 * 1024;

/// Every returned pointer is at least this aligned.
const MIN_ALIGN: usize = 8;
/// A block is split only when the remainder would hold a header plus this
/// many payload bytes.
const SPLIT_THRESHOLD: usize = 16;

/// Block header preceding every payload in the arena.
#[repr(C)]
struct BlockHeader {
    /// Payload bytes following this header.
    size: usize,
    free: bool,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// The block-list allocator. One global instance behind [`LockedHeap`].
pub struct KernelHeap {
    first: *mut BlockHeader,
    heap_start: u64,
    heap_end: u64,
    heap_max: u64,
}

// SAFETY: all access goes through the Mutex in LockedHeap (or exclusive
// ownership in tests); the raw pointers never leave the lock.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self {
            first: core::ptr::null_mut(),
            heap_start: 0,
            heap_end: 0,
            heap_max: 0,
        }
    }

    /// Install a single free block spanning `[start, start + size)`.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, 8-aligned, unused by anything
    /// else, and at least `HEADER_SIZE + MIN_ALIGN` bytes.
    pub unsafe fn init_with_arena(&mut self, start: u64, size: usize, max: u64) {
        let first = start as *mut BlockHeader;
        // SAFETY: caller guarantees the range is mapped and exclusive.
        unsafe {
            (*first).size = size - HEADER_SIZE;
            (*first).free = true;
            (*first).next = core::ptr::null_mut();
        }
        self.first = first;
        self.heap_start = start;
        self.heap_end = start + size as u64;
        self.heap_max = max;
    }

    pub fn is_initialized(&self) -> bool {
        !self.first.is_null()
    }

    /// Allocate `size` bytes, 8-aligned. Null on exhaustion.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 || !self.is_initialized() {
            return core::ptr::null_mut();
        }
        let size = align_up(size, MIN_ALIGN);

        if let Some(block) = self.find_best_fit(size) {
            return self.take_block(block, size);
        }

        // No block fits: extend the arena and retry once.
        if self.grow(HEADER_SIZE + size) {
            if let Some(block) = self.find_best_fit(size) {
                return self.take_block(block, size);
            }
        }

        core::ptr::null_mut()
    }

    /// Release a pointer previously returned by [`allocate`]. Null is a
    /// no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // SAFETY: allocations always carry their header immediately below
        // the payload; caller guarantees ptr came from this heap.
        let block = unsafe { (ptr as *mut BlockHeader).sub(1) };
        unsafe {
            (*block).free = true;
        }

        // Coalesce with the successor first, then with the predecessor, so
        // no two adjacent free blocks survive this call.
        unsafe {
            let next = (*block).next;
            if !next.is_null() && (*next).free {
                (*block).size += HEADER_SIZE + (*next).size;
                (*block).next = (*next).next;
            }

            if let Some(prev) = self.predecessor_of(block) {
                if (*prev).free {
                    (*prev).size += HEADER_SIZE + (*block).size;
                    (*prev).next = (*block).next;
                }
            }
        }
    }

    /// Smallest free block that can hold `size` payload bytes.
    fn find_best_fit(&self, size: usize) -> Option<*mut BlockHeader> {
        let mut best: Option<*mut BlockHeader> = None;
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list nodes all live inside the mapped arena.
            unsafe {
                if (*current).free && (*current).size >= size {
                    let better = match best {
                        Some(b) => (*current).size < (*b).size,
                        None => true,
                    };
                    if better {
                        best = Some(current);
                    }
                }
                current = (*current).next;
            }
        }
        best
    }

    /// Mark `block` used, splitting off the tail when it is worth it.
    fn take_block(&mut self, block: *mut BlockHeader, size: usize) -> *mut u8 {
        // SAFETY: block came from find_best_fit over the live list.
        unsafe {
            if (*block).size >= size + HEADER_SIZE + SPLIT_THRESHOLD {
                let payload = (block as *mut u8).add(HEADER_SIZE);
                let remainder = payload.add(size) as *mut BlockHeader;
                (*remainder).size = (*block).size - size - HEADER_SIZE;
                (*remainder).free = true;
                (*remainder).next = (*block).next;

                (*block).size = size;
                (*block).next = remainder;
            }
            (*block).free = false;
            (block as *mut u8).add(HEADER_SIZE)
        }
    }

    /// The block whose `next` is `block`, if any.
    fn predecessor_of(&self, block: *mut BlockHeader) -> Option<*mut BlockHeader> {
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list nodes all live inside the mapped arena.
            unsafe {
                if (*current).next == block {
                    return Some(current);
                }
                current = (*current).next;
            }
        }
        None
    }

    /// Map more pages at the end of the arena and append a free block.
    /// Returns false when growth is impossible (host build, out of
    /// physical memory, or the arena ceiling is reached).
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn grow(&mut self, needed: usize) -> bool {
        use super::{pmm, vmm, PageFlags, VirtualAddress, PAGE_SIZE};

        let bytes = align_up(needed, PAGE_SIZE);
        if self.heap_end + bytes as u64 > self.heap_max {
            log::warn!("heap: arena ceiling reached, cannot grow by {} bytes", bytes);
            return false;
        }

        let base = self.heap_end;
        let mut mapped = 0usize;
        while mapped < bytes {
            let frame = match pmm::alloc_frame() {
                Some(f) => f,
                None => break,
            };
            let vaddr = VirtualAddress::new(base + mapped as u64);
            if vmm::map_page(vaddr, frame, PageFlags::KERNEL_DATA).is_err() {
                let _ = pmm::free_frame(frame);
                break;
            }
            mapped += PAGE_SIZE;
        }

        if mapped < bytes {
            // Unwind the partial extension: scoped acquisition, nothing
            // half-mapped stays behind.
            for offset in (0..mapped).step_by(PAGE_SIZE) {
                if let Ok(frame) = vmm::unmap_page(VirtualAddress::new(base + offset as u64)) {
                    let _ = pmm::free_frame(frame);
                }
            }
            log::warn!("heap: growth failed, out of physical memory");
            return false;
        }

        // Append the new space as a free block and let the caller's
        // best-fit pass (and later coalescing) absorb it.
        let new_block = base as *mut BlockHeader;
        // SAFETY: the range [base, base+bytes) was just mapped writable.
        unsafe {
            (*new_block).size = bytes - HEADER_SIZE;
            (*new_block).free = true;
            (*new_block).next = core::ptr::null_mut();

            let mut tail = self.first;
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = new_block;
        }
        self.heap_end += bytes as u64;
        true
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    fn grow(&mut self, _needed: usize) -> bool {
        false
    }

    /// Number of free blocks (test/diagnostic hook).
    pub fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list nodes all live inside the mapped arena.
            unsafe {
                if (*current).free {
                    count += 1;
                }
                current = (*current).next;
            }
        }
        count
    }

    /// Size of the largest free block (test/diagnostic hook).
    pub fn largest_free_block(&self) -> usize {
        let mut largest = 0;
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list nodes all live inside the mapped arena.
            unsafe {
                if (*current).free && (*current).size > largest {
                    largest = (*current).size;
                }
                current = (*current).next;
            }
        }
        largest
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Global instance and GlobalAlloc adapter
// ---------------------------------------------------------------------------

/// The global kernel heap behind a spinlock, usable as `#[global_allocator]`.
pub struct LockedHeap(Mutex<KernelHeap>);

impl LockedHeap {
    pub const fn empty() -> Self {
        Self(Mutex::new(KernelHeap::empty()))
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, KernelHeap> {
        self.0.lock()
    }
}

// SAFETY: alloc/dealloc keep the header invariants of KernelHeap; layouts
// with alignment above MIN_ALIGN are over-allocated and carry the original
// pointer one word below the aligned address.
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.0.lock();
        if layout.align() <= MIN_ALIGN {
            return heap.allocate(layout.size());
        }

        // Over-allocate so an aligned address with >= 8 bytes of headroom
        // always exists inside the block, then stash the real pointer just
        // below it for dealloc.
        let padded = layout.size() + layout.align();
        let raw = heap.allocate(padded);
        if raw.is_null() {
            return raw;
        }
        let aligned = align_up(raw as usize + MIN_ALIGN, layout.align());
        // SAFETY: aligned - 8 lies inside the padded allocation.
        unsafe {
            ((aligned - MIN_ALIGN) as *mut usize).write(raw as usize);
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut heap = self.0.lock();
        if layout.align() <= MIN_ALIGN {
            // SAFETY: forwarded caller contract.
            unsafe { heap.free(ptr) };
            return;
        }
        // SAFETY: alloc stored the original pointer one word below.
        unsafe {
            let raw = ((ptr as usize - MIN_ALIGN) as *const usize).read() as *mut u8;
            heap.free(raw);
        }
    }
}

/// The kernel heap instance; the global allocator on bare-metal builds
/// (the host test build uses the system allocator, see the library root).
#[cfg_attr(all(target_arch = "x86_64", target_os = "none"), global_allocator)]
pub static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Map the initial arena and install the first free block.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    use super::{pmm, vmm, PageFlags, VirtualAddress, PAGE_SIZE};

    use crate::error::KernelError;

    let mut heap = KERNEL_HEAP.lock();
    if heap.is_initialized() {
        return Err(KernelError::AlreadyExists { resource: "heap" });
    }

    for offset in (0..HEAP_INITIAL_SIZE).step_by(PAGE_SIZE) {
        let frame = pmm::alloc_frame().ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
        vmm::map_page(
            VirtualAddress::new(HEAP_START + offset as u64),
            frame,
            PageFlags::KERNEL_DATA,
        )?;
    }

    // SAFETY: the range was mapped writable above and belongs to the heap.
    unsafe {
        heap.init_with_arena(
            HEAP_START,
            HEAP_INITIAL_SIZE,
            HEAP_START + HEAP_MAX_SIZE as u64,
        );
    }

    log::info!(
        "heap: {} KiB at {:#x}",
        HEAP_INITIAL_SIZE / 1024,
        HEAP_START
    );
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() -> KernelResult<()> {
    Ok(())
}

/// Allocate `size` bytes from the kernel heap. Null on failure. Not for
/// use from interrupt context.
pub fn kmalloc(size: usize) -> *mut u8 {
    KERNEL_HEAP.lock().allocate(size)
}

/// Release a `kmalloc` allocation. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by [`kmalloc`]
/// that has not been freed since.
pub unsafe fn kfree(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { KERNEL_HEAP.lock().free(ptr) };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::vec;

    use super::*;

    /// A heap over a host-allocated arena. The backing store is kept
    /// alive by the struct.
    struct TestHeap {
        _arena: std::vec::Vec<u64>,
        heap: KernelHeap,
    }

    fn arena_heap(size: usize) -> TestHeap {
        let mut arena = vec![0u64; size / 8];
        let start = arena.as_mut_ptr() as u64;
        let mut heap = KernelHeap::empty();
        // SAFETY: the Vec provides an exclusive, writable, 8-aligned range
        // that outlives the heap (owned by TestHeap).
        unsafe { heap.init_with_arena(start, size, start + size as u64) };
        TestHeap {
            _arena: arena,
            heap,
        }
    }

    #[test]
    fn test_alloc_is_aligned_and_writable() {
        let mut t = arena_heap(4096);
        let p = t.heap.allocate(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0);

        // Write and read back every byte.
        // SAFETY: p points at >= 100 writable bytes inside the arena.
        unsafe {
            for i in 0..100 {
                p.add(i).write((i % 256) as u8);
            }
            for i in 0..100 {
                assert_eq!(p.add(i).read(), (i % 256) as u8);
            }
        }
    }

    #[test]
    fn test_zero_size_returns_null() {
        let mut t = arena_heap(4096);
        assert!(t.heap.allocate(0).is_null());
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut t = arena_heap(4096);
        // SAFETY: null is explicitly allowed.
        unsafe { t.heap.free(core::ptr::null_mut()) };
        assert_eq!(t.heap.free_block_count(), 1);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut t = arena_heap(4096);
        assert!(t.heap.allocate(8192).is_null());
    }

    #[test]
    fn test_best_fit_prefers_smallest_adequate_block() {
        let mut t = arena_heap(8192);

        // Carve the arena into used/free stripes: free a small and a large
        // hole, keep separators allocated.
        let a = t.heap.allocate(64);
        let _sep1 = t.heap.allocate(64);
        let b = t.heap.allocate(512);
        let _sep2 = t.heap.allocate(64);

        // SAFETY: a and b are live allocations from this heap.
        unsafe {
            t.heap.free(a); // small hole (64)
            t.heap.free(b); // large hole (512)
        }

        // A 48-byte request must land in the 64-byte hole, i.e. exactly
        // where `a` was.
        let c = t.heap.allocate(48);
        assert_eq!(c, a);
    }

    #[test]
    fn test_split_only_above_threshold() {
        let mut t = arena_heap(4096);
        let total = t.heap.largest_free_block();

        // Request slightly less than the whole block: the remainder is too
        // small to split, so the allocation swallows the block whole.
        let p = t.heap.allocate(total - HEADER_SIZE - SPLIT_THRESHOLD + 8);
        assert!(!p.is_null());
        assert_eq!(t.heap.free_block_count(), 0);

        // SAFETY: p is a live allocation.
        unsafe { t.heap.free(p) };
        assert_eq!(t.heap.free_block_count(), 1);
        assert_eq!(t.heap.largest_free_block(), total);
    }

    #[test]
    fn test_free_coalesces_in_any_order() {
        let mut t = arena_heap(4096);
        let initial = t.heap.largest_free_block();

        let a = t.heap.allocate(64);
        let b = t.heap.allocate(64);
        let c = t.heap.allocate(64);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        // Free the outer blocks first, then the middle one: afterwards a
        // single free block must span the original arena again.
        // SAFETY: a, b, c are live allocations from this heap.
        unsafe {
            t.heap.free(a);
            t.heap.free(c);
            t.heap.free(b);
        }

        assert_eq!(t.heap.free_block_count(), 1);
        assert_eq!(t.heap.largest_free_block(), initial);
    }

    #[test]
    fn test_no_overlap_after_reuse() {
        let mut t = arena_heap(4096);

        let a = t.heap.allocate(128);
        let b = t.heap.allocate(128);
        // SAFETY: a is a live allocation.
        unsafe { t.heap.free(a) };

        let c = t.heap.allocate(64);
        // The recycled block must not overlap the still-live `b`.
        let c_end = c as usize + 64;
        assert!(c_end <= b as usize || c as usize >= b as usize + 128);

        // And `b` must still hold its bytes: write before, check after.
        // SAFETY: b and c are live allocations.
        unsafe {
            b.write_bytes(0xAB, 128);
            c.write_bytes(0xCD, 64);
            for i in 0..128 {
                assert_eq!(b.add(i).read(), 0xAB);
            }
        }
    }

    #[test]
    fn test_global_alloc_adapter_handles_large_alignment() {
        use core::alloc::GlobalAlloc;

        static TEST_HEAP: LockedHeap = LockedHeap::empty();
        let mut arena = vec![0u64; 4096 / 8];
        let start = arena.as_mut_ptr() as u64;
        // SAFETY: exclusive arena, kept alive until the end of the test.
        unsafe {
            TEST_HEAP.lock().init_with_arena(start, 4096, start + 4096);
        }

        let layout = Layout::from_size_align(100, 64).unwrap();
        // SAFETY: layout is valid and the heap is initialised.
        unsafe {
            let p = TEST_HEAP.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            p.write_bytes(0x5A, 100);
            TEST_HEAP.dealloc(p, layout);
        }
        // Everything back in one block.
        assert_eq!(TEST_HEAP.lock().free_block_count(), 1);
    }
}
