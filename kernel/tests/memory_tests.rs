//! Memory management integration tests.
//!
//! Runs the PMM, page-table walk, and heap against in-memory state: the
//! same code the kernel runs on bare metal, minus the TLB flushes and
//! MMIO that have no meaning on the host.

use cinder_kernel::arch::x86_64::boot::E820Entry;
use cinder_kernel::mm::{
    heap::KernelHeap,
    page_table::PageTable,
    pmm::FrameAllocator,
    vmm::{Mapper, TableSource},
    PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE,
};

fn ram(base: u64, length: u64) -> E820Entry {
    E820Entry::new(base, length, 1)
}

#[test]
fn pmm_survives_a_full_alloc_free_cycle() {
    let mut pmm = FrameAllocator::new();
    pmm.init_from_map(&[ram(0x10_0000, 16 * 1024 * 1024)]).unwrap();

    let before = pmm.stats().free_bytes;

    let mut frames = Vec::new();
    for _ in 0..64 {
        frames.push(pmm.alloc_frame().expect("enough RAM for 64 frames"));
    }
    assert_eq!(
        pmm.stats().free_bytes,
        before - 64 * PAGE_SIZE as u64,
        "each allocation consumes one frame of free memory"
    );

    for frame in frames {
        pmm.free_frame(frame).unwrap();
    }
    assert_eq!(pmm.stats().free_bytes, before);
}

/// Table source drawing real frames from a PMM, with the table memory
/// living in a host arena standing in for identity-mapped RAM.
struct ArenaTables {
    arena: Vec<PageTable>,
    used: usize,
}

impl ArenaTables {
    fn new(capacity: usize) -> Self {
        let mut arena = Vec::new();
        arena.resize_with(capacity, PageTable::new);
        Self { arena, used: 0 }
    }
}

impl TableSource for ArenaTables {
    fn alloc_table(&mut self) -> Option<PhysicalAddress> {
        if self.used == self.arena.len() {
            return None;
        }
        let table: *const PageTable = &self.arena[self.used];
        self.used += 1;
        Some(PhysicalAddress::new(table as u64))
    }
}

#[test]
fn vmm_maps_a_whole_stack_range_and_tears_it_down() {
    let mut root = Box::new(PageTable::new());
    let mut tables = ArenaTables::new(16);
    // SAFETY: root lives for the whole test; tables are kept in the arena.
    let mut mapper = unsafe { Mapper::new(&mut *root, 0) };

    let base = 0xFFFF_8800_0010_0000u64;
    for page in 0..16u64 {
        mapper
            .map_page(
                VirtualAddress::new(base + page * PAGE_SIZE as u64),
                PhysicalAddress::new(0x20_0000 + page * PAGE_SIZE as u64),
                PageFlags::KERNEL_DATA,
                &mut tables,
            )
            .unwrap();
    }

    // Every page translates to its frame.
    for page in 0..16u64 {
        assert_eq!(
            mapper.translate(VirtualAddress::new(base + page * PAGE_SIZE as u64)),
            Some(PhysicalAddress::new(0x20_0000 + page * PAGE_SIZE as u64))
        );
    }

    // Teardown leaves nothing mapped.
    for page in 0..16u64 {
        mapper
            .unmap_page(VirtualAddress::new(base + page * PAGE_SIZE as u64))
            .unwrap();
    }
    for page in 0..16u64 {
        assert_eq!(
            mapper.translate(VirtualAddress::new(base + page * PAGE_SIZE as u64)),
            None
        );
    }
}

#[test]
fn heap_handles_a_mixed_workload_without_fragmenting_forever() {
    let mut arena = vec![0u64; 64 * 1024 / 8];
    let start = arena.as_mut_ptr() as u64;
    let mut heap = KernelHeap::empty();
    // SAFETY: the Vec provides an exclusive writable arena for the test.
    unsafe { heap.init_with_arena(start, 64 * 1024, start + 64 * 1024) };

    let initial = heap.largest_free_block();

    // Interleaved allocate/free of varied sizes. Transient exhaustion
    // under fragmentation is legitimate; what must hold is that nothing
    // corrupts and everything coalesces back.
    let mut live = Vec::new();
    let mut successes = 0usize;
    for round in 0..8 {
        for size in [24usize, 100, 512, 60, 2048] {
            let p = heap.allocate(size + round);
            if !p.is_null() {
                successes += 1;
                live.push(p);
            }
        }
        // Free half of what we hold, oldest first.
        for _ in 0..live.len() / 2 {
            let p = live.remove(0);
            // SAFETY: p came from this heap and is freed exactly once.
            unsafe { heap.free(p) };
        }
    }
    assert!(successes >= 30, "the 64 KiB arena should satisfy most of the workload");
    for p in live.drain(..) {
        // SAFETY: as above.
        unsafe { heap.free(p) };
    }

    // Full coalescing: one block, the original arena.
    assert_eq!(heap.free_block_count(), 1);
    assert_eq!(heap.largest_free_block(), initial);
}
