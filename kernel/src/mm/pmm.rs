//! Physical memory manager.
//!
//! Parses the E820 map into a sorted table of usable RAM regions and hands
//! out 4 KiB frames. Allocation is a bump cursor walking the RAM regions
//! from 2 MiB upwards (the first megabyte belongs to the BIOS and VGA, the
//! second holds the kernel image), fronted by a bounded LIFO stack of
//! freed frames so releases are real rather than the no-op some early
//! kernels ship with. Callers must not assume successive frames are
//! contiguous.

use spin::Mutex;

use super::{PhysicalAddress, PAGE_SIZE};
use crate::{
    arch::x86_64::boot::{E820Entry, E820Type},
    error::{KernelError, KernelResult},
};

/// Upper bound on tracked RAM regions.
pub const MAX_REGIONS: usize = 128;

/// Capacity of the freed-frame stack. Frames released beyond this are
/// dropped (logged once per overflow) rather than corrupting state.
const FREE_STACK_CAPACITY: usize = 1024;

/// First frame the bump cursor may hand out: above the BIOS megabyte and
/// the kernel image loaded at 1 MiB.
const ALLOC_BASE: u64 = 0x20_0000;

/// Memory above this counts as free at init (the low megabyte is
/// reserved for the BIOS, real-mode IVT, and VGA).
const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

/// One usable RAM region, page-aligned endpoints not required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
}

impl MemoryRegion {
    const fn empty() -> Self {
        Self { base: 0, length: 0 }
    }

    fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub region_count: usize,
}

/// The physical frame allocator. One global instance behind a Mutex.
pub struct FrameAllocator {
    /// Usable RAM regions, sorted by base, disjoint.
    regions: [MemoryRegion; MAX_REGIONS],
    region_count: usize,
    total_bytes: u64,
    free_bytes: u64,
    /// Next candidate address for the bump cursor.
    cursor: u64,
    /// Stack of frames returned through `free_frame`.
    free_stack: [u64; FREE_STACK_CAPACITY],
    free_count: usize,
    /// Set once a freed frame had to be dropped on the floor.
    free_stack_overflowed: bool,
    initialized: bool,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            regions: [MemoryRegion::empty(); MAX_REGIONS],
            region_count: 0,
            total_bytes: 0,
            free_bytes: 0,
            cursor: ALLOC_BASE,
            free_stack: [0; FREE_STACK_CAPACITY],
            free_count: 0,
            free_stack_overflowed: false,
            initialized: false,
        }
    }

    /// Build the region table from an E820 map. Only RAM entries are
    /// recorded; they are kept sorted and the derived totals computed.
    pub fn init_from_map(&mut self, map: &[E820Entry]) -> KernelResult<()> {
        if self.initialized {
            return Err(KernelError::AlreadyExists { resource: "PMM" });
        }

        self.region_count = 0;
        self.total_bytes = 0;
        self.free_bytes = 0;

        for entry in map {
            if entry.kind() != E820Type::Ram || entry.length() == 0 {
                continue;
            }
            if self.region_count >= MAX_REGIONS {
                log::warn!("memory map has more than {} RAM regions, rest ignored", MAX_REGIONS);
                break;
            }

            let region = MemoryRegion {
                base: entry.base(),
                length: entry.length(),
            };

            // Insertion sort by base; the table stays small.
            let mut i = self.region_count;
            while i > 0 && self.regions[i - 1].base > region.base {
                self.regions[i] = self.regions[i - 1];
                i -= 1;
            }
            self.regions[i] = region;
            self.region_count += 1;

            self.total_bytes += region.length;
            if region.end() > LOW_MEMORY_LIMIT {
                self.free_bytes += region.end() - region.base.max(LOW_MEMORY_LIMIT);
            }
        }

        self.cursor = ALLOC_BASE;
        self.initialized = true;
        Ok(())
    }

    /// Hand out one 4 KiB-aligned frame, or `None` on exhaustion.
    pub fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        if !self.initialized {
            return None;
        }

        // Recycled frames first.
        if self.free_count > 0 {
            self.free_count -= 1;
            let addr = self.free_stack[self.free_count];
            self.free_bytes = self.free_bytes.saturating_sub(PAGE_SIZE as u64);
            return Some(PhysicalAddress::new(addr));
        }

        // Advance the cursor through the sorted RAM regions.
        for region in &self.regions[..self.region_count] {
            if region.end() < ALLOC_BASE {
                continue;
            }

            let region_start = align_up(region.base.max(self.cursor).max(ALLOC_BASE));
            if region_start + PAGE_SIZE as u64 <= region.end() {
                self.cursor = region_start + PAGE_SIZE as u64;
                self.free_bytes = self.free_bytes.saturating_sub(PAGE_SIZE as u64);
                return Some(PhysicalAddress::new(region_start));
            }
        }

        None
    }

    /// Release a frame back to the allocator.
    ///
    /// Detects and reports double frees; a full free stack drops the frame
    /// (a bounded leak) instead.
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> KernelResult<()> {
        if !addr.is_aligned() {
            return Err(KernelError::InvalidArgument { name: "frame address" });
        }
        let raw = addr.as_u64();
        if raw >= self.cursor && !self.free_stack[..self.free_count].contains(&raw) {
            // Never handed out by the cursor and not a recycled frame.
            return Err(KernelError::InvalidArgument { name: "frame address" });
        }
        if self.free_stack[..self.free_count].contains(&raw) {
            return Err(KernelError::DoubleFree { addr: raw });
        }

        if self.free_count == FREE_STACK_CAPACITY {
            if !self.free_stack_overflowed {
                self.free_stack_overflowed = true;
                log::warn!("PMM free stack full, dropping frame {:#x}", raw);
            }
            return Ok(());
        }

        self.free_stack[self.free_count] = raw;
        self.free_count += 1;
        self.free_bytes += PAGE_SIZE as u64;
        Ok(())
    }

    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total_bytes: self.total_bytes,
            free_bytes: self.free_bytes,
            region_count: self.region_count,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Global frame allocator instance.
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Initialise the global allocator from the loader's memory map.
pub fn init(map: &[E820Entry]) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().init_from_map(map)?;
    let stats = FRAME_ALLOCATOR.lock().stats();
    log::info!(
        "PMM: {} regions, {} MiB total",
        stats.region_count,
        stats.total_bytes / (1024 * 1024)
    );
    Ok(())
}

/// Conservative fallback when the boot-info block is unusable: assume the
/// canonical 128 MiB QEMU layout above 1 MiB.
pub fn init_fallback() -> KernelResult<()> {
    let map = [E820Entry::new(0x10_0000, 127 * 1024 * 1024, 1)];
    init(&map)
}

/// Allocate one physical frame.
pub fn alloc_frame() -> Option<PhysicalAddress> {
    FRAME_ALLOCATOR.lock().alloc_frame()
}

/// Free a previously allocated frame.
pub fn free_frame(addr: PhysicalAddress) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().free_frame(addr)
}

/// Current allocator statistics.
pub fn stats() -> PmmStats {
    FRAME_ALLOCATOR.lock().stats()
}
