//! Memory management: physical frames, page tables, and the kernel heap.
//!
//! Initialization order matters and is driven by [`init`]: the PMM parses
//! the loader's memory map first, the VMM then adopts the active PML4
//! from CR3, and finally the heap maps its initial arena. From that point
//! on `alloc` types are usable everywhere outside interrupt handlers.

pub mod heap;
pub mod page_table;
pub mod pmm;
pub mod vmm;

use bitflags::bitflags;

use crate::error::KernelResult;

/// Size of a physical frame / virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn is_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn add(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

bitflags! {
    /// Page-table entry flag bits (the low 12 bits of an entry, plus NX).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// The standard flags for kernel data mappings.
    pub const KERNEL_DATA: Self = Self::PRESENT.union(Self::WRITABLE);
}

/// Bring up the whole memory stack from the loader's boot-info block.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    use crate::arch::x86_64::boot;

    match boot::boot_info() {
        Ok(info) => {
            let map = boot::memory_map(info);
            for entry in map {
                log::debug!(
                    "e820: base={:#012x} len={:#012x} {:?}",
                    entry.base(),
                    entry.length(),
                    entry.kind()
                );
            }
            pmm::init(map)?;

            if let Some(cmdline) = boot::cmdline(info) {
                log::info!("cmdline: {}", cmdline);
            }
        }
        Err(e) => {
            // Continue without a map; the PMM falls back to a conservative
            // single region so the kernel can still come up under QEMU.
            log::warn!("boot info rejected ({}), assuming 128 MiB of RAM", e);
            pmm::init_fallback()?;
        }
    }

    vmm::init()?;
    heap::init()?;

    let stats = pmm::stats();
    log::info!(
        "memory: {} KiB total, {} KiB free above 1 MiB",
        stats.total_bytes / 1024,
        stats.free_bytes / 1024
    );

    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() -> KernelResult<()> {
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_address_alignment_helpers() {
        let addr = PhysicalAddress::new(0x1234);
        assert_eq!(addr.align_down().as_u64(), 0x1000);
        assert!(!addr.is_aligned());
        assert!(PhysicalAddress::new(0x2000).is_aligned());

        let v = VirtualAddress::new(0xFFFF_8000_0000_0FFF);
        assert_eq!(v.align_down().as_u64(), 0xFFFF_8000_0000_0000);
    }

    #[test]
    fn test_page_flags_are_the_low_bits() {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        assert_eq!(flags.bits(), 0x7);
        assert_eq!(PageFlags::GLOBAL.bits(), 0x100);
        assert_eq!(PageFlags::NO_EXECUTE.bits(), 1 << 63);
    }
}
