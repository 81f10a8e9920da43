//! Paging control primitives: CR2/CR3 access and TLB maintenance.
//!
//! The VMM's flush discipline is built on these: `invlpg` after a leaf
//! entry changes, a full CR3 reload after any non-leaf table changes.

use crate::mm::{PhysicalAddress, VirtualAddress};

/// Read CR3 (physical address of the active PML4).
pub fn read_cr3() -> PhysicalAddress {
    let cr3: u64;
    // SAFETY: Reading CR3 is privileged but side-effect free.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
    }
    PhysicalAddress::new(cr3 & 0x000F_FFFF_FFFF_F000)
}

/// Write CR3 (switch the active PML4; flushes all non-global TLB entries).
///
/// The caller must ensure `addr` points at a valid, 4 KiB-aligned PML4
/// whose kernel mappings cover the currently executing code.
pub fn write_cr3(addr: PhysicalAddress) {
    // SAFETY: contract above; the instruction itself only replaces the
    // paging root and flushes the TLB.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) addr.as_u64(), options(nostack));
    }
}

/// Invalidate the TLB entry covering a single virtual address.
pub fn invlpg(virt: VirtualAddress) {
    // SAFETY: invlpg only drops a cached translation; non-destructive.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack));
    }
}

/// Flush the entire TLB by reloading CR3 with its current value.
pub fn flush_tlb() {
    write_cr3(read_cr3());
}

/// Read CR2 (the faulting address of the last page fault).
pub fn read_cr2() -> VirtualAddress {
    let cr2: u64;
    // SAFETY: Reading CR2 is privileged but side-effect free.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
    }
    VirtualAddress::new(cr2)
}
