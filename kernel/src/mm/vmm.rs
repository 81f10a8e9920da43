//! Virtual memory manager.
//!
//! Owns the active four-level page-table hierarchy behind a single
//! [`AddressSpace`] handle and provides the page-granular primitives the
//! rest of the kernel uses: [`map_page`], [`unmap_page`], [`set_flags`].
//! The raw table walk is private to this module.
//!
//! TLB discipline: a changed leaf entry is followed by `invlpg` on the
//! affected address; installing a new non-leaf table is followed by a
//! full CR3 reload. The kernel runs with low physical memory identity
//! mapped by the loader, so table frames are addressed directly.
//!
//! The first intermediate tables are needed before the heap (or even the
//! PMM) can satisfy allocations, so the VMM carries a fixed pool of
//! sixteen statically allocated tables that is consumed once and never
//! freed.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{
    page_table::{PageTable, TableIndices},
    PageFlags, PhysicalAddress, VirtualAddress,
};
use crate::error::{KernelError, KernelResult};

// Re-exported for callers that think in terms of the VMM.
pub use super::pmm::{alloc_frame, free_frame};

/// Tables available before the PMM comes up.
const BOOTSTRAP_POOL_PAGES: usize = 16;

/// Provides zeroed 4 KiB table frames during a walk.
pub trait TableSource {
    fn alloc_table(&mut self) -> Option<PhysicalAddress>;
}

// ---------------------------------------------------------------------------
// Bootstrap table pool
// ---------------------------------------------------------------------------

struct BootstrapTables(UnsafeCell<[PageTable; BOOTSTRAP_POOL_PAGES]>);

// SAFETY: handed out one table at a time through the atomic cursor below;
// each table is referenced by exactly one page-table entry afterwards.
unsafe impl Sync for BootstrapTables {}

static BOOTSTRAP_TABLES: BootstrapTables =
    BootstrapTables(UnsafeCell::new([const { PageTable::new() }; BOOTSTRAP_POOL_PAGES]));

static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);

/// Take one table from the bootstrap pool, or `None` once it is spent.
fn bootstrap_alloc_table() -> Option<PhysicalAddress> {
    let index = BOOTSTRAP_USED.fetch_add(1, Ordering::Relaxed);
    if index >= BOOTSTRAP_POOL_PAGES {
        return None;
    }
    let base = BOOTSTRAP_TABLES.0.get() as *mut PageTable;
    // SAFETY: `index` is in bounds and claimed exclusively by the
    // fetch_add above; the table is statically zero-initialised.
    let table = unsafe { base.add(index) };
    // Kernel statics live in identity-mapped memory: the pointer value is
    // the physical address.
    Some(PhysicalAddress::new(table as u64))
}

/// The kernel's table source: PMM frames once available, the bootstrap
/// pool before that.
pub struct KernelTableSource;

impl TableSource for KernelTableSource {
    fn alloc_table(&mut self) -> Option<PhysicalAddress> {
        if let Some(frame) = super::pmm::alloc_frame() {
            // SAFETY: the frame was just handed out by the PMM, lies in
            // identity-mapped RAM, and is page-sized.
            unsafe {
                core::ptr::write_bytes(frame.as_u64() as *mut u8, 0, super::PAGE_SIZE);
            }
            return Some(frame);
        }
        bootstrap_alloc_table()
    }
}

// ---------------------------------------------------------------------------
// Mapper: the table walk
// ---------------------------------------------------------------------------

/// Walks and edits a page-table hierarchy rooted at one PML4.
///
/// `phys_offset` translates a table's physical address to the virtual
/// address it can be written through -- zero in the identity-mapped
/// kernel, a host pointer offset in tests.
pub struct Mapper {
    pml4: *mut PageTable,
    phys_offset: u64,
}

// SAFETY: a Mapper is only ever reached through the KERNEL_SPACE mutex
// (or owned locally in tests), so the raw pointer is never shared.
unsafe impl Send for Mapper {}

impl Mapper {
    /// # Safety
    ///
    /// `pml4` must point at a valid, writable PML4 table, and every table
    /// the hierarchy references must be readable at
    /// `physical address + phys_offset` for the Mapper's lifetime.
    pub unsafe fn new(pml4: *mut PageTable, phys_offset: u64) -> Self {
        Self { pml4, phys_offset }
    }

    fn table_ptr(&self, phys: PhysicalAddress) -> *mut PageTable {
        (phys.as_u64() + self.phys_offset) as *mut PageTable
    }

    /// Map `vaddr` to `paddr` with `flags | PRESENT`, creating intermediate
    /// tables as needed. Both addresses are rounded down to page bounds.
    ///
    /// On table-allocation failure no leaf mapping is installed; already
    /// created empty intermediate tables are kept for reuse.
    pub fn map_page(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
        source: &mut impl TableSource,
    ) -> KernelResult<()> {
        let vaddr = vaddr.align_down();
        let paddr = paddr.align_down();
        let idx = TableIndices::of(vaddr);

        // Intermediate entries need USER whenever the leaf does: the CPU
        // ANDs the permission across every level of the walk.
        let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE | (flags & PageFlags::USER);

        // SAFETY: pml4 validity is the constructor contract.
        let pml4 = unsafe { &mut *self.pml4 };
        let pdpt = self.descend(pml4, idx.pml4, table_flags, source)?;
        // SAFETY: descend returns a table reachable via phys_offset.
        let pdpt = unsafe { &mut *pdpt };
        let pd = self.descend(pdpt, idx.pdpt, table_flags, source)?;
        // SAFETY: as above.
        let pd = unsafe { &mut *pd };
        let pt = self.descend(pd, idx.pd, table_flags, source)?;
        // SAFETY: as above.
        let pt = unsafe { &mut *pt };

        pt[idx.pt].set(paddr, flags | PageFlags::PRESENT);
        self.flush_page(vaddr);
        Ok(())
    }

    /// Clear the leaf entry for `vaddr`. Intermediate tables are kept.
    /// Returns the physical frame that was mapped.
    pub fn unmap_page(&mut self, vaddr: VirtualAddress) -> KernelResult<PhysicalAddress> {
        let vaddr = vaddr.align_down();
        let pt = self.leaf_table(vaddr)?;
        let idx = TableIndices::of(vaddr);
        // SAFETY: leaf_table returned a live table.
        let pt = unsafe { &mut *pt };

        let entry = &mut pt[idx.pt];
        let frame = entry.addr().ok_or(KernelError::NotMapped {
            addr: vaddr.as_u64(),
        })?;
        entry.clear();
        self.flush_page(vaddr);
        Ok(frame)
    }

    /// Replace the flags of an existing mapping, preserving the frame.
    pub fn set_flags(&mut self, vaddr: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
        let vaddr = vaddr.align_down();
        let pt = self.leaf_table(vaddr)?;
        let idx = TableIndices::of(vaddr);
        // SAFETY: leaf_table returned a live table.
        let pt = unsafe { &mut *pt };

        let entry = &mut pt[idx.pt];
        let frame = entry.addr().ok_or(KernelError::NotMapped {
            addr: vaddr.as_u64(),
        })?;
        entry.set(frame, flags | PageFlags::PRESENT);
        self.flush_page(vaddr);
        Ok(())
    }

    /// The physical address `vaddr` currently maps to, if any.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let vaddr = vaddr.align_down();
        let pt = self.leaf_table(vaddr).ok()?;
        let idx = TableIndices::of(vaddr);
        // SAFETY: leaf_table returned a live table.
        let pt = unsafe { &*pt };
        pt[idx.pt].addr()
    }

    /// Flags of the current mapping for `vaddr`, if any.
    pub fn flags_of(&self, vaddr: VirtualAddress) -> Option<PageFlags> {
        let vaddr = vaddr.align_down();
        let pt = self.leaf_table(vaddr).ok()?;
        let idx = TableIndices::of(vaddr);
        // SAFETY: leaf_table returned a live table.
        let pt = unsafe { &*pt };
        let entry = &pt[idx.pt];
        entry.addr().map(|_| entry.flags())
    }

    /// Get or create the next-level table behind `table[index]`.
    fn descend(
        &self,
        table: &mut PageTable,
        index: usize,
        table_flags: PageFlags,
        source: &mut impl TableSource,
    ) -> KernelResult<*mut PageTable> {
        let entry = &mut table[index];
        match entry.addr() {
            Some(phys) => {
                // Widen permissions if this walk needs USER and the entry
                // predates any user mapping below it.
                let merged = entry.flags() | table_flags;
                if merged != entry.flags() {
                    entry.set(phys, merged);
                    self.flush_all();
                }
                Ok(self.table_ptr(phys))
            }
            None => {
                let phys = source.alloc_table().ok_or(KernelError::OutOfMemory {
                    requested: super::PAGE_SIZE,
                })?;
                entry.set(phys, table_flags);
                // New non-leaf entry: be conservative and drop the whole TLB.
                self.flush_all();
                Ok(self.table_ptr(phys))
            }
        }
    }

    /// Walk down to the PT covering `vaddr` without creating anything.
    fn leaf_table(&self, vaddr: VirtualAddress) -> KernelResult<*mut PageTable> {
        let idx = TableIndices::of(vaddr);
        let not_mapped = KernelError::NotMapped {
            addr: vaddr.as_u64(),
        };

        // SAFETY: pml4 validity is the constructor contract.
        let pml4 = unsafe { &*self.pml4 };
        let pdpt = pml4[idx.pml4].addr().ok_or(not_mapped)?;
        // SAFETY: present entries reference live tables per the module
        // invariant (entries are only installed by descend()).
        let pdpt = unsafe { &*self.table_ptr(pdpt) };
        let pd = pdpt[idx.pdpt].addr().ok_or(not_mapped)?;
        // SAFETY: as above.
        let pd = unsafe { &*self.table_ptr(pd) };
        let pt = pd[idx.pd].addr().ok_or(not_mapped)?;
        Ok(self.table_ptr(pt))
    }

    #[allow(unused_variables)]
    fn flush_page(&self, vaddr: VirtualAddress) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        crate::arch::x86_64::mmu::invlpg(vaddr);
    }

    fn flush_all(&self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        crate::arch::x86_64::mmu::flush_tlb();
    }
}

// ---------------------------------------------------------------------------
// Kernel address space singleton
// ---------------------------------------------------------------------------

/// The kernel's active address space: the PML4 the loader built, adopted
/// from CR3 at init.
pub struct AddressSpace {
    pml4_phys: PhysicalAddress,
    mapper: Mapper,
}

impl AddressSpace {
    pub fn pml4_phys(&self) -> PhysicalAddress {
        self.pml4_phys
    }
}

static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Adopt the loader's page tables as the kernel address space.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    let mut space = KERNEL_SPACE.lock();
    if space.is_some() {
        return Err(KernelError::AlreadyExists { resource: "VMM" });
    }

    let pml4_phys = crate::arch::x86_64::mmu::read_cr3();
    // SAFETY: CR3 points at the live PML4; identity mapping makes it
    // writable at its physical address (phys_offset 0).
    let mapper = unsafe { Mapper::new(pml4_phys.as_u64() as *mut PageTable, 0) };

    *space = Some(AddressSpace { pml4_phys, mapper });
    log::info!("VMM: adopted PML4 at {:#x}", pml4_phys.as_u64());
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() -> KernelResult<()> {
    Ok(())
}

fn with_kernel_space<R>(f: impl FnOnce(&mut AddressSpace) -> KernelResult<R>) -> KernelResult<R> {
    let mut space = KERNEL_SPACE.lock();
    match space.as_mut() {
        Some(space) => f(space),
        None => Err(KernelError::NotInitialized { subsystem: "VMM" }),
    }
}

/// Map one page in the kernel address space.
pub fn map_page(vaddr: VirtualAddress, paddr: PhysicalAddress, flags: PageFlags) -> KernelResult<()> {
    with_kernel_space(|space| space.mapper.map_page(vaddr, paddr, flags, &mut KernelTableSource))
}

/// Unmap one page in the kernel address space; returns the frame it held.
pub fn unmap_page(vaddr: VirtualAddress) -> KernelResult<PhysicalAddress> {
    with_kernel_space(|space| space.mapper.unmap_page(vaddr))
}

/// Change the flags of an existing kernel mapping.
pub fn set_flags(vaddr: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
    with_kernel_space(|space| space.mapper.set_flags(vaddr, flags))
}

/// Translate a kernel virtual address.
pub fn translate(vaddr: VirtualAddress) -> Option<PhysicalAddress> {
    with_kernel_space(|space| Ok(space.mapper.translate(vaddr))).ok().flatten()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::{boxed::Box, vec::Vec};

    use super::*;
    use crate::mm::PAGE_SIZE;

    /// Table source backed by host allocations; "physical" addresses are
    /// the host pointers themselves (phys_offset 0).
    struct HostTables {
        tables: Vec<Box<PageTable>>,
        capacity: usize,
    }

    impl HostTables {
        fn new(capacity: usize) -> Self {
            Self {
                tables: Vec::new(),
                capacity,
            }
        }
    }

    impl TableSource for HostTables {
        fn alloc_table(&mut self) -> Option<PhysicalAddress> {
            if self.tables.len() >= self.capacity {
                return None;
            }
            self.tables.push(Box::new(PageTable::new()));
            let ptr: *const PageTable = &*self.tables[self.tables.len() - 1];
            Some(PhysicalAddress::new(ptr as u64))
        }
    }

    struct TestSpace {
        root: Box<PageTable>,
        source: HostTables,
    }

    impl TestSpace {
        fn new(capacity: usize) -> Self {
            Self {
                root: Box::new(PageTable::new()),
                source: HostTables::new(capacity),
            }
        }

        fn mapper(&mut self) -> Mapper {
            // SAFETY: root is a live, exclusively owned table; every
            // intermediate table is kept alive by `source`.
            unsafe { Mapper::new(&mut *self.root, 0) }
        }
    }

    const VADDR: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0000_1000);

    #[test]
    fn test_map_translate_unmap_remap() {
        let mut space = TestSpace::new(8);
        let mut mapper = space.mapper();

        mapper
            .map_page(
                VADDR,
                PhysicalAddress::new(0x20_0000),
                PageFlags::KERNEL_DATA,
                &mut space.source,
            )
            .unwrap();
        assert_eq!(mapper.translate(VADDR), Some(PhysicalAddress::new(0x20_0000)));

        let freed = mapper.unmap_page(VADDR).unwrap();
        assert_eq!(freed, PhysicalAddress::new(0x20_0000));
        assert_eq!(mapper.translate(VADDR), None);

        // Remapping the same address with a new frame and flags succeeds
        // and reads back the new values.
        mapper
            .map_page(
                VADDR,
                PhysicalAddress::new(0x30_0000),
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                &mut space.source,
            )
            .unwrap();
        assert_eq!(mapper.translate(VADDR), Some(PhysicalAddress::new(0x30_0000)));
        let flags = mapper.flags_of(VADDR).unwrap();
        assert!(flags.contains(PageFlags::USER));
        assert!(flags.contains(PageFlags::PRESENT));
    }

    #[test]
    fn test_addresses_are_rounded_to_page_bounds() {
        let mut space = TestSpace::new(8);
        let mut mapper = space.mapper();

        mapper
            .map_page(
                VirtualAddress::new(VADDR.as_u64() + 0x123),
                PhysicalAddress::new(0x20_0456),
                PageFlags::KERNEL_DATA,
                &mut space.source,
            )
            .unwrap();
        assert_eq!(mapper.translate(VADDR), Some(PhysicalAddress::new(0x20_0000)));
    }

    #[test]
    fn test_unmap_unmapped_reports_not_mapped() {
        let mut space = TestSpace::new(8);
        let mut mapper = space.mapper();

        assert_eq!(
            mapper.unmap_page(VADDR),
            Err(KernelError::NotMapped {
                addr: VADDR.as_u64()
            })
        );
        assert_eq!(
            mapper.set_flags(VADDR, PageFlags::KERNEL_DATA),
            Err(KernelError::NotMapped {
                addr: VADDR.as_u64()
            })
        );
    }

    #[test]
    fn test_set_flags_preserves_frame() {
        let mut space = TestSpace::new(8);
        let mut mapper = space.mapper();

        mapper
            .map_page(
                VADDR,
                PhysicalAddress::new(0x40_0000),
                PageFlags::KERNEL_DATA,
                &mut space.source,
            )
            .unwrap();
        mapper.set_flags(VADDR, PageFlags::PRESENT).unwrap();

        assert_eq!(mapper.translate(VADDR), Some(PhysicalAddress::new(0x40_0000)));
        assert!(!mapper.flags_of(VADDR).unwrap().contains(PageFlags::WRITABLE));
    }

    #[test]
    fn test_table_exhaustion_surfaces_out_of_memory() {
        // Three intermediate tables are needed; grant only one.
        let mut space = TestSpace::new(1);
        let mut mapper = space.mapper();

        let err = mapper
            .map_page(
                VADDR,
                PhysicalAddress::new(0x20_0000),
                PageFlags::KERNEL_DATA,
                &mut space.source,
            )
            .unwrap_err();
        assert!(matches!(err, KernelError::OutOfMemory { .. }));
        // No leaf mapping was installed.
        assert_eq!(mapper.translate(VADDR), None);
    }

    #[test]
    fn test_intermediate_tables_are_reused() {
        let mut space = TestSpace::new(8);
        let mut mapper = space.mapper();

        mapper
            .map_page(
                VADDR,
                PhysicalAddress::new(0x20_0000),
                PageFlags::KERNEL_DATA,
                &mut space.source,
            )
            .unwrap();
        let tables_after_first = space.source.tables.len();

        let mut mapper = space.mapper();
        mapper
            .map_page(
                VirtualAddress::new(VADDR.as_u64() + PAGE_SIZE as u64),
                PhysicalAddress::new(0x21_0000),
                PageFlags::KERNEL_DATA,
                &mut space.source,
            )
            .unwrap();
        // The neighbouring page shares the whole walk.
        assert_eq!(space.source.tables.len(), tables_after_first);
    }
}
