//! Boot-info block handed over by the loader.
//!
//! The stage-2 loader leaves a fixed-layout block at physical 0x9000:
//!
//! ```text
//! offset  size  field
//! 0x00    4     signature (0x1BADB002)
//! 0x04    8     memory_map_ptr
//! 0x0C    4     memory_entries
//! 0x10    4     boot_device
//! 0x14    4     cmdline_ptr
//! 0x18    4     cmdline_size
//! ```
//!
//! followed (wherever `memory_map_ptr` points) by 24-byte E820 entries.
//! Low physical memory is identity-mapped at this point, so the physical
//! pointers are dereferenced directly.

use crate::error::{KernelError, KernelResult};

/// Physical address of the boot-info block.
pub const BOOT_INFO_ADDR: u64 = 0x9000;

/// Expected signature written by the loader.
pub const BOOT_INFO_SIGNATURE: u32 = 0x1BAD_B002;

/// Upper bound on memory-map entries the kernel will look at.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 128;

/// Loader-provided boot information. Read-only for the kernel.
#[repr(C, packed)]
pub struct BootInfo {
    pub signature: u32,
    pub memory_map_ptr: u64,
    pub memory_entries: u32,
    pub boot_device: u32,
    pub cmdline_ptr: u32,
    pub cmdline_size: u32,
}

impl BootInfo {
    /// Check the loader signature.
    pub fn is_valid(&self) -> bool {
        let sig = self.signature;
        sig == BOOT_INFO_SIGNATURE
    }
}

/// E820 region classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Type {
    Ram,
    Reserved,
    Acpi,
    Nvs,
    Unusable,
    Unknown(u32),
}

impl From<u32> for E820Type {
    fn from(raw: u32) -> Self {
        match raw {
            1 => E820Type::Ram,
            2 => E820Type::Reserved,
            3 => E820Type::Acpi,
            4 => E820Type::Nvs,
            5 => E820Type::Unusable,
            other => E820Type::Unknown(other),
        }
    }
}

/// One 24-byte memory-map entry as the BIOS/loader records it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct E820Entry {
    pub base_low: u32,
    pub base_high: u32,
    pub length_low: u32,
    pub length_high: u32,
    pub entry_type: u32,
    pub acpi_ext: u32,
}

impl E820Entry {
    /// Convenience constructor used by tests and the PMM self-checks.
    pub const fn new(base: u64, length: u64, entry_type: u32) -> Self {
        Self {
            base_low: base as u32,
            base_high: (base >> 32) as u32,
            length_low: length as u32,
            length_high: (length >> 32) as u32,
            entry_type,
            acpi_ext: 0,
        }
    }

    pub fn base(&self) -> u64 {
        (self.base_low as u64) | ((self.base_high as u64) << 32)
    }

    pub fn length(&self) -> u64 {
        (self.length_low as u64) | ((self.length_high as u64) << 32)
    }

    pub fn kind(&self) -> E820Type {
        E820Type::from(self.entry_type)
    }
}

/// Fetch the boot-info block left by the loader.
///
/// Fails if the signature does not match (the loader did not run, or the
/// block was clobbered); callers log and continue without a memory map.
pub fn boot_info() -> KernelResult<&'static BootInfo> {
    // SAFETY: BOOT_INFO_ADDR is the loader's handover address in
    // identity-mapped low memory; the block is written once before the
    // kernel starts and never modified afterwards.
    let info = unsafe { &*(BOOT_INFO_ADDR as *const BootInfo) };
    if !info.is_valid() {
        return Err(KernelError::InvalidArgument {
            name: "boot_info signature",
        });
    }
    Ok(info)
}

/// The E820 memory map described by a boot-info block.
///
/// The entry count is clamped to [`MAX_MEMORY_MAP_ENTRIES`].
pub fn memory_map(info: &BootInfo) -> &'static [E820Entry] {
    let count = (info.memory_entries as usize).min(MAX_MEMORY_MAP_ENTRIES);
    let ptr = info.memory_map_ptr;
    if ptr == 0 || count == 0 {
        return &[];
    }
    // SAFETY: the loader guarantees `count` contiguous E820 entries at
    // `ptr` in identity-mapped low memory, immutable after handover.
    unsafe { core::slice::from_raw_parts(ptr as *const E820Entry, count) }
}

/// The kernel command line, if the loader passed one.
pub fn cmdline(info: &BootInfo) -> Option<&'static str> {
    let ptr = info.cmdline_ptr;
    let len = info.cmdline_size as usize;
    if ptr == 0 || len == 0 {
        return None;
    }
    // SAFETY: same handover contract as `memory_map`.
    let bytes = unsafe { core::slice::from_raw_parts(ptr as u64 as *const u8, len) };
    // Stop at the first NUL; loaders pad the field.
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
    core::str::from_utf8(&bytes[..end]).ok()
}
