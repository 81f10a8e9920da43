//! Local APIC and I/O APIC support.
//!
//! The Local APIC delivers interrupts to the CPU; the I/O APIC routes
//! external IRQ lines to vectors. Both register files are memory-mapped
//! and identity-mapped by the loader: the LAPIC base comes out of the
//! IA32_APIC_BASE MSR, the I/O APIC sits at the conventional 0xFEC0_0000
//! (no ACPI MADT parsing here).
//!
//! All register accesses are volatile so the compiler can neither elide
//! nor reorder them against the hardware.

use core::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::Mutex;

use super::msr::{rdmsr, wrmsr};
use crate::error::{KernelError, KernelResult};

// ---------------------------------------------------------------------------
// MSR
// ---------------------------------------------------------------------------

/// IA32_APIC_BASE MSR: bits [51:12] hold the LAPIC base, bit 11 enables it.
const IA32_APIC_BASE_MSR: u32 = 0x1B;
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_MASK: u64 = 0x000F_FFFF_FFFF_F000;

// ---------------------------------------------------------------------------
// Local APIC register offsets
// ---------------------------------------------------------------------------

const LAPIC_ID: u32 = 0x020;
#[allow(dead_code)]
const LAPIC_VERSION: u32 = 0x030;
/// Task Priority Register -- 0 accepts every priority class.
const LAPIC_TPR: u32 = 0x080;
/// End-Of-Interrupt -- write 0 to acknowledge.
const LAPIC_EOI: u32 = 0x0B0;
/// Spurious Interrupt Vector register; bit 8 is the software enable.
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
#[allow(dead_code)]
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

/// LVT mask bit.
const LVT_MASK: u32 = 1 << 16;
/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;
/// Spurious vector, conventionally the top vector.
const SPURIOUS_VECTOR: u8 = 0xFF;
/// LVT timer periodic mode (bits 18:17 = 01).
const TIMER_MODE_PERIODIC: u32 = 0b01 << 17;

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

/// Conventional I/O APIC MMIO base when ACPI is not consulted.
const IOAPIC_BASE: usize = 0xFEC0_0000;

/// Register-select and window for the indirect register file.
const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

const IOAPIC_REG_VER: u32 = 0x01;
/// Each redirection entry is two 32-bit registers starting here.
const IOAPIC_REDTBL_BASE: u32 = 0x10;

/// A 64-bit I/O APIC redirection table entry.
///
/// Bits 7:0 vector, 10:8 delivery mode, 11 destination mode, 13 polarity,
/// 15 trigger mode, 16 mask, 63:56 destination APIC ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry {
    raw: u64,
}

impl RedirectionEntry {
    /// A masked, edge-triggered, active-high, fixed-delivery entry for the
    /// given vector.
    pub const fn new(vector: u8) -> Self {
        Self {
            raw: (vector as u64) | (1u64 << 16),
        }
    }

    pub fn vector(&self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    pub fn set_masked(&mut self, masked: bool) {
        if masked {
            self.raw |= 1 << 16;
        } else {
            self.raw &= !(1 << 16);
        }
    }

    pub fn is_masked(&self) -> bool {
        self.raw & (1 << 16) != 0
    }

    /// Destination APIC ID (physical destination mode).
    pub fn set_destination(&mut self, dest: u8) {
        self.raw = (self.raw & !(0xFFu64 << 56)) | ((dest as u64) << 56);
    }

    pub fn destination(&self) -> u8 {
        (self.raw >> 56) as u8
    }

    pub fn low(&self) -> u32 {
        self.raw as u32
    }

    pub fn high(&self) -> u32 {
        (self.raw >> 32) as u32
    }

    pub fn from_parts(low: u32, high: u32) -> Self {
        Self {
            raw: (low as u64) | ((high as u64) << 32),
        }
    }
}

// ---------------------------------------------------------------------------
// Local APIC
// ---------------------------------------------------------------------------

/// Handle over the memory-mapped Local APIC register file.
struct LocalApic {
    base: usize,
}

impl LocalApic {
    fn new(base: usize) -> Self {
        Self { base }
    }

    fn read(&self, offset: u32) -> u32 {
        let addr = self.base + offset as usize;
        // SAFETY: base came from IA32_APIC_BASE and the region is
        // identity-mapped; volatile keeps the access.
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        let addr = self.base + offset as usize;
        // SAFETY: same mapping contract as `read`; volatile ordering.
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    fn id(&self) -> u8 {
        ((self.read(LAPIC_ID) >> 24) & 0xFF) as u8
    }

    /// Software-enable via the SVR with the spurious vector installed.
    fn enable(&self) {
        self.write(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
    }

    /// Mask every LVT source until it is explicitly programmed.
    fn mask_all_lvt(&self) {
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_LVT_LINT0, LVT_MASK);
        self.write(LAPIC_LVT_LINT1, LVT_MASK);
        self.write(LAPIC_LVT_ERROR, LVT_MASK);
    }

    fn set_task_priority(&self, priority: u8) {
        self.write(LAPIC_TPR, priority as u32);
    }

    fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    /// Program the LAPIC timer: periodic mode, given divide configuration
    /// and initial count. Writing the initial count starts it.
    fn setup_timer(&self, vector: u8, divide: u8, initial_count: u32) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_TIMER_DIV, divide as u32);
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }
}

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

/// Handle over the indirect I/O APIC register file.
struct IoApic {
    base: usize,
}

impl IoApic {
    fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_register(&self, reg: u32) -> u32 {
        // SAFETY: IOREGSEL/IOWIN indirect access at the identity-mapped
        // base; the volatile pair orders select before window.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            ptr::read_volatile((self.base + IOWIN) as *const u32)
        }
    }

    fn write_register(&self, reg: u32, value: u32) {
        // SAFETY: same indirect-access contract as `read_register`.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            ptr::write_volatile((self.base + IOWIN) as *mut u32, value);
        }
    }

    fn max_redirection_entries(&self) -> u8 {
        let ver = self.read_register(IOAPIC_REG_VER);
        (((ver >> 16) & 0xFF) + 1) as u8
    }

    fn read_redirection(&self, irq: u8) -> RedirectionEntry {
        let reg = IOAPIC_REDTBL_BASE + (irq as u32) * 2;
        RedirectionEntry::from_parts(self.read_register(reg), self.read_register(reg + 1))
    }

    fn write_redirection(&self, irq: u8, entry: RedirectionEntry) {
        let reg = IOAPIC_REDTBL_BASE + (irq as u32) * 2;
        // High half first: the low half carries the mask bit, so this
        // ordering never exposes a half-written unmasked entry.
        self.write_register(reg + 1, entry.high());
        self.write_register(reg, entry.low());
    }

    /// Route `irq` to `vector` on the CPU with APIC ID `dest`, unmasked,
    /// edge-triggered, active-high, fixed delivery.
    fn set_irq_route(&self, irq: u8, vector: u8, dest: u8) {
        let mut entry = RedirectionEntry::new(vector);
        entry.set_destination(dest);
        entry.set_masked(false);
        self.write_redirection(irq, entry);
    }

    fn mask_irq(&self, irq: u8) {
        let mut entry = self.read_redirection(irq);
        entry.set_masked(true);
        self.write_redirection(irq, entry);
    }

    fn mask_all(&self) {
        for irq in 0..self.max_redirection_entries() {
            self.mask_irq(irq);
        }
    }
}

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

struct ApicState {
    local_apic: LocalApic,
    io_apic: IoApic,
}

// SAFETY: the fields are plain MMIO base addresses and every access goes
// through the enclosing Mutex; there is no unsynchronised shared state.
unsafe impl Send for ApicState {}

static APIC_STATE: Mutex<Option<ApicState>> = Mutex::new(None);
static APIC_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the Local APIC and I/O APIC.
///
/// 1. Read the LAPIC base from IA32_APIC_BASE and set the enable bit.
/// 2. Mask all LVTs, software-enable via the SVR (bit 8, vector 0xFF),
///    set TPR to 0.
/// 3. Mask every I/O APIC redirection entry, then route IRQ 0 -> vector 32
///    and IRQ 1 -> vector 33 to this CPU.
///
/// Must run after the IDT is loaded and before `sti`.
pub fn init() -> KernelResult<()> {
    if APIC_INITIALIZED.load(Ordering::Acquire) {
        return Err(KernelError::AlreadyExists { resource: "APIC" });
    }

    let apic_base_msr = rdmsr(IA32_APIC_BASE_MSR);
    let lapic_base = (apic_base_msr & APIC_BASE_MASK) as usize;

    if apic_base_msr & IA32_APIC_BASE_ENABLE == 0 {
        wrmsr(IA32_APIC_BASE_MSR, apic_base_msr | IA32_APIC_BASE_ENABLE);
    }

    let lapic = LocalApic::new(lapic_base);
    lapic.mask_all_lvt();
    lapic.enable();
    lapic.set_task_priority(0);

    let bsp_id = lapic.id();
    log::info!("LAPIC enabled at {:#x} (ID {})", lapic_base, bsp_id);

    let ioapic = IoApic::new(IOAPIC_BASE);
    ioapic.mask_all();
    let lines = ioapic.max_redirection_entries();

    // PIT on IRQ 0 -> vector 32, PS/2 keyboard on IRQ 1 -> vector 33.
    ioapic.set_irq_route(0, super::idt::TIMER_VECTOR, bsp_id);
    ioapic.set_irq_route(1, super::idt::KEYBOARD_VECTOR, bsp_id);

    log::info!("IOAPIC at {:#x}: {} lines, IRQ0->32 IRQ1->33", IOAPIC_BASE, lines);

    *APIC_STATE.lock() = Some(ApicState {
        local_apic: lapic,
        io_apic: ioapic,
    });
    APIC_INITIALIZED.store(true, Ordering::Release);

    Ok(())
}

pub fn is_initialized() -> bool {
    APIC_INITIALIZED.load(Ordering::Acquire)
}

/// Signal End-Of-Interrupt to the Local APIC. Every handler for a
/// LAPIC-delivered vector must end with this; a missed EOI starves all
/// further delivery.
pub fn send_eoi() {
    if let Some(ref s) = *APIC_STATE.lock() {
        s.local_apic.send_eoi();
    }
}

/// Program the LAPIC timer (periodic). `divide` uses the Divide
/// Configuration encoding (0x3 = divide by 16, 0xB = divide by 1).
pub fn setup_timer(vector: u8, divide: u8, initial_count: u32) -> KernelResult<()> {
    let _guard = super::interrupt_guard();
    match *APIC_STATE.lock() {
        Some(ref s) => {
            s.local_apic.setup_timer(vector, divide, initial_count);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}

/// Mask an external IRQ line at the I/O APIC.
pub fn mask_irq(irq: u8) -> KernelResult<()> {
    let _guard = super::interrupt_guard();
    match *APIC_STATE.lock() {
        Some(ref s) => {
            s.io_apic.mask_irq(irq);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}

/// Route an external IRQ line to an interrupt vector on a given CPU.
pub fn set_irq_route(irq: u8, vector: u8, dest: u8) -> KernelResult<()> {
    let _guard = super::interrupt_guard();
    match *APIC_STATE.lock() {
        Some(ref s) => {
            s.io_apic.set_irq_route(irq, vector, dest);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}
