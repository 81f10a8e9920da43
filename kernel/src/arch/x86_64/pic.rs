//! Legacy 8259 PIC handling.
//!
//! The kernel drives interrupts through the LAPIC/IOAPIC; the legacy PIC
//! pair is only remapped away from the CPU exception range and then fully
//! masked so a spurious legacy IRQ can never alias an exception vector.

use pic8259::ChainedPics;
use spin::Mutex;

/// Master PIC vector base after remap (IRQ 0-7 -> 0x20-0x27).
pub const PIC_1_OFFSET: u8 = 0x20;
/// Slave PIC vector base after remap (IRQ 8-15 -> 0x28-0x2F).
pub const PIC_2_OFFSET: u8 = 0x28;

// SAFETY: the offsets route both PICs clear of the CPU exception vectors.
static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap both PICs and mask every line.
pub fn init() {
    let mut pics = PICS.lock();
    // SAFETY: the ICW1-ICW4 sequence on ports 0x20/0x21 and 0xA0/0xA1 is
    // the documented 8259 init protocol; disable() then writes 0xFF to both
    // mask registers so nothing is delivered through the legacy path.
    unsafe {
        pics.initialize();
        pics.disable();
    }
}
