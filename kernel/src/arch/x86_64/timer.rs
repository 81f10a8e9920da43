//! Hardware timer programming: PIT channel 0 and the LAPIC timer.
//!
//! The PIT is the tick source the kernel calibrates against; the LAPIC
//! timer runs in periodic mode on the same vector. Tick accounting lives
//! in [`crate::timer`]; this module only touches the hardware.

use crate::error::KernelResult;

use super::{apic, idt::TIMER_VECTOR, outb};

/// PIT channel 0 data port.
const PIT_CHANNEL0_DATA: u16 = 0x40;
/// PIT mode/command register.
const PIT_COMMAND: u16 = 0x43;
/// PIT input clock in Hz.
const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary counting.
const PIT_MODE3_CMD: u8 = 0x36;

/// LAPIC timer divide configuration: divide by 16.
const LAPIC_TIMER_DIVIDE_BY_16: u8 = 0x3;

/// LAPIC timer initial count. Rough calibration for the bus clocks QEMU
/// and common hardware present with divide-by-16; a self-calibrating pass
/// against the PIT would replace this constant.
const LAPIC_TIMER_INITIAL_COUNT: u32 = 1_000_000;

/// The 16-bit reload divisor for a requested tick rate.
pub fn pit_divisor(frequency_hz: u32) -> u16 {
    (PIT_BASE_FREQUENCY / frequency_hz.max(1)).min(u16::MAX as u32) as u16
}

/// Program PIT channel 0 as a square-wave tick source at `frequency_hz`.
pub fn pit_init(frequency_hz: u32) {
    let divisor = pit_divisor(frequency_hz);

    // SAFETY: mode 3 programming sequence on the documented PIT ports;
    // command byte first, then the divisor low/high through channel 0.
    unsafe {
        outb(PIT_COMMAND, PIT_MODE3_CMD);
        outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0_DATA, (divisor >> 8) as u8);
    }

    log::info!("PIT: {} Hz (divisor {})", frequency_hz, divisor);
}

/// Start the LAPIC timer in periodic mode on the tick vector.
pub fn lapic_timer_init() -> KernelResult<()> {
    apic::setup_timer(TIMER_VECTOR, LAPIC_TIMER_DIVIDE_BY_16, LAPIC_TIMER_INITIAL_COUNT)?;
    log::info!(
        "LAPIC timer: periodic, divide 16, count {}",
        LAPIC_TIMER_INITIAL_COUNT
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_pit_divisor_at_100hz() {
        assert_eq!(pit_divisor(100), 11931);
    }

    #[test]
    fn test_pit_divisor_clamps_to_16_bits() {
        // Very low frequencies must not overflow the 16-bit reload value.
        assert_eq!(pit_divisor(1), u16::MAX);
        // And the highest rates still produce a non-zero divisor.
        assert!(pit_divisor(1_193_182) >= 1);
    }
}
