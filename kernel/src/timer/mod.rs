//! Monotonic tick accounting and sleep primitives.
//!
//! The single clock source is a counter incremented once per timer
//! interrupt (100 Hz). Hardware programming lives in
//! [`crate::arch::x86_64::timer`]; this module owns the counter, the
//! scheduling quantum, and the blocking sleep helpers.
//!
//! Ticks are the canonical time unit everywhere in the kernel;
//! [`sleep_ms`] is a convenience wrapper that converts and delegates.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelResult;

/// Tick rate the PIT is programmed to.
pub const TIMER_FREQUENCY_HZ: u64 = 100;

/// Ticks a task runs before the timer interrupt invokes the scheduler.
pub const SCHED_QUANTUM_TICKS: u64 = 5;

/// The monotonic tick counter. Written only by the timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program the tick sources: PIT channel 0 at 100 Hz as the calibration
/// reference, plus the LAPIC timer in periodic mode on the same vector.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    crate::arch::x86_64::timer::pit_init(TIMER_FREQUENCY_HZ as u32);
    crate::arch::x86_64::timer::lapic_timer_init()?;
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() -> KernelResult<()> {
    Ok(())
}

/// Current tick count. Monotonically non-decreasing.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Record one tick; returns the new count.
fn record_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Every `SCHED_QUANTUM_TICKS`-th tick triggers preemption.
fn is_quantum_boundary(tick: u64) -> bool {
    tick % SCHED_QUANTUM_TICKS == 0
}

/// Timer interrupt body, called from the vector-32 handler.
///
/// Order matters: the tick is recorded, the EOI is written, and only then
/// may the scheduler switch away. With the EOI already sent, a context
/// switch inside the handler cannot starve later LAPIC delivery.
pub fn on_timer_interrupt() {
    let now = record_tick();

    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::apic::send_eoi();

    if is_quantum_boundary(now) {
        crate::sched::preempt();
    }
}

/// Convert milliseconds to timer ticks (rounding down, minimum handled by
/// the caller).
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms * TIMER_FREQUENCY_HZ / 1000
}

/// Busy-wait until at least `n` ticks have elapsed, halting between
/// interrupts. Must not be called from interrupt context (it would wait
/// on a counter only interrupts advance).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn sleep_ticks(n: u64) {
    let start = ticks();
    while ticks().wrapping_sub(start) < n {
        crate::arch::x86_64::idle();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn sleep_ticks(_n: u64) {}

/// Busy-wait for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_ticks(ms_to_ticks(ms));
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_ticks_at_100hz() {
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(1000), 100);
        assert_eq!(ms_to_ticks(5), 0);
        assert_eq!(ms_to_ticks(250), 25);
    }

    #[test]
    fn test_quantum_boundaries() {
        assert!(!is_quantum_boundary(1));
        assert!(!is_quantum_boundary(4));
        assert!(is_quantum_boundary(5));
        assert!(!is_quantum_boundary(6));
        assert!(is_quantum_boundary(10));
    }

    #[test]
    fn test_tick_counter_is_monotonic() {
        let before = ticks();
        let a = record_tick();
        let b = record_tick();
        assert!(a > before);
        assert_eq!(b, a + 1);
        assert!(ticks() >= b);
    }
}
