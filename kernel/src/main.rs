//! CinderOS kernel entry point.
//!
//! The loader drops us here in 64-bit mode with paging enabled, low
//! memory identity mapped, and a boot-info block at 0x9000. The boot
//! sequence brings the subsystems up strictly in dependency order:
//! console and logging first, then CPU tables, memory, interrupts,
//! timers, and finally the scheduler with its demo workload.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use core::panic::PanicInfo;

#[cfg(target_os = "none")]
use cinder_kernel::{
    arch, mm, println, process, sched, serial_println, syscall,
    syscall::{SYS_GETPID, SYS_WRITE},
    timer,
};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    serial_println!("[KERNEL PANIC] {}", info);
    arch::halt();
}

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    arch::x86_64::vga::clear();
    println!("CinderOS v{}", env!("CARGO_PKG_VERSION"));

    if cinder_kernel::logger::init().is_err() {
        println!("logger already installed");
    }

    // GDT, IDT, PIC remap+mask. Interrupts stay disabled.
    arch::x86_64::init();

    // PMM from the boot-info memory map, VMM from CR3, then the heap.
    if let Err(e) = mm::init() {
        log::error!("memory init failed: {}", e);
        println!("memory init failed -- halting");
        arch::halt();
    }

    // LAPIC + IOAPIC, then both tick sources.
    match arch::x86_64::apic::init() {
        Ok(()) => {
            if let Err(e) = timer::init() {
                log::error!("timer init failed: {}", e);
            }
        }
        Err(e) => log::error!("APIC unavailable: {}", e),
    }

    if let Err(e) = syscall::init() {
        log::error!("syscall init failed: {}", e);
    }
    if let Err(e) = process::init() {
        log::error!("process init failed: {}", e);
    }
    if let Err(e) = sched::init() {
        log::error!("scheduler init failed: {}", e);
    }

    // Demo workload: liveness proof for sleep, yield and preemption. Each
    // worker is registered in the process table for PID-level identity and
    // scheduled as a kernel task.
    for (entry, name) in [
        (heartbeat_task as fn(), "heartbeat"),
        (counter_task as fn(), "counter"),
    ] {
        if let Err(e) = process::spawn_kernel(entry, name) {
            log::error!("create {} process: {}", name, e);
        }
        if let Err(e) = sched::spawn(entry) {
            log::error!("spawn {} task: {}", name, e);
        }
    }

    println!("CinderOS initialized");
    arch::x86_64::enable_interrupts();

    // The boot CPU becomes the idle task from here on.
    sched::run()
}

/// Prints a liveness line every second via the syscall path.
#[cfg(target_os = "none")]
fn heartbeat_task() {
    loop {
        let pid = syscall::dispatch(SYS_GETPID, 0, 0, 0, 0, 0, 0);
        let msg = b"heartbeat\n";
        syscall::dispatch(SYS_WRITE, 1, msg.as_ptr() as u64, msg.len() as u64, 0, 0, 0);
        log::debug!("heartbeat from pid {} at tick {}", pid, timer::ticks());
        sched::sleep(timer::TIMER_FREQUENCY_HZ);
    }
}

/// Spins politely, yielding every iteration; preemption and fairness are
/// visible in the per-task tick counts.
#[cfg(target_os = "none")]
fn counter_task() {
    let mut iterations: u64 = 0;
    loop {
        iterations = iterations.wrapping_add(1);
        if iterations % 1_000_000 == 0 {
            log::debug!("counter at {}M iterations", iterations / 1_000_000);
        }
        sched::yield_now();
    }
}

// The binary only exists for bare metal; host builds of this package are
// for `cargo test` against the library.
#[cfg(not(target_os = "none"))]
fn main() {}
