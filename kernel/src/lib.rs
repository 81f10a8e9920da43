//! CinderOS kernel library.
//!
//! Everything the kernel binary runs lives here so the pure logic (memory
//! map parsing, page-table walks, heap block management, scheduler scans,
//! syscall dispatch) can also be built for the host and exercised by the
//! standard test harness. Hardware access compiles everywhere but only
//! runs on bare metal.

#![no_std]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host builds (unit and integration tests) link std and use the system
// allocator; bare-metal builds register the kernel heap (see mm::heap).
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;
#[macro_use]
pub mod serial;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod timer;

// Re-exports for the binary and the integration tests.
pub use error::{KernelError, KernelResult};

/// Heap allocation failure in a no_std kernel is unrecoverable; the
/// handler ABI requires divergence.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
