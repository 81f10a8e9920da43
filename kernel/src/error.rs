//! Kernel error types.
//!
//! Every fallible kernel path returns a [`KernelError`] instead of a bare
//! string or sentinel integer. Allocators and the VMM surface errors to
//! their callers and never halt; see the interrupt module for the one
//! place (CPU exceptions) where the kernel stops instead.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical or heap memory exhausted
    OutOfMemory { requested: usize },
    /// Virtual address has no mapping
    NotMapped { addr: u64 },
    /// A frame was released twice
    DoubleFree { addr: u64 },
    /// Generic bad-argument error
    InvalidArgument { name: &'static str },
    /// A fixed-size table (tasks, processes, regions) is full
    ResourceExhausted { resource: &'static str },
    /// Subsystem initialised more than once
    AlreadyExists { resource: &'static str },
    NotFound { resource: &'static str, id: u64 },
    /// Subsystem used before its `init()` ran
    NotInitialized { subsystem: &'static str },
    /// Device probed at init and not present; subsystem marked unavailable
    HardwareAbsent { device: &'static str },
}

/// Convenience result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::NotMapped { addr } => {
                write!(f, "virtual address {:#x} is not mapped", addr)
            }
            KernelError::DoubleFree { addr } => {
                write!(f, "frame {:#x} freed twice", addr)
            }
            KernelError::InvalidArgument { name } => {
                write!(f, "invalid argument: {}", name)
            }
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            KernelError::AlreadyExists { resource } => {
                write!(f, "already initialized: {}", resource)
            }
            KernelError::NotFound { resource, id } => {
                write!(f, "{} {} not found", resource, id)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} used before init", subsystem)
            }
            KernelError::HardwareAbsent { device } => {
                write!(f, "{} not present", device)
            }
        }
    }
}
