//! Architecture support. CinderOS targets a single x86-64 machine.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Halt the CPU forever. Used by panic and fatal-exception paths.
#[cfg(target_arch = "x86_64")]
pub fn halt() -> ! {
    x86_64::halt()
}
