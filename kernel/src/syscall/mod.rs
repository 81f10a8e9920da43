//! System-call dispatcher.
//!
//! A numeric table of handlers, each taking six 64-bit arguments and
//! returning a 64-bit value; slots without a handler return -1. There is
//! no user-mode transport yet -- kernel code invokes [`dispatch`]
//! directly -- but the numbering and calling convention are fixed so an
//! ELF-hosted libc can target them later.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Syscall numbers.
pub const SYS_EXIT: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_READ: u64 = 2;
pub const SYS_OPEN: u64 = 3;
pub const SYS_CLOSE: u64 = 4;
pub const SYS_FORK: u64 = 5;
pub const SYS_EXEC: u64 = 6;
pub const SYS_WAIT: u64 = 7;
pub const SYS_SLEEP: u64 = 8;
pub const SYS_GETPID: u64 = 9;
pub const SYS_YIELD: u64 = 10;

/// Size of the dispatch table.
pub const MAX_SYSCALLS: usize = 128;

/// A syscall handler: six arguments in, one value out. Errors are
/// negative returns, conventionally -1.
pub type SyscallHandler = fn(u64, u64, u64, u64, u64, u64) -> i64;

/// The dispatch table. Kept as its own type so tests can run against a
/// local instance.
pub struct SyscallTable {
    handlers: [Option<SyscallHandler>; MAX_SYSCALLS],
}

impl SyscallTable {
    pub const fn new() -> Self {
        Self {
            handlers: [None; MAX_SYSCALLS],
        }
    }

    /// Install a handler. Replacing an existing registration is an error.
    pub fn register(&mut self, number: u64, handler: SyscallHandler) -> KernelResult<()> {
        let slot = self
            .handlers
            .get_mut(number as usize)
            .ok_or(KernelError::InvalidArgument { name: "syscall number" })?;
        if slot.is_some() {
            return Err(KernelError::AlreadyExists {
                resource: "syscall handler",
            });
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Route a call. Out-of-range numbers and empty slots return -1.
    pub fn dispatch(
        &self,
        number: u64,
        arg1: u64,
        arg2: u64,
        arg3: u64,
        arg4: u64,
        arg5: u64,
        arg6: u64,
    ) -> i64 {
        match self.handlers.get(number as usize).copied().flatten() {
            Some(handler) => handler(arg1, arg2, arg3, arg4, arg5, arg6),
            None => {
                log::warn!("invalid or unregistered syscall {}", number);
                -1
            }
        }
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

static SYSCALL_TABLE: Mutex<SyscallTable> = Mutex::new(SyscallTable::new());

/// Register the core handlers.
pub fn init() -> KernelResult<()> {
    let mut table = SYSCALL_TABLE.lock();
    table.register(SYS_EXIT, sys_exit)?;
    table.register(SYS_WRITE, sys_write)?;
    table.register(SYS_READ, sys_read)?;
    table.register(SYS_OPEN, sys_open)?;
    table.register(SYS_CLOSE, sys_close)?;
    table.register(SYS_FORK, sys_fork)?;
    table.register(SYS_EXEC, sys_exec)?;
    table.register(SYS_WAIT, sys_wait)?;
    table.register(SYS_SLEEP, sys_sleep)?;
    table.register(SYS_GETPID, sys_getpid)?;
    table.register(SYS_YIELD, sys_yield)?;
    log::info!("syscalls: 11 handlers registered");
    Ok(())
}

/// Kernel-side syscall entry point.
pub fn dispatch(number: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> i64 {
    SYSCALL_TABLE.lock().dispatch(number, a1, a2, a3, a4, a5, a6)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn sys_exit(status: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    let pid = crate::process::current_pid();
    log::info!("exit({}) from pid {}", status as i64, pid);
    if pid != 0 {
        let _ = crate::process::exit(pid);
    }
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::sched::scheduler::exit_current();

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    return 0;
}

/// write(fd, buf, count): fd 1 is the console; everything else is an
/// error. The buffer is raw caller memory -- with no user mode yet the
/// callers are kernel tasks and the pointer is trusted to be mapped.
fn sys_write(fd: u64, buf: u64, count: u64, _: u64, _: u64, _: u64) -> i64 {
    if fd != 1 {
        return -1;
    }
    if buf == 0 {
        return -1;
    }
    // SAFETY: see above -- kernel callers pass mapped buffers.
    let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, count as usize) };
    match core::str::from_utf8(bytes) {
        Ok(s) => print!("{}", s),
        Err(_) => {
            for &b in bytes {
                print!("{}", b as char);
            }
        }
    }
    count as i64
}

fn sys_read(_fd: u64, _buf: u64, _count: u64, _: u64, _: u64, _: u64) -> i64 {
    -1
}

fn sys_open(_path: u64, _flags: u64, _mode: u64, _: u64, _: u64, _: u64) -> i64 {
    -1
}

fn sys_close(_fd: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    0
}

fn sys_fork(_: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    -1
}

fn sys_exec(_path: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    -1
}

fn sys_wait(_: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    -1
}

fn sys_sleep(ticks: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    crate::sched::sleep(ticks);
    0
}

fn sys_getpid(_: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    crate::process::current_pid() as i64
}

fn sys_yield(_: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
    crate::sched::yield_now();
    0
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_and_out_of_range_return_minus_one() {
        let table = SyscallTable::new();
        assert_eq!(table.dispatch(SYS_WRITE, 1, 0, 0, 0, 0, 0), -1);
        assert_eq!(table.dispatch(9999, 0, 0, 0, 0, 0, 0), -1);
    }

    #[test]
    fn test_registered_handler_receives_all_arguments() {
        fn sum(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> i64 {
            (a + b + c + d + e + f) as i64
        }

        let mut table = SyscallTable::new();
        table.register(42, sum).unwrap();
        assert_eq!(table.dispatch(42, 1, 2, 3, 4, 5, 6), 21);
    }

    #[test]
    fn test_double_registration_is_rejected() {
        fn nop(_: u64, _: u64, _: u64, _: u64, _: u64, _: u64) -> i64 {
            0
        }

        let mut table = SyscallTable::new();
        table.register(7, nop).unwrap();
        assert!(table.register(7, nop).is_err());
        assert!(table.register(MAX_SYSCALLS as u64, nop).is_err());
    }

    #[test]
    fn test_core_handler_conventions() {
        // The placeholder handlers follow the documented conventions:
        // unimplemented calls return -1, close returns 0.
        assert_eq!(sys_read(0, 0, 0, 0, 0, 0), -1);
        assert_eq!(sys_open(0, 0, 0, 0, 0, 0), -1);
        assert_eq!(sys_fork(0, 0, 0, 0, 0, 0), -1);
        assert_eq!(sys_exec(0, 0, 0, 0, 0, 0), -1);
        assert_eq!(sys_wait(0, 0, 0, 0, 0, 0), -1);
        assert_eq!(sys_close(3, 0, 0, 0, 0, 0), 0);
    }

    #[test]
    fn test_write_validates_fd_and_buffer() {
        assert_eq!(sys_write(2, 0x1000, 4, 0, 0, 0), -1);
        assert_eq!(sys_write(1, 0, 4, 0, 0, 0), -1);

        let msg = b"hello";
        let written = sys_write(1, msg.as_ptr() as u64, msg.len() as u64, 0, 0, 0);
        assert_eq!(written, msg.len() as i64);
    }
}
