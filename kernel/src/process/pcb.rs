//! Process control block.

extern crate alloc;
use alloc::string::String;

use crate::{arch::x86_64::context::Context, mm::PhysicalAddress};

/// Process identifier: the slot index in the process table.
pub type Pid = u32;

/// Process lifecycle states. A `Terminated` slot may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Everything the kernel tracks about one process.
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    /// Root of the address space this process runs in. All processes
    /// currently share the kernel PML4; a loaded ELF image would get its
    /// own.
    pub page_table_root: PhysicalAddress,
    pub user_stack_top: u64,
    pub kernel_stack_top: u64,
    /// Initial register state; CS/SS select Ring 0 or Ring 3.
    pub context: Context,
    pub entry: u64,
    /// Per-process heap window (reserved, mapped on demand by exec).
    pub heap_start: u64,
    pub heap_end: u64,
    pub heap_max: u64,
    pub name: String,
    pub parent_pid: Pid,
    pub child_count: u32,
}

impl Process {
    /// True while the slot may not be recycled.
    pub fn is_live(&self) -> bool {
        self.state != ProcessState::Terminated
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_terminated_process_is_not_live() {
        let mut process = Process {
            pid: 1,
            state: ProcessState::Ready,
            page_table_root: PhysicalAddress::new(0x1000),
            user_stack_top: 0,
            kernel_stack_top: 0xFFFF_8900_0010_0000,
            context: Context::kernel(0x1000, 0xFFFF_8900_0010_0000),
            entry: 0x1000,
            heap_start: 0,
            heap_end: 0,
            heap_max: 0,
            name: "proc".to_string(),
            parent_pid: 0,
            child_count: 0,
        };
        assert!(process.is_live());
        process.state = ProcessState::Terminated;
        assert!(!process.is_live());
    }
}
