//! Fixed-slot process table.
//!
//! PID 0 is the kernel root process installed at init; every other slot
//! is handed out by [`spawn_kernel`]/[`spawn_user`] and recycled after
//! [`exit`]. Stack regions are carved out of dedicated higher-half
//! windows per slot; user stacks live in low canonical memory and are
//! mapped with the `USER` flag.

extern crate alloc;
use alloc::string::{String, ToString};

use spin::Mutex;

use super::pcb::{Pid, Process, ProcessState};
use crate::{
    arch::x86_64::context::Context,
    error::{KernelError, KernelResult},
    mm::PhysicalAddress,
};

/// Fixed size of the process table.
pub const MAX_PROCESSES: usize = 64;

/// Kernel stack handed to each process.
const KERNEL_STACK_SIZE: usize = 8 * 1024;
/// User stack handed to each user-mode process.
const USER_STACK_SIZE: usize = 8 * 1024;

/// Per-slot kernel stack window (1 MiB stride keeps guard gaps).
const KERNEL_STACK_REGION: u64 = 0xFFFF_8900_0000_0000;
const KERNEL_STACK_STRIDE: u64 = 0x10_0000;

/// Per-slot user stack window in low canonical space.
const USER_STACK_REGION: u64 = 0x1_0000_0000;
const USER_STACK_STRIDE: u64 = 0x10_0000;

/// Per-process heap window, reserved but not mapped at creation.
const PROCESS_HEAP_REGION: u64 = 0x2_0000_0000;
const PROCESS_HEAP_STRIDE: u64 = 0x1000_0000;

struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
    current: Pid,
    initialized: bool,
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            current: 0,
            initialized: false,
        }
    }

    fn init(&mut self, root_page_table: PhysicalAddress) -> KernelResult<()> {
        if self.initialized {
            return Err(KernelError::AlreadyExists {
                resource: "process table",
            });
        }
        self.slots[0] = Some(Process {
            pid: 0,
            state: ProcessState::Running,
            page_table_root: root_page_table,
            user_stack_top: 0,
            kernel_stack_top: 0,
            context: Context::zeroed(),
            entry: 0,
            heap_start: 0,
            heap_end: 0,
            heap_max: 0,
            name: "kernel".to_string(),
            parent_pid: 0,
            child_count: 0,
        });
        self.current = 0;
        self.initialized = true;
        Ok(())
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().enumerate().skip(1).find_map(|(i, slot)| match slot {
            None => Some(i),
            Some(p) if !p.is_live() => Some(i),
            _ => None,
        })
    }

    fn create(
        &mut self,
        entry: u64,
        name: String,
        user_mode: bool,
        page_table_root: PhysicalAddress,
    ) -> KernelResult<Pid> {
        if !self.initialized {
            return Err(KernelError::NotInitialized {
                subsystem: "process table",
            });
        }
        let slot = self.find_free_slot().ok_or(KernelError::ResourceExhausted {
            resource: "process slots",
        })?;
        let pid = slot as Pid;

        let kernel_stack_top = KERNEL_STACK_REGION + (pid as u64 + 1) * KERNEL_STACK_STRIDE;
        let user_stack_top = if user_mode {
            USER_STACK_REGION + (pid as u64 + 1) * USER_STACK_STRIDE
        } else {
            0
        };

        let context = if user_mode {
            Context::user(entry, user_stack_top)
        } else {
            Context::kernel(entry, kernel_stack_top)
        };

        let heap_start = PROCESS_HEAP_REGION + pid as u64 * PROCESS_HEAP_STRIDE;

        self.slots[slot] = Some(Process {
            pid,
            state: ProcessState::Ready,
            page_table_root,
            user_stack_top,
            kernel_stack_top,
            context,
            entry,
            heap_start,
            heap_end: heap_start,
            heap_max: heap_start + PROCESS_HEAP_STRIDE,
            name,
            parent_pid: self.current,
            child_count: 0,
        });

        // Parent book-keeping.
        let parent = self.current as usize;
        if let Some(parent) = self.slots[parent].as_mut() {
            parent.child_count += 1;
        }

        Ok(pid)
    }

    fn exit(&mut self, pid: Pid) -> KernelResult<()> {
        let slot = pid as usize;
        if slot == 0 || slot >= MAX_PROCESSES {
            return Err(KernelError::InvalidArgument { name: "pid" });
        }
        let parent_pid = match self.slots[slot].as_mut() {
            Some(p) if p.is_live() => {
                p.state = ProcessState::Terminated;
                p.parent_pid
            }
            _ => {
                return Err(KernelError::NotFound {
                    resource: "process",
                    id: pid as u64,
                })
            }
        };

        if let Some(parent) = self.slots[parent_pid as usize].as_mut() {
            parent.child_count = parent.child_count.saturating_sub(1);
        }
        Ok(())
    }

    fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots
            .get(pid as usize)
            .and_then(|slot| slot.as_ref())
            .filter(|p| p.is_live())
    }
}

static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// Install the kernel root process (PID 0).
pub fn init() -> KernelResult<()> {
    let root = current_page_table_root();
    PROCESS_TABLE.lock().init(root)?;
    log::info!("process table: {} slots, kernel is PID 0", MAX_PROCESSES);
    Ok(())
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn current_page_table_root() -> PhysicalAddress {
    crate::arch::x86_64::mmu::read_cr3()
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn current_page_table_root() -> PhysicalAddress {
    PhysicalAddress::new(0)
}

/// Create a kernel-mode process entering at `entry`.
pub fn spawn_kernel(entry: fn(), name: &str) -> KernelResult<Pid> {
    spawn(entry as usize as u64, name, false)
}

/// Create a user-mode process entering at `entry` (Ring 3 selectors, user
/// stack mapped with the `USER` flag).
pub fn spawn_user(entry: u64, name: &str) -> KernelResult<Pid> {
    spawn(entry, name, true)
}

fn spawn(entry: u64, name: &str, user_mode: bool) -> KernelResult<Pid> {
    let root = current_page_table_root();
    let pid = PROCESS_TABLE
        .lock()
        .create(entry, name.to_string(), user_mode, root)?;

    if let Err(e) = map_process_stacks(pid, user_mode) {
        let _ = PROCESS_TABLE.lock().exit(pid);
        return Err(e);
    }

    log::debug!("process {} ({}) created", pid, name);
    Ok(pid)
}

/// Terminate a process: the slot becomes reusable, the parent loses a
/// child, and the stack pages go back to the PMM.
pub fn exit(pid: Pid) -> KernelResult<()> {
    let (kernel_stack_top, user_stack_top) = {
        let table = PROCESS_TABLE.lock();
        match table.get(pid) {
            Some(p) => (p.kernel_stack_top, p.user_stack_top),
            None => {
                return Err(KernelError::NotFound {
                    resource: "process",
                    id: pid as u64,
                })
            }
        }
    };

    PROCESS_TABLE.lock().exit(pid)?;
    unmap_stack(kernel_stack_top, KERNEL_STACK_SIZE);
    if user_stack_top != 0 {
        unmap_stack(user_stack_top, USER_STACK_SIZE);
    }
    log::debug!("process {} terminated", pid);
    Ok(())
}

/// PID of the process the kernel currently attributes work to.
pub fn current_pid() -> Pid {
    PROCESS_TABLE.lock().current
}

/// Name of a live process.
pub fn get_name(pid: Pid) -> Option<String> {
    PROCESS_TABLE.lock().get(pid).map(|p| p.name.clone())
}

/// Parent and child-count snapshot, mainly for diagnostics.
pub fn family_of(pid: Pid) -> Option<(Pid, u32)> {
    PROCESS_TABLE
        .lock()
        .get(pid)
        .map(|p| (p.parent_pid, p.child_count))
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn map_process_stacks(pid: Pid, user_mode: bool) -> KernelResult<()> {
    use crate::mm::{pmm, vmm, PageFlags, VirtualAddress, PAGE_SIZE};

    let mut map_range = |top: u64, size: usize, flags: PageFlags| -> KernelResult<()> {
        let base = top - size as u64;
        for offset in (0..size).step_by(PAGE_SIZE) {
            let vaddr = VirtualAddress::new(base + offset as u64);
            if vmm::translate(vaddr).is_some() {
                continue;
            }
            let frame = pmm::alloc_frame().ok_or(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
            })?;
            vmm::map_page(vaddr, frame, flags)?;
        }
        Ok(())
    };

    let kernel_stack_top = KERNEL_STACK_REGION + (pid as u64 + 1) * KERNEL_STACK_STRIDE;
    map_range(kernel_stack_top, KERNEL_STACK_SIZE, PageFlags::KERNEL_DATA)?;

    if user_mode {
        let user_stack_top = USER_STACK_REGION + (pid as u64 + 1) * USER_STACK_STRIDE;
        map_range(
            user_stack_top,
            USER_STACK_SIZE,
            PageFlags::KERNEL_DATA | PageFlags::USER,
        )?;
    }
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn map_process_stacks(_pid: Pid, _user_mode: bool) -> KernelResult<()> {
    Ok(())
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn unmap_stack(top: u64, size: usize) {
    use crate::mm::{pmm, vmm, VirtualAddress, PAGE_SIZE};

    let base = top - size as u64;
    for offset in (0..size).step_by(PAGE_SIZE) {
        if let Ok(frame) = vmm::unmap_page(VirtualAddress::new(base + offset as u64)) {
            let _ = pmm::free_frame(frame);
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn unmap_stack(_top: u64, _size: usize) {}
