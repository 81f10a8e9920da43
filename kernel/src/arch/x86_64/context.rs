//! Task register context and the context switch.
//!
//! `Context` is the saved architectural state of a task: all general
//! purpose registers, RSP/RIP/RFLAGS, and the segment selectors. The
//! layout is `repr(C)` with fixed offsets because `context_switch` reaches
//! into it from assembly; the unit tests pin the offsets.
//!
//! FPU/SSE state is deliberately not part of the context.

use core::arch::naked_asm;

/// Offsets used by the assembly below. Keep in sync with `Context`.
const _: () = {
    assert!(core::mem::offset_of!(Context, r15) == 0x00);
    assert!(core::mem::offset_of!(Context, rdi) == 0x40);
    assert!(core::mem::offset_of!(Context, rsi) == 0x48);
    assert!(core::mem::offset_of!(Context, rax) == 0x70);
    assert!(core::mem::offset_of!(Context, rsp) == 0x78);
    assert!(core::mem::offset_of!(Context, rip) == 0x80);
    assert!(core::mem::offset_of!(Context, rflags) == 0x88);
    assert!(core::mem::offset_of!(Context, ds) == 0xA0);
    assert!(core::mem::offset_of!(Context, es) == 0xA8);
};

/// Saved CPU state of a task.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// RFLAGS for a fresh task: IF set plus the always-one reserved bit.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Kernel segment selectors (GDT indices 1 and 2).
pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_DS: u64 = 0x10;
/// User segment selectors with RPL 3 (GDT indices 3 and 4).
pub const USER_CS: u64 = 0x1B;
pub const USER_DS: u64 = 0x23;

impl Context {
    /// An all-zero context. Used for slots whose state is filled in on the
    /// first switch away from them (the boot CPU / idle task).
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rsp: 0,
            rip: 0,
            rflags: INITIAL_RFLAGS,
            cs: KERNEL_CS,
            ss: KERNEL_DS,
            ds: KERNEL_DS,
            es: KERNEL_DS,
            fs: 0,
            gs: 0,
        }
    }

    /// Context for a new kernel task starting at `entry` on `stack_top`.
    ///
    /// RSP is dropped by one slot so the entry function sees the stack
    /// alignment of an ordinary `call`.
    pub fn kernel(entry: u64, stack_top: u64) -> Self {
        Self {
            rsp: stack_top - 8,
            rip: entry,
            ..Self::zeroed()
        }
    }

    /// Context for a user-mode process entry: Ring 3 selectors, RSP at the
    /// top of the user stack.
    pub fn user(entry: u64, user_stack_top: u64) -> Self {
        Self {
            rsp: user_stack_top,
            rip: entry,
            cs: USER_CS,
            ss: USER_DS,
            ds: USER_DS,
            es: USER_DS,
            ..Self::zeroed()
        }
    }
}

/// Switch from `current` to `next`.
///
/// Saves every GPR, RSP (as it will be after this call returns), the
/// return address as the resume RIP, and RFLAGS into `current`; then
/// restores DS/ES, the GPRs, RFLAGS and stack from `next` and `ret`s onto
/// its resume RIP. The outgoing task continues here when it is next
/// dispatched.
///
/// # Safety
///
/// Both pointers must reference valid `Context` values, `next` must hold a
/// resumable state (a prior save or a fresh `Context::kernel`), and the
/// caller must have interrupts disabled: the incoming RFLAGS decide when
/// they come back on.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(current: *mut Context, next: *const Context) {
    naked_asm!(
        // Save outgoing state (rdi = current).
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rdi",
        "mov [rdi + 0x48], rsi",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x58], rbx",
        "mov [rdi + 0x60], rdx",
        "mov [rdi + 0x68], rcx",
        "mov [rdi + 0x70], rax",
        // RSP as it will be once this call has returned.
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x78], rax",
        // Resume point = our return address.
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        // Load incoming state (rsi = next).
        "mov rsp, [rsi + 0x78]",
        "push qword ptr [rsi + 0x80]",
        // Data segments before rax is finally restored.
        "mov rax, [rsi + 0xA0]",
        "mov ds, ax",
        "mov rax, [rsi + 0xA8]",
        "mov es, ax",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r11, [rsi + 0x20]",
        "mov r10, [rsi + 0x28]",
        "mov r9,  [rsi + 0x30]",
        "mov r8,  [rsi + 0x38]",
        "mov rdi, [rsi + 0x40]",
        "mov rbp, [rsi + 0x50]",
        "mov rbx, [rsi + 0x58]",
        "mov rdx, [rsi + 0x60]",
        "mov rcx, [rsi + 0x68]",
        "mov rax, [rsi + 0x70]",
        // RFLAGS last-but-one: if it sets IF the window before `ret` is
        // two instructions, with the incoming task's state fully loaded.
        "push qword ptr [rsi + 0x88]",
        "popfq",
        "mov rsi, [rsi + 0x48]",
        "ret",
    );
}
