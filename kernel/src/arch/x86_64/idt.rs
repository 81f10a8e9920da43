//! Interrupt Descriptor Table and vector routing.
//!
//! Vectors 0-31 are the CPU exceptions; any that fires is a kernel bug,
//! so the handler logs the canonical mnemonic plus error code and parks
//! the CPU (no recovery). Vectors 32-47 are external IRQs delivered
//! through the LAPIC: 32 is the timer tick, 33 the PS/2 keyboard, and the
//! rest go through a registration table with a log-once default. Every
//! IRQ handler finishes with an EOI write -- a handler that skips it
//! starves all further LAPIC delivery.
//!
//! Gates are installed with the kernel code selector and type 0x8E
//! (present, DPL 0, 64-bit interrupt gate), which is what the
//! `InterruptDescriptorTable` emits for `extern "x86-interrupt"` handlers.

use core::sync::atomic::{AtomicU16, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::error::{KernelError, KernelResult};

/// Timer tick (IRQ 0 via the I/O APIC).
pub const TIMER_VECTOR: u8 = 32;
/// PS/2 keyboard (IRQ 1 via the I/O APIC).
pub const KEYBOARD_VECTOR: u8 = 33;
/// First and last vector of the external IRQ window.
pub const IRQ_BASE: u8 = 32;
pub const IRQ_COUNT: usize = 16;

/// Handlers for IRQ vectors without a dedicated routine, indexed by
/// `vector - IRQ_BASE`. Registered by drivers at init time.
static IRQ_HANDLERS: Mutex<[Option<fn(u8)>; IRQ_COUNT]> = Mutex::new([None; IRQ_COUNT]);

/// One bit per IRQ vector that has already produced an "unhandled" log
/// line, so a chattering line cannot flood the console.
static UNHANDLED_LOGGED: AtomicU16 = AtomicU16::new(0);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // CPU exceptions (0-31).
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        // SAFETY: the double-fault IST slot is set up by gdt::init before
        // the IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        // External IRQs (32-47).
        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);
        idt[KEYBOARD_VECTOR].set_handler_fn(keyboard_interrupt_handler);
        idt[34].set_handler_fn(irq_handler_34);
        idt[35].set_handler_fn(irq_handler_35);
        idt[36].set_handler_fn(irq_handler_36);
        idt[37].set_handler_fn(irq_handler_37);
        idt[38].set_handler_fn(irq_handler_38);
        idt[39].set_handler_fn(irq_handler_39);
        idt[40].set_handler_fn(irq_handler_40);
        idt[41].set_handler_fn(irq_handler_41);
        idt[42].set_handler_fn(irq_handler_42);
        idt[43].set_handler_fn(irq_handler_43);
        idt[44].set_handler_fn(irq_handler_44);
        idt[45].set_handler_fn(irq_handler_45);
        idt[46].set_handler_fn(irq_handler_46);
        idt[47].set_handler_fn(irq_handler_47);

        idt
    };
}

/// Build and load the IDT.
pub fn init() {
    IDT.load();
}

/// Register a handler for an IRQ vector in the 34-47 window. The timer and
/// keyboard vectors have fixed routing and are rejected.
pub fn register_irq_handler(vector: u8, handler: fn(u8)) -> KernelResult<()> {
    if !(IRQ_BASE..IRQ_BASE + IRQ_COUNT as u8).contains(&vector)
        || vector == TIMER_VECTOR
        || vector == KEYBOARD_VECTOR
    {
        return Err(KernelError::InvalidArgument { name: "vector" });
    }
    let slot = (vector - IRQ_BASE) as usize;
    // The handler table is also read from interrupt context.
    let _guard = super::interrupt_guard();
    let mut handlers = IRQ_HANDLERS.lock();
    if handlers[slot].is_some() {
        return Err(KernelError::AlreadyExists {
            resource: "IRQ handler",
        });
    }
    handlers[slot] = Some(handler);
    Ok(())
}

/// Look up and invoke the registered handler for an IRQ vector. Without a
/// registration the vector is logged once and then ignored.
fn route(vector: u8) {
    let slot = (vector - IRQ_BASE) as usize;
    let handler = IRQ_HANDLERS.lock()[slot];
    match handler {
        Some(h) => h(vector),
        None => {
            let bit = 1u16 << slot;
            if UNHANDLED_LOGGED.fetch_or(bit, Ordering::Relaxed) & bit == 0 {
                log::warn!("unhandled interrupt vector {}", vector);
            }
        }
    }
}

/// Log an unrecoverable exception and park the CPU.
fn fatal(mnemonic: &str, error_code: Option<u64>, stack_frame: &InterruptStackFrame) -> ! {
    log::error!("EXCEPTION: {}", mnemonic);
    if let Some(code) = error_code {
        log::error!("error code: {:#x}", code);
    }
    log::error!("{:#?}", stack_frame);
    println!("Exception: {} -- system halted", mnemonic);
    super::halt();
}

// ---------------------------------------------------------------------------
// Exception handlers (0-31)
// ---------------------------------------------------------------------------

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fatal("Division By Zero", None, &stack_frame);
}

extern "x86-interrupt" fn debug_handler(stack_frame: InterruptStackFrame) {
    fatal("Debug", None, &stack_frame);
}

extern "x86-interrupt" fn nmi_handler(stack_frame: InterruptStackFrame) {
    fatal("Non-Maskable Interrupt", None, &stack_frame);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    // int3 is the one recoverable exception: report and resume.
    log::warn!("EXCEPTION: Breakpoint\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn overflow_handler(stack_frame: InterruptStackFrame) {
    fatal("Overflow", None, &stack_frame);
}

extern "x86-interrupt" fn bound_range_handler(stack_frame: InterruptStackFrame) {
    fatal("Bound Range Exceeded", None, &stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fatal("Invalid Opcode", None, &stack_frame);
}

extern "x86-interrupt" fn device_not_available_handler(stack_frame: InterruptStackFrame) {
    fatal("Device Not Available", None, &stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, error_code: u64) -> ! {
    fatal("Double Fault", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn invalid_tss_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    fatal("Invalid TSS", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn segment_not_present_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal("Segment Not Present", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn stack_segment_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    fatal("Stack Fault", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn general_protection_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal("General Protection Fault", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let faulting_addr = super::mmu::read_cr2();
    log::error!(
        "page fault at {:#x} ({:?})",
        faulting_addr.as_u64(),
        error_code
    );
    fatal("Page Fault", Some(error_code.bits()), &stack_frame);
}

extern "x86-interrupt" fn x87_floating_point_handler(stack_frame: InterruptStackFrame) {
    fatal("x87 Floating Point Exception", None, &stack_frame);
}

extern "x86-interrupt" fn alignment_check_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal("Alignment Check", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    fatal("Machine Check", None, &stack_frame);
}

extern "x86-interrupt" fn simd_floating_point_handler(stack_frame: InterruptStackFrame) {
    fatal("SIMD Floating Point Exception", None, &stack_frame);
}

extern "x86-interrupt" fn virtualization_handler(stack_frame: InterruptStackFrame) {
    fatal("Virtualization Exception", None, &stack_frame);
}

// ---------------------------------------------------------------------------
// IRQ handlers (32-47)
// ---------------------------------------------------------------------------

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // Tick accounting, EOI, then (on a quantum boundary) preemption; the
    // context switch must come after the EOI or a descheduled handler
    // would block all further LAPIC delivery.
    crate::timer::on_timer_interrupt();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // The port 0x60 read acknowledges the controller; EOI comes last.
    crate::drivers::keyboard::handle_irq();
    super::apic::send_eoi();
}

macro_rules! generic_irq_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            route($vector);
            super::apic::send_eoi();
        }
    };
}

generic_irq_handler!(irq_handler_34, 34);
generic_irq_handler!(irq_handler_35, 35);
generic_irq_handler!(irq_handler_36, 36);
generic_irq_handler!(irq_handler_37, 37);
generic_irq_handler!(irq_handler_38, 38);
generic_irq_handler!(irq_handler_39, 39);
generic_irq_handler!(irq_handler_40, 40);
generic_irq_handler!(irq_handler_41, 41);
generic_irq_handler!(irq_handler_42, 42);
generic_irq_handler!(irq_handler_43, 43);
generic_irq_handler!(irq_handler_44, 44);
generic_irq_handler!(irq_handler_45, 45);
generic_irq_handler!(irq_handler_46, 46);
generic_irq_handler!(irq_handler_47, 47);
