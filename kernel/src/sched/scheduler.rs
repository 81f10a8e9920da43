//! The scheduler proper: task table, round-robin selection, and the
//! switch into the next task.
//!
//! Slot 0 is the boot CPU itself, doubling as the idle task: when no
//! other task is `Ready`, execution falls back to it and it `hlt`s until
//! the next interrupt. Preemption happens only at the tail of the timer
//! interrupt (after the EOI); cooperative suspension points are
//! [`yield_now`] and [`sleep`]. Mutual exclusion on the table is a
//! spinlock taken with interrupts disabled -- the lock is always dropped
//! before the context switch, because the task switched to will itself
//! take it.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::task::{Task, TaskId, TaskState};
use crate::error::{KernelError, KernelResult};

/// Fixed size of the task table.
pub const MAX_TASKS: usize = 64;

/// Kernel stack handed to each task.
pub const TASK_STACK_SIZE: usize = 64 * 1024;

/// Base of the per-task stack area; each slot gets a 1 MiB stride so the
/// gap between stacks stays unmapped and overflows fault loudly.
const TASK_STACK_REGION: u64 = 0xFFFF_8800_0000_0000;
const TASK_STACK_STRIDE: u64 = 0x10_0000;

/// Slot of the idle/boot task.
const IDLE_SLOT: usize = 0;

struct TaskTable {
    tasks: [Option<Task>; MAX_TASKS],
    current: usize,
    /// Tick count when sleepers were last accounted, so the decrement is
    /// driven by elapsed timer ticks rather than by how often schedule()
    /// happens to run.
    last_accounting: u64,
}

impl TaskTable {
    const fn new() -> Self {
        Self {
            tasks: [const { None }; MAX_TASKS],
            current: IDLE_SLOT,
            last_accounting: 0,
        }
    }
}

static SCHEDULER: Mutex<TaskTable> = Mutex::new(TaskTable::new());
static INITIALIZED: AtomicBool = AtomicBool::new(false);

// ---------------------------------------------------------------------------
// Pure table logic (exercised directly by the unit tests)
// ---------------------------------------------------------------------------

/// Decrement the remaining sleep of every `Sleeping` task by `elapsed`
/// ticks and promote those that reach zero.
fn account_sleepers(tasks: &mut [Option<Task>], elapsed: u64) {
    if elapsed == 0 {
        return;
    }
    for slot in tasks.iter_mut() {
        if let Some(task) = slot {
            if task.state == TaskState::Sleeping {
                task.sleep_ticks = task.sleep_ticks.saturating_sub(elapsed);
                if task.sleep_ticks == 0 {
                    task.state = TaskState::Ready;
                }
            }
        }
    }
}

/// Circular scan for the next `Ready` task, starting after `current`.
/// Insertion order is the tie-break; `current` itself is considered last.
fn pick_next(tasks: &[Option<Task>], current: usize) -> Option<usize> {
    for offset in 1..=tasks.len() {
        let slot = (current + offset) % tasks.len();
        if slot == IDLE_SLOT {
            // The idle task only runs when nothing else can.
            continue;
        }
        if let Some(task) = &tasks[slot] {
            if task.state == TaskState::Ready {
                return Some(slot);
            }
        }
    }
    None
}

/// Bring the table's clock up to `now`: charge the elapsed ticks to the
/// running task and decrement the sleepers once.
///
/// Every path that changes sleep state must settle first -- `sleep()`
/// settles before marking its caller `Sleeping`, so ticks that elapsed
/// while the task was still running are never charged against the
/// interval it just asked for.
fn settle_clock(table: &mut TaskTable, now: u64) {
    let elapsed = now.wrapping_sub(table.last_accounting);
    if elapsed == 0 {
        return;
    }
    table.last_accounting = now;
    account_sleepers(&mut table.tasks, elapsed);

    let current = table.current;
    if let Some(task) = table.tasks[current].as_mut() {
        task.ticks = task.ticks.wrapping_add(elapsed);
    }
}

/// First slot that can hold a new task (empty or finished).
fn find_free_slot(tasks: &[Option<Task>]) -> Option<usize> {
    tasks.iter().enumerate().skip(1).find_map(|(i, slot)| match slot {
        None => Some(i),
        Some(task) if task.state == TaskState::Zombie => Some(i),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Install the boot CPU as the idle task (slot 0).
pub fn init() -> KernelResult<()> {
    let mut table = SCHEDULER.lock();
    if INITIALIZED.load(Ordering::Acquire) {
        return Err(KernelError::AlreadyExists { resource: "scheduler" });
    }
    table.tasks[IDLE_SLOT] = Some(Task::boot_task(TaskId(IDLE_SLOT as u32)));
    table.current = IDLE_SLOT;
    INITIALIZED.store(true, Ordering::Release);
    log::info!("scheduler: table of {} slots, idle task installed", MAX_TASKS);
    Ok(())
}

/// Create a kernel task that starts at `entry`.
///
/// Allocates a slot, maps a 64 KiB kernel stack, and seeds the context so
/// the first dispatch lands in the task trampoline with `entry` as its
/// argument and RFLAGS 0x202.
pub fn spawn(entry: fn()) -> KernelResult<TaskId> {
    let _guard = crate::arch::x86_64::interrupt_guard();
    let mut table = SCHEDULER.lock();
    if !INITIALIZED.load(Ordering::Acquire) {
        return Err(KernelError::NotInitialized { subsystem: "scheduler" });
    }

    let slot = find_free_slot(&table.tasks).ok_or(KernelError::ResourceExhausted {
        resource: "task slots",
    })?;

    let stack_top = TASK_STACK_REGION + (slot as u64 + 1) * TASK_STACK_STRIDE;
    map_task_stack(stack_top)?;

    let mut task = Task::new(TaskId(slot as u32), task_trampoline as usize as u64, stack_top);
    // The trampoline receives the task body as its first argument.
    task.context.rdi = entry as usize as u64;
    table.tasks[slot] = Some(task);

    log::debug!("scheduler: task {} spawned, stack top {:#x}", slot, stack_top);
    Ok(TaskId(slot as u32))
}

/// Map the pages backing one task stack.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn map_task_stack(stack_top: u64) -> KernelResult<()> {
    use crate::mm::{pmm, vmm, PageFlags, VirtualAddress, PAGE_SIZE};

    let base = stack_top - TASK_STACK_SIZE as u64;
    for offset in (0..TASK_STACK_SIZE).step_by(PAGE_SIZE) {
        let vaddr = VirtualAddress::new(base + offset as u64);
        // A slot that held an earlier task keeps its stack mapping; reuse
        // it instead of leaking the old frames.
        if vmm::translate(vaddr).is_some() {
            continue;
        }
        let frame = pmm::alloc_frame().ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
        vmm::map_page(vaddr, frame, PageFlags::KERNEL_DATA)?;
    }
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn map_task_stack(_stack_top: u64) -> KernelResult<()> {
    Ok(())
}

/// First instruction of every kernel task. Entered by the context switch
/// with the task body in the first argument register; runs it, then
/// retires the task.
extern "C" fn task_trampoline(entry: fn()) -> ! {
    entry();
    exit_current();
}

/// Mark the current task finished and pick another. The slot becomes
/// reusable; its stack mapping stays in place and is recycled by the next
/// task spawned into the slot.
pub fn exit_current() -> ! {
    {
        let _guard = crate::arch::x86_64::interrupt_guard();
        let mut table = SCHEDULER.lock();
        let current = table.current;
        if let Some(task) = table.tasks[current].as_mut() {
            task.state = TaskState::Zombie;
        }
    }
    schedule();
    // A Zombie is never dispatched again; if no other task exists either,
    // idle until the timer takes us away.
    loop {
        crate::arch::x86_64::idle();
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    schedule();
}

/// Put the current task to sleep for at least `ticks` timer ticks.
pub fn sleep(ticks: u64) {
    if ticks == 0 {
        return yield_now();
    }
    {
        let _guard = crate::arch::x86_64::interrupt_guard();
        let mut table = SCHEDULER.lock();
        let current = table.current;
        if current == IDLE_SLOT {
            // The idle task must stay dispatchable.
            return;
        }
        // Settle outstanding run time first; otherwise the accounting pass
        // in schedule() would subtract it from the interval set below.
        settle_clock(&mut table, crate::timer::ticks());
        if let Some(task) = table.tasks[current].as_mut() {
            task.state = TaskState::Sleeping;
            task.sleep_ticks = ticks;
        }
    }
    schedule();
}

/// Timer-driven preemption entry, called at the tail of the tick
/// interrupt after the EOI.
pub fn preempt() {
    if INITIALIZED.load(Ordering::Acquire) {
        schedule();
    }
}

/// The currently running task.
pub fn current_id() -> Option<TaskId> {
    if !INITIALIZED.load(Ordering::Acquire) {
        return None;
    }
    // The timer interrupt takes the same lock; holding it with interrupts
    // enabled would deadlock against preemption on this single CPU.
    let _guard = crate::arch::x86_64::interrupt_guard();
    let table = SCHEDULER.lock();
    table.tasks[table.current].as_ref().map(|t| t.id)
}

/// Pick the next runnable task and switch to it.
///
/// Sleep accounting is driven by the tick counter: each pass decrements
/// sleepers by the ticks elapsed since the previous settle, so a storm of
/// voluntary yields cannot wake a sleeper early, and a task entering
/// sleep is never charged for ticks it spent running (sleep() settles
/// before marking itself `Sleeping`).
pub fn schedule() {
    let _guard = crate::arch::x86_64::interrupt_guard();

    let (old_ctx, new_ctx) = {
        let mut table = SCHEDULER.lock();
        if !INITIALIZED.load(Ordering::Acquire) {
            return;
        }

        settle_clock(&mut table, crate::timer::ticks());

        let current = table.current;
        let next = pick_next(&table.tasks, current).unwrap_or(IDLE_SLOT);
        if next == current {
            return;
        }

        // Outgoing Running -> Ready; Sleeping/Zombie were already set by
        // sleep()/exit_current().
        if let Some(task) = table.tasks[current].as_mut() {
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }

        let next_task = match table.tasks[next].as_mut() {
            Some(task) => task,
            None => return,
        };
        next_task.state = TaskState::Running;
        let new_ctx: *const _ = &next_task.context;

        table.current = next;

        let old_ctx: *mut _ = match table.tasks[current].as_mut() {
            Some(task) => &mut task.context,
            None => return,
        };

        (old_ctx, new_ctx)
    };

    // The lock is released; the pointers stay valid because table slots
    // are never moved and a context being switched into is never freed.
    //
    // SAFETY: interrupts are disabled (guard above), old_ctx/new_ctx
    // reference live Task contexts, and new_ctx holds a resumable state.
    unsafe {
        crate::arch::x86_64::context::context_switch(old_ctx, new_ctx);
    }
}

/// Enter the idle loop on the boot CPU. The timer interrupt takes it from
/// here.
pub fn run() -> ! {
    log::info!("scheduler: entering idle loop");
    loop {
        crate::arch::x86_64::idle();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn table_with(states: &[(usize, TaskState, u64)]) -> [Option<Task>; MAX_TASKS] {
        let mut tasks = [const { None }; MAX_TASKS];
        tasks[IDLE_SLOT] = Some(Task::boot_task(TaskId(0)));
        for &(slot, state, sleep_ticks) in states {
            let mut task = Task::new(TaskId(slot as u32), 0x1000, 0x2000);
            task.state = state;
            task.sleep_ticks = sleep_ticks;
            tasks[slot] = Some(task);
        }
        tasks
    }

    #[test]
    fn test_pick_next_is_round_robin() {
        let tasks = table_with(&[
            (1, TaskState::Ready, 0),
            (2, TaskState::Ready, 0),
            (3, TaskState::Ready, 0),
        ]);

        // The scan starts after the current slot and wraps.
        assert_eq!(pick_next(&tasks, 1), Some(2));
        assert_eq!(pick_next(&tasks, 2), Some(3));
        assert_eq!(pick_next(&tasks, 3), Some(1));
        assert_eq!(pick_next(&tasks, IDLE_SLOT), Some(1));
    }

    #[test]
    fn test_pick_next_skips_non_ready() {
        let tasks = table_with(&[
            (1, TaskState::Sleeping, 10),
            (2, TaskState::Blocked, 0),
            (3, TaskState::Ready, 0),
            (4, TaskState::Zombie, 0),
        ]);
        assert_eq!(pick_next(&tasks, IDLE_SLOT), Some(3));
    }

    #[test]
    fn test_pick_next_falls_back_to_none_when_nothing_ready() {
        let tasks = table_with(&[(1, TaskState::Sleeping, 5)]);
        assert_eq!(pick_next(&tasks, 1), None);
    }

    #[test]
    fn test_round_robin_fairness_over_many_rounds() {
        let tasks = table_with(&[
            (1, TaskState::Ready, 0),
            (2, TaskState::Ready, 0),
            (3, TaskState::Ready, 0),
        ]);

        let mut runs = [0usize; 4];
        let mut current = IDLE_SLOT;
        for _ in 0..300 {
            let next = pick_next(&tasks, current).unwrap();
            runs[next] += 1;
            current = next;
        }
        assert_eq!(runs[1], 100);
        assert_eq!(runs[2], 100);
        assert_eq!(runs[3], 100);
    }

    #[test]
    fn test_sleep_accounting_promotes_at_zero() {
        let mut tasks = table_with(&[(1, TaskState::Sleeping, 10), (2, TaskState::Sleeping, 5)]);

        account_sleepers(&mut tasks, 4);
        assert_eq!(tasks[1].as_ref().unwrap().state, TaskState::Sleeping);
        assert_eq!(tasks[2].as_ref().unwrap().state, TaskState::Sleeping);

        // The shorter sleeper wakes strictly first.
        account_sleepers(&mut tasks, 1);
        assert_eq!(tasks[1].as_ref().unwrap().state, TaskState::Sleeping);
        assert_eq!(tasks[2].as_ref().unwrap().state, TaskState::Ready);

        account_sleepers(&mut tasks, 5);
        assert_eq!(tasks[1].as_ref().unwrap().state, TaskState::Ready);
    }

    #[test]
    fn test_sleep_accounting_saturates() {
        let mut tasks = table_with(&[(1, TaskState::Sleeping, 3)]);
        // A large elapsed delta must not underflow.
        account_sleepers(&mut tasks, 1000);
        let task = tasks[1].as_ref().unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.sleep_ticks, 0);
    }

    #[test]
    fn test_zero_elapsed_changes_nothing() {
        let mut tasks = table_with(&[(1, TaskState::Sleeping, 1)]);
        account_sleepers(&mut tasks, 0);
        assert_eq!(tasks[1].as_ref().unwrap().state, TaskState::Sleeping);
    }

    #[test]
    fn test_sleep_entry_is_not_charged_for_prior_run_time() {
        // A task runs from tick 100 to tick 103 and then asks to sleep
        // for 10 ticks. The ticks it spent running must not shorten the
        // interval: the earliest wake-up is tick 113.
        let mut table = TaskTable {
            tasks: table_with(&[(1, TaskState::Running, 0)]),
            current: 1,
            last_accounting: 100,
        };

        // sleep() settles before marking the caller Sleeping...
        settle_clock(&mut table, 103);
        {
            let task = table.tasks[1].as_mut().unwrap();
            task.state = TaskState::Sleeping;
            task.sleep_ticks = 10;
        }
        // ...so the immediate schedule() pass finds nothing elapsed.
        settle_clock(&mut table, 103);
        assert_eq!(table.tasks[1].as_ref().unwrap().sleep_ticks, 10);

        // Quantum boundary at tick 110: three ticks still to go.
        settle_clock(&mut table, 110);
        let task = table.tasks[1].as_ref().unwrap();
        assert_eq!(task.state, TaskState::Sleeping);
        assert_eq!(task.sleep_ticks, 3);

        // Only at tick 113 -- ten ticks after entry -- does it wake.
        settle_clock(&mut table, 113);
        assert_eq!(table.tasks[1].as_ref().unwrap().state, TaskState::Ready);
    }

    #[test]
    fn test_settle_clock_charges_the_running_task() {
        let mut table = TaskTable {
            tasks: table_with(&[(1, TaskState::Running, 0)]),
            current: 1,
            last_accounting: 50,
        };

        settle_clock(&mut table, 57);
        assert_eq!(table.tasks[1].as_ref().unwrap().ticks, 7);
        // A second settle at the same tick is a no-op.
        settle_clock(&mut table, 57);
        assert_eq!(table.tasks[1].as_ref().unwrap().ticks, 7);
        assert_eq!(table.last_accounting, 57);
    }

    #[test]
    fn test_free_slot_reuses_zombies_but_not_idle() {
        let tasks = table_with(&[(1, TaskState::Zombie, 0), (2, TaskState::Ready, 0)]);
        assert_eq!(find_free_slot(&tasks), Some(1));

        let full = table_with(&[]);
        // Slot 0 is the idle task and never handed out.
        assert_eq!(find_free_slot(&full), Some(1));
    }
}
