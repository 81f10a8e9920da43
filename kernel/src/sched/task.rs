//! Task control block.

use crate::arch::x86_64::context::Context;

/// Task identifier: the slot index in the scheduler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u32);

/// Lifecycle states of a task.
///
/// `Ready -> Running` on dispatch, `Running -> Sleeping` through
/// [`crate::sched::sleep`], `Sleeping -> Ready` when the remaining ticks
/// reach zero, `Running -> Zombie` on exit. Exactly one task is `Running`
/// at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Ready,
    Blocked,
    Sleeping,
    Zombie,
}

/// A kernel task: scheduling metadata plus the saved register context.
///
/// The saved context of the `Running` task is stale by definition; it is
/// rewritten by the context switch when the task is descheduled.
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    /// Stored for future priority scheduling; the round-robin policy
    /// ignores it.
    pub priority: u8,
    /// Total timer ticks this task has been the running task.
    pub ticks: u64,
    /// Ticks left until a `Sleeping` task becomes `Ready` again.
    pub sleep_ticks: u64,
    pub context: Context,
    /// Top of the task's kernel stack (the initial RSP).
    pub stack_top: u64,
}

impl Task {
    /// A fresh `Ready` task entering at `entry` on `stack_top`.
    pub fn new(id: TaskId, entry: u64, stack_top: u64) -> Self {
        Self {
            id,
            state: TaskState::Ready,
            priority: 1,
            ticks: 0,
            sleep_ticks: 0,
            context: Context::kernel(entry, stack_top),
            stack_top,
        }
    }

    /// The slot describing the CPU we booted on: it is already running
    /// and its context gets captured at the first switch away.
    pub fn boot_task(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Running,
            priority: 0,
            ticks: 0,
            sleep_ticks: 0,
            context: Context::zeroed(),
            stack_top: 0,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_ready_with_entry_context() {
        let task = Task::new(TaskId(3), 0x1000, 0xFFFF_8800_0001_0000);
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.context.rip, 0x1000);
        assert_eq!(task.sleep_ticks, 0);
        assert_eq!(task.ticks, 0);
    }

    #[test]
    fn test_boot_task_starts_running() {
        let task = Task::boot_task(TaskId(0));
        assert_eq!(task.state, TaskState::Running);
    }
}
