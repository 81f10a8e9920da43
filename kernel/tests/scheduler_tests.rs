//! Scheduler table integration tests (host build: no context switches,
//! only table state).

use cinder_kernel::sched::{self, TaskId};

fn noop_task() {}

#[test]
fn scheduler_lifecycle_slots_and_ids() {
    sched::init().unwrap();
    // Double init is refused.
    assert!(sched::init().is_err());

    // The boot CPU is the idle task.
    assert_eq!(sched::current_id(), Some(TaskId(0)));

    // Spawned tasks take consecutive slots above the idle task.
    let a = sched::spawn(noop_task).unwrap();
    let b = sched::spawn(noop_task).unwrap();
    assert_eq!(a, TaskId(1));
    assert_eq!(b, TaskId(2));

    // The table is bounded: fill it up and watch it refuse.
    let mut spawned = 2;
    while sched::spawn(noop_task).is_ok() {
        spawned += 1;
    }
    assert_eq!(spawned, sched::MAX_TASKS - 1, "every slot but idle is usable");
}
