//! Process table and syscall dispatch integration tests.
//!
//! The scheduler is deliberately left uninitialised here so the yield and
//! sleep syscalls degrade to no-ops instead of switching contexts.

use cinder_kernel::process;
use cinder_kernel::syscall::{self, SYS_CLOSE, SYS_FORK, SYS_GETPID, SYS_READ, SYS_SLEEP, SYS_WRITE, SYS_YIELD};

fn task_body() {}

#[test]
fn process_tree_and_syscalls_work_together() {
    process::init().unwrap();
    syscall::init().unwrap();
    // Both init paths refuse to run twice.
    assert!(process::init().is_err());
    assert!(syscall::init().is_err());

    // The kernel is PID 0 and the parent of everything spawned at boot.
    assert_eq!(process::current_pid(), 0);
    assert_eq!(syscall::dispatch(SYS_GETPID, 0, 0, 0, 0, 0, 0), 0);

    let a = process::spawn_kernel(task_body, "worker-a").unwrap();
    let b = process::spawn_kernel(task_body, "worker-b").unwrap();
    assert_eq!(process::get_name(a).as_deref(), Some("worker-a"));
    assert_eq!(process::family_of(a), Some((0, 0)));
    assert_eq!(process::family_of(0).map(|f| f.1), Some(2));

    // Exit releases the slot and the parent's child count.
    process::exit(a).unwrap();
    assert!(process::get_name(a).is_none());
    assert_eq!(process::family_of(0).map(|f| f.1), Some(1));
    assert!(process::exit(a).is_err());

    // The freed slot is recycled.
    let c = process::spawn_kernel(task_body, "worker-c").unwrap();
    assert_eq!(c, a);
    assert_ne!(c, b);

    // Dispatch conventions: write to the console succeeds, stubs return
    // their documented values, unknown numbers are -1.
    let msg = b"integration\n";
    assert_eq!(
        syscall::dispatch(SYS_WRITE, 1, msg.as_ptr() as u64, msg.len() as u64, 0, 0, 0),
        msg.len() as i64
    );
    assert_eq!(syscall::dispatch(SYS_READ, 0, 0, 0, 0, 0, 0), -1);
    assert_eq!(syscall::dispatch(SYS_FORK, 0, 0, 0, 0, 0, 0), -1);
    assert_eq!(syscall::dispatch(SYS_CLOSE, 3, 0, 0, 0, 0, 0), 0);
    assert_eq!(syscall::dispatch(SYS_YIELD, 0, 0, 0, 0, 0, 0), 0);
    assert_eq!(syscall::dispatch(SYS_SLEEP, 5, 0, 0, 0, 0, 0), 0);
    assert_eq!(syscall::dispatch(77, 0, 0, 0, 0, 0, 0), -1);
}
