//! Process layer: identity and resource book-keeping above the scheduler.
//!
//! A process wraps a task with a PID, a name, parent/child accounting,
//! a dedicated kernel stack, and (for user-mode processes) a user stack
//! mapped with the `USER` flag. The slot array is fixed size; a slot is
//! reusable once its process reaches `Terminated`.

pub mod pcb;
pub mod table;

pub use pcb::{Pid, Process, ProcessState};
pub use table::{current_pid, exit, family_of, get_name, init, spawn_kernel, spawn_user, MAX_PROCESSES};
