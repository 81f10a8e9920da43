//! Device drivers outside the memory/interrupt/scheduling core.

pub mod keyboard;
