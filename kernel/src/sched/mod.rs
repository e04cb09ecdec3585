//! Round-robin preemptive scheduler.

mod scheduler;

pub use scheduler::{context_switch, pick_next, scheduler_tick};
