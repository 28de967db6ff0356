//! Admission scheduling and the daemon's owned state
//!
//! [`QueueCore`] is the one critical section: WAL appends, sequence
//! assignment, and job-table mutation all happen under its lock. The
//! admission loop in [`admission`] turns its decisions into spawned
//! executors.

mod admission;
mod core;

pub use admission::{Collaborators, run_admission_loop, spawn_recovered};
pub use core::{CancelOutcome, QueueCore, QueueError, ShutdownSignal};
