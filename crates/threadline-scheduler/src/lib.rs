//! # Threadline Scheduler
//!
//! Event-driven scheduler: maintains a single armed tick job sized to fire
//! at the earliest due post, sweeps due posts onto the publish queue in
//! batches, and advances recurring schedules.

pub mod recurrence;
pub mod scheduler;
pub mod state;

pub use recurrence::next_occurrence;
pub use scheduler::EventScheduler;
pub use state::SchedulerState;
