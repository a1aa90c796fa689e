//! Scheduler: priority buckets plus the CLEANUP-driven dispatch loop.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use queue::ReadyQueue;
pub use scheduler::{
    block_current, current, enqueue_ready, remove_ready, schedule, wake, yield_current,
};
pub use task::Priority;

/// Bring up the scheduler: register its `INTERRUPT_CLEANUP` handler.
pub fn init() -> crate::error::KernelResult<()> {
    scheduler::init()
}
