//! CLEANUP-driven scheduling (spec §4.6).
//!
//! Every trap return posts an `INTERRUPT_CLEANUP` event; draining it runs
//! [`schedule`], which reaps a KILLed current thread, picks the next READY
//! thread, switches address space if the owning process changed, and halts
//! the CPU if nothing is READY.

use spin::Mutex;

use crate::arch::context;
use crate::arch::trap::Origin;
use crate::event::{self, EventType};
use crate::process::pcb::{ProcessContext, ProcessState, ProcessType};
use crate::process::table::PROCESS_TABLE;
use crate::process::thread::{ThreadId, ThreadState, THREAD_TABLE};
use crate::sched::queue::ReadyQueue;
use crate::sched::task::Priority;

struct SchedulerState {
    queue: ReadyQueue,
    current: Option<ThreadId>,
}

impl SchedulerState {
    const fn new() -> Self {
        Self {
            queue: ReadyQueue::new(),
            current: None,
        }
    }
}

static SCHEDULER: Mutex<SchedulerState> = Mutex::new(SchedulerState::new());

/// Register the `INTERRUPT_CLEANUP` handler. Must run once, after
/// [`crate::event::init`].
pub fn init() -> crate::error::KernelResult<()> {
    event::bind(EventType::InterruptCleanup, on_cleanup, false)
}

fn on_cleanup(_event: EventType, _origin: Origin) {
    schedule();
}

/// Mark `tid` READY at `priority`.
pub fn enqueue_ready(tid: ThreadId, priority: Priority) {
    SCHEDULER.lock().queue.enqueue(priority, tid);
}

/// Remove `tid` from the ready queue (it blocked, or was killed before its
/// next dispatch).
pub fn remove_ready(tid: ThreadId, priority: Priority) {
    SCHEDULER.lock().queue.remove(priority, tid);
}

/// The thread presently on the CPU, if any.
pub fn current() -> Option<ThreadId> {
    SCHEDULER.lock().current
}

/// Drop a KILLed thread from its process and the global thread table,
/// freeing its kernel stack (spec §4.6 step 1). Once a USER process's last
/// thread is reaped, also retire the process itself: remove it from
/// `PROCESS_TABLE` and destroy its address-space context (spec §4.6 step 2,
/// "destroy context, retire pid").
fn reap(tid: ThreadId) {
    let owner = THREAD_TABLE.with(tid, |t| (t.process, t.kernel_stack_base));
    let Ok((process_id, kernel_stack_base)) = owner else {
        return;
    };
    let _ = THREAD_TABLE.remove(tid);
    crate::process::thread::free_kernel_stack(kernel_stack_base);

    let last_thread = PROCESS_TABLE
        .with_mut(process_id, |process| {
            process.threads.retain(|t| *t != tid);
            if process.threads.is_empty() && process.kind == ProcessType::User {
                process.state = ProcessState::Kill;
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

    if last_thread {
        if let Ok(process) = PROCESS_TABLE.remove(process_id) {
            if let ProcessContext::User(context) = process.context {
                if let Err(e) = context.destroy() {
                    log::error!("failed to destroy context for pid={}: {e:?}", process_id.0);
                }
            }
        }
    }
}

/// Run one scheduling pass. Called from the `INTERRUPT_CLEANUP` handler on
/// every trap return (spec §4.6 steps 1-6).
pub fn schedule() {
    let mut guard = SCHEDULER.lock();

    if let Some(tid) = guard.current {
        let killed = THREAD_TABLE
            .with(tid, |t| t.state == ThreadState::Kill)
            .unwrap_or(true);
        if killed {
            guard.current = None;
            drop(guard);
            reap(tid);
            guard = SCHEDULER.lock();
        }
    }

    let prev = guard.current;
    let next = match guard.queue.dispatch_next() {
        Some(tid) => tid,
        None => {
            drop(guard);
            crate::arch::wait_for_interrupt();
            return;
        }
    };
    guard.current = Some(next);
    drop(guard);

    if prev != Some(next) {
        if let Some(prev_tid) = prev {
            let _ = THREAD_TABLE.with_mut(prev_tid, |t| {
                if t.state == ThreadState::Active {
                    t.state = ThreadState::Ready;
                }
                // Save the outgoing thread's registers out of the live trap
                // frame before anything overwrites it (spec §4.6 step 5).
                context::save_current(&mut t.context);
            });
        }

        let prev_process = prev.and_then(|tid| THREAD_TABLE.with(tid, |t| t.process).ok());
        let next_process = THREAD_TABLE.with(next, |t| t.process).ok();
        if prev_process != next_process {
            if let Some(pid) = next_process {
                let _ = PROCESS_TABLE.with(pid, |process| process.context().activate());
            }
        }

        // Load the incoming thread's saved registers into the live trap
        // frame, so the pending trap return resumes it (spec §4.6 step 5).
        let _ = THREAD_TABLE.with(next, |t| context::load_current(&t.context));
    }

    let _ = THREAD_TABLE.with_mut(next, |t| t.state = ThreadState::Active);
}

/// Voluntarily give up the CPU: re-enqueue the current thread as READY and
/// force an immediate scheduling pass.
pub fn yield_current() {
    if let Some(tid) = current() {
        if let Ok(priority) = THREAD_TABLE.with(tid, |t| t.priority) {
            enqueue_ready(tid, priority);
        }
    }
    event::enqueue(EventType::InterruptCleanup, Origin::Kernel);
    event::drain();
}

/// Block the current thread (e.g. on a synchronous message receive).
pub fn block_current() {
    if let Some(tid) = current() {
        let _ = THREAD_TABLE.with_mut(tid, |t| t.state = ThreadState::Wait);
        SCHEDULER.lock().current = None;
    }
    event::enqueue(EventType::InterruptCleanup, Origin::Kernel);
    event::drain();
}

/// Wake a blocked thread, returning it to the ready queue.
pub fn wake(tid: ThreadId) {
    let ready = THREAD_TABLE.with_mut(tid, |t| {
        if t.state == ThreadState::Wait {
            t.state = ThreadState::Ready;
            Some(t.priority)
        } else {
            None
        }
    });
    if let Ok(Some(priority)) = ready {
        enqueue_ready(tid, priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_has_no_next_candidate() {
        let mut queue = ReadyQueue::new();
        assert_eq!(queue.dispatch_next(), None);
    }
}
