//! Processes and threads (spec §3).
//!
//! A process owns an address space, a set of threads, a FIFO message inbox,
//! and the shared-memory regions it has acquired. The kernel process (pid 0)
//! is created by [`init`] and owns every kernel-mode thread; every other
//! process is a USER process created by [`create_user_process`].

pub mod pcb;
pub mod table;
pub mod thread;

pub use pcb::{Process, ProcessId, ProcessState, ProcessType};
pub use table::PROCESS_TABLE;
pub use thread::{Thread, ThreadId, ThreadState};

extern crate alloc;
use alloc::string::ToString;

use crate::arch::trap::Origin;
use crate::error::{KernelError, KernelResult};
use crate::event::{self, EventType};
use crate::mm::page_table::MapFlags;
use crate::mm::vas::Context;
use crate::sched::{self, Priority};

/// Upper bound on simultaneously live processes.
pub const MAX_PROCESSES: usize = 4096;

/// The kernel process's fixed pid.
pub const KERNEL_PID: ProcessId = ProcessId(0);

/// Bring up the process subsystem: create the kernel process, pid 0, which
/// owns every kernel-mode thread and is never killed.
pub fn init() -> KernelResult<()> {
    let kernel_process = Process::new_kernel(KERNEL_PID, "kernel".to_string(), Priority::DEFAULT);
    PROCESS_TABLE.insert(kernel_process)
}

/// Spawn a USER process with one initial thread entering at `entry` in USR
/// mode (spec §4.6 "Thread creation within a process"). Returns the new
/// process's pid and its first thread's tid.
pub fn create_user_process(
    name: &str,
    entry: usize,
    priority: Priority,
    parent: ProcessId,
) -> KernelResult<(ProcessId, ThreadId)> {
    create_user_process_with(name, priority, parent, |_context| Ok(entry))
}

/// Like [`create_user_process`], but `loader` runs against the fresh
/// context before its first thread is built, so it can map segments into
/// exactly the address space that thread will run in (used by
/// `process_create` to load an ELF image into a brand new context rather
/// than one built then discarded).
pub fn create_user_process_with(
    name: &str,
    priority: Priority,
    parent: ProcessId,
    loader: impl FnOnce(&Context) -> KernelResult<usize>,
) -> KernelResult<(ProcessId, ThreadId)> {
    if PROCESS_TABLE.count() >= MAX_PROCESSES {
        return Err(KernelError::ResourceExhausted {
            resource: "process table",
        });
    }

    let pid = pcb::alloc_pid();
    let mut process = Process::new_user(pid, parent, name.to_string(), priority)?;
    let entry = loader(process.context())?;

    let kernel_stack_base = thread::allocate_kernel_stack(process.context())?;
    let user_stack_base = match process.context().map_random(1, MapFlags::user_rw()) {
        Ok(base) => base,
        Err(e) => {
            thread::free_kernel_stack(kernel_stack_base);
            return Err(e);
        }
    };

    let tid = thread::alloc_tid();
    let new_thread = Thread::new_user(
        tid,
        pid,
        priority,
        entry,
        user_stack_base,
        kernel_stack_base,
        0,
    );
    process.threads.push(tid);

    PROCESS_TABLE.insert(process)?;
    thread::THREAD_TABLE.insert(new_thread)?;
    crate::ipc::message::register_name(name.to_string(), pid);
    sched::enqueue_ready(tid, priority);
    Ok((pid, tid))
}

/// Spawn a kernel-mode thread inside the kernel process: no address-space
/// switch, no user stack.
pub fn create_kernel_thread(entry: usize, priority: Priority, arg: u32) -> KernelResult<ThreadId> {
    let kernel_stack_base = thread::allocate_kernel_stack(Context::kernel())?;
    let tid = thread::alloc_tid();
    let new_thread = Thread::new_kernel(tid, KERNEL_PID, priority, entry, kernel_stack_base, arg);
    thread::THREAD_TABLE.insert(new_thread)?;
    PROCESS_TABLE.with_mut(KERNEL_PID, |p| p.threads.push(tid))?;
    sched::enqueue_ready(tid, priority);
    Ok(tid)
}

/// The thread presently on the CPU, if any.
pub fn current_thread() -> Option<ThreadId> {
    sched::current()
}

/// The process owning the thread presently on the CPU, if any.
pub fn current_process() -> Option<ProcessId> {
    current_thread().and_then(|tid| thread::THREAD_TABLE.with(tid, |t| t.process).ok())
}

/// `pid`'s parent, if `pid` exists.
pub fn parent_of(pid: ProcessId) -> KernelResult<ProcessId> {
    PROCESS_TABLE.with(pid, |p| p.parent)
}

/// Acquire the named shared region for `pid`, recording the mapping so it
/// is released automatically when the process exits (spec §4.7 `acquire`).
pub fn acquire_shared(
    pid: ProcessId,
    name: &str,
    flags: MapFlags,
) -> KernelResult<usize> {
    let context = PROCESS_TABLE.with(pid, |p| p.context.as_context() as *const Context)?;
    // SAFETY: the context outlives this call; nothing removes `pid` from the
    // table on this single core while we hold a live reference derived from
    // the lookup above.
    let base = crate::ipc::shared_memory::acquire(name, unsafe { &*context }, flags)?;
    let frame_count = crate::ipc::shared_memory::frame_count(name).unwrap_or(0);
    PROCESS_TABLE.with_mut(pid, |p| {
        p.shared_regions.insert(name.to_string(), (base, frame_count));
    })?;
    Ok(base)
}

/// Release every shared region `pid` holds (called on process exit).
fn release_all_shared(pid: ProcessId) {
    let context = match PROCESS_TABLE.with(pid, |p| p.context.as_context() as *const Context) {
        Ok(c) => c,
        Err(_) => return,
    };
    let context = unsafe { &*context };
    let regions = PROCESS_TABLE
        .with_mut(pid, |p| core::mem::take(&mut p.shared_regions))
        .unwrap_or_default();
    for (name, (base, frame_count)) in regions {
        let _ = crate::ipc::shared_memory::release(&name, context, base, frame_count);
    }
}

/// Terminate every thread owned by `pid` (spec §6 `process_kill`). The
/// process itself is reaped once its last thread is.
pub fn kill_process(pid: ProcessId) -> KernelResult<()> {
    let (tids, name) = PROCESS_TABLE.with(pid, |p| (p.threads.clone(), p.name.clone()))?;
    for tid in tids {
        kill_thread(tid);
    }
    release_all_shared(pid);
    crate::ipc::message::unregister_name(&name);
    event::enqueue(EventType::InterruptCleanup, Origin::Kernel);
    Ok(())
}

/// Terminate `tid`: mark it KILL and drop it from the ready queue so the
/// scheduler reaps it on its next pass (spec §4.6 step 1).
pub fn kill_thread(tid: ThreadId) {
    let priority = thread::THREAD_TABLE.with_mut(tid, |t| {
        let priority = t.priority;
        t.state = ThreadState::Kill;
        priority
    });
    if let Ok(priority) = priority {
        sched::remove_ready(tid, priority);
    }
}

/// Voluntarily give up the CPU (spec §6 `thread_yield`).
pub fn yield_thread() {
    sched::yield_current();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_pid_is_zero() {
        assert_eq!(KERNEL_PID.0, 0);
    }
}
