//! Threads: the unit of execution within a process (spec §3).
//!
//! Each thread owns its own saved register frame, kernel stack, and (for
//! USER threads) user stack; it shares everything else with its owning
//! [`crate::process::pcb::Process`].

extern crate alloc;

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::context::ThreadContext;
use crate::config::KERNEL_STACK_PAGES;
use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::MapFlags;
use crate::mm::vas::Context;
use crate::mm::frame_align_up;
use crate::process::pcb::ProcessId;
use crate::sched::task::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Thread lifecycle state (spec §3: READY/ACTIVE/HALTED/WAIT/KILL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to run, sitting in a scheduler bucket.
    Ready,
    /// Currently on the CPU.
    Active,
    /// Finished normally, not yet reaped.
    Halted,
    /// Blocked (message receive, or another synchronous wait).
    Wait,
    /// Killed, waiting for the scheduler to reap it.
    Kill,
}

/// One thread of execution.
pub struct Thread {
    pub tid: ThreadId,
    pub process: ProcessId,
    pub priority: Priority,
    pub state: ThreadState,
    /// Saved register frame plus kernel stack pointer; swapped on every
    /// context switch.
    pub context: ThreadContext,
    pub kernel_stack_base: usize,
    /// Zero for kernel-mode threads, which never touch a user stack.
    pub user_stack_base: usize,
}

impl Thread {
    /// Build a USER-mode thread: its first dispatch enters `entry` in USR
    /// mode with `sp = user_stack_top` (spec §4.6 "Thread creation within a
    /// process").
    pub fn new_user(
        tid: ThreadId,
        process: ProcessId,
        priority: Priority,
        entry: usize,
        user_stack_base: usize,
        kernel_stack_base: usize,
        arg: u32,
    ) -> Self {
        let kernel_sp = kernel_stack_base + KERNEL_STACK_PAGES * crate::config::FRAME_SIZE;
        let user_stack_top = user_stack_base + crate::config::FRAME_SIZE;
        Self {
            tid,
            process,
            priority,
            state: ThreadState::Ready,
            context: ThreadContext::new_user(entry, user_stack_top, kernel_sp, arg),
            kernel_stack_base,
            user_stack_base,
        }
    }

    /// Build a KERNEL-mode thread: never leaves SVC mode, has no user stack.
    pub fn new_kernel(
        tid: ThreadId,
        process: ProcessId,
        priority: Priority,
        entry: usize,
        kernel_stack_base: usize,
        arg: u32,
    ) -> Self {
        let kernel_sp = kernel_stack_base + KERNEL_STACK_PAGES * crate::config::FRAME_SIZE;
        Self {
            tid,
            process,
            priority,
            state: ThreadState::Ready,
            context: ThreadContext::new_kernel(entry, kernel_sp, arg),
            kernel_stack_base,
            user_stack_base: 0,
        }
    }
}

/// Allocate and map a thread's kernel stack within `context`, registering its
/// range with `arch::trap::classify_origin` so traps taken while running on
/// it classify as KERNEL-origin (spec §4.4 invariant 3).
pub fn allocate_kernel_stack(context: &Context) -> crate::error::KernelResult<usize> {
    let size = KERNEL_STACK_PAGES * crate::config::FRAME_SIZE;
    let base = context.map_random(KERNEL_STACK_PAGES, MapFlags::kernel_rw())?;
    crate::arch::trap::register_kernel_stack(base, base + size);
    Ok(base)
}

pub fn free_kernel_stack(base: usize) {
    crate::arch::trap::unregister_kernel_stack(base);
    let size = frame_align_up(KERNEL_STACK_PAGES * crate::config::FRAME_SIZE);
    let mut addr = base;
    while addr < base + size {
        let _ = Context::kernel().unmap(addr);
        addr += crate::config::FRAME_SIZE;
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Monotonic thread-id allocator (spec §8 "Monotonic pid/tid/message_id").
pub fn alloc_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Global thread table, keyed by tid. A [`crate::process::pcb::Process`]
/// tracks only which tids belong to it; the threads themselves live here so
/// the scheduler can look one up for a context switch without knowing its
/// owning process in advance.
pub struct ThreadTable {
    entries: Mutex<BTreeMap<ThreadId, Thread>>,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, thread: Thread) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&thread.tid) {
            return Err(KernelError::AlreadyExists {
                resource: "thread",
                id: thread.tid.0,
            });
        }
        entries.insert(thread.tid, thread);
        Ok(())
    }

    pub fn remove(&self, tid: ThreadId) -> KernelResult<Thread> {
        self.entries.lock().remove(&tid).ok_or(KernelError::NotFound {
            resource: "thread",
            id: tid.0,
        })
    }

    pub fn with<R>(&self, tid: ThreadId, f: impl FnOnce(&Thread) -> R) -> KernelResult<R> {
        let entries = self.entries.lock();
        let thread = entries.get(&tid).ok_or(KernelError::NotFound {
            resource: "thread",
            id: tid.0,
        })?;
        Ok(f(thread))
    }

    pub fn with_mut<R>(&self, tid: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> KernelResult<R> {
        let mut entries = self.entries.lock();
        let thread = entries.get_mut(&tid).ok_or(KernelError::NotFound {
            resource: "thread",
            id: tid.0,
        })?;
        Ok(f(thread))
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

pub static THREAD_TABLE: ThreadTable = ThreadTable::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_allocation_is_monotonic() {
        let a = alloc_tid();
        let b = alloc_tid();
        assert!(b.0 > a.0);
    }
}
