//! Process control block (spec §3).

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelResult;
use crate::ipc::message::Message;
use crate::mm::vas::Context;
use crate::process::thread::ThreadId;
use crate::sched::task::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

/// Process `type` (spec §3): which half of the address space it was given
/// and, by extension, its trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Kernel,
    User,
}

/// Process lifecycle state (spec §3: READY/ACTIVE/HALTED/KILL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Active,
    Halted,
    Kill,
}

/// A process's address space. The kernel process (pid 0) never owns its own
/// root table — it runs in the one true kernel [`Context`] — while every
/// USER process owns a [`Context`] created by [`Context::new_user`].
pub enum ProcessContext {
    Kernel,
    User(Context),
}

impl ProcessContext {
    pub fn as_context(&self) -> &Context {
        match self {
            ProcessContext::Kernel => Context::kernel(),
            ProcessContext::User(ctx) => ctx,
        }
    }
}

/// A process: a name, an address space, a set of threads, a FIFO inbox, and
/// the shared-memory regions it currently has open (spec §3, §4.7).
pub struct Process {
    pub pid: ProcessId,
    pub parent: ProcessId,
    pub name: String,
    pub kind: ProcessType,
    pub state: ProcessState,
    pub priority: Priority,
    pub context: ProcessContext,
    pub threads: Vec<ThreadId>,
    pub inbox: VecDeque<Message>,
    /// Shared-memory regions this process has acquired, keyed by name, with
    /// the `(vaddr, frame_count)` needed to release them on exit (spec §4.7
    /// "refcount-gated frame freeing").
    pub shared_regions: BTreeMap<String, (usize, usize)>,
}

impl Process {
    /// Construct the kernel process (pid 0). Runs in the kernel context.
    pub fn new_kernel(pid: ProcessId, name: String, priority: Priority) -> Self {
        Self {
            pid,
            parent: pid,
            name,
            kind: ProcessType::Kernel,
            state: ProcessState::Ready,
            priority,
            context: ProcessContext::Kernel,
            threads: Vec::new(),
            inbox: VecDeque::new(),
            shared_regions: BTreeMap::new(),
        }
    }

    /// Construct a USER process with its own address space, owned by `parent`.
    pub fn new_user(
        pid: ProcessId,
        parent: ProcessId,
        name: String,
        priority: Priority,
    ) -> KernelResult<Self> {
        let context = Context::new_user()?;
        Ok(Self {
            pid,
            parent,
            name,
            kind: ProcessType::User,
            state: ProcessState::Ready,
            priority,
            context: ProcessContext::User(context),
            threads: Vec::new(),
            inbox: VecDeque::new(),
            shared_regions: BTreeMap::new(),
        })
    }

    pub fn context(&self) -> &Context {
        self.context.as_context()
    }
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Monotonic process-id allocator. Pid 0 is reserved for the kernel process
/// and assigned directly by `process::init`, never by this allocator.
pub fn alloc_pid() -> ProcessId {
    ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_allocation_is_monotonic() {
        let a = alloc_pid();
        let b = alloc_pid();
        assert!(b.0 > a.0);
    }
}
