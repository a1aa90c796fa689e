//! Messaging: a FIFO inbox per process (spec §4.7).
//!
//! Field order follows `message_entry_t`
//! (`original_source/include/core/message.h`): an id, a type, the sender,
//! whether a reply is expected, and the payload bytes.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::trap::Origin;
use crate::error::{KernelError, KernelResult};
use crate::event::{self, EventType};
use crate::process::pcb::ProcessId;
use crate::process::table::PROCESS_TABLE;
use crate::process::thread::{ThreadState, THREAD_TABLE};
use crate::sched;

/// Caps one inbox entry's payload so a single message cannot exhaust the
/// kernel heap.
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// One inbox entry.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub msg_type: u32,
    pub sender: ProcessId,
    /// Set when the sender is waiting for a reply to this message.
    pub request: bool,
    pub bytes: Vec<u8>,
}

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic message-id allocator (spec §8 "Monotonic pid/tid/message_id").
fn alloc_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Deliver a message to `target`'s inbox, returning its assigned id. If the
/// target has a thread parked in WAIT (presumably on `receive`), wakes it
/// and posts a CLEANUP event so the scheduler considers it this trap return
/// (spec §4.7 "transition it to READY and enqueue CLEANUP").
pub fn send(
    sender: ProcessId,
    target: ProcessId,
    msg_type: u32,
    request: bool,
    bytes: Vec<u8>,
) -> KernelResult<u64> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(KernelError::InvalidArgument { name: "bytes" });
    }
    let id = alloc_message_id();
    let message = Message {
        id,
        msg_type,
        sender,
        request,
        bytes,
    };
    let threads = PROCESS_TABLE.with_mut(target, |process| {
        process.inbox.push_back(message);
        process.threads.clone()
    })?;

    if let Some(waiting) = threads
        .into_iter()
        .find(|tid| THREAD_TABLE.with(*tid, |t| t.state == ThreadState::Wait).unwrap_or(false))
    {
        sched::wake(waiting);
        event::enqueue(EventType::InterruptCleanup, Origin::Kernel);
    }
    Ok(id)
}

/// Pop the oldest message from `process`'s inbox. Returns `WouldBlock` if
/// empty; callers wanting to block should park the calling thread on the
/// scheduler and retry on wake (spec §4.7, §6 `message_receive`).
pub fn receive(process: ProcessId) -> KernelResult<Message> {
    PROCESS_TABLE
        .with_mut(process, |p| p.inbox.pop_front())?
        .ok_or(KernelError::WouldBlock)
}

/// Named service registry, so a message can be addressed by name rather
/// than by pid (spec §4.7 `send_by_name`).
static NAME_REGISTRY: Mutex<Option<alloc::collections::BTreeMap<String, ProcessId>>> =
    Mutex::new(None);

fn registry_entries() -> spin::MutexGuard<'static, Option<alloc::collections::BTreeMap<String, ProcessId>>> {
    let mut guard = NAME_REGISTRY.lock();
    if guard.is_none() {
        *guard = Some(alloc::collections::BTreeMap::new());
    }
    guard
}

/// Register `process` as the holder of `name`. A later registration for the
/// same name replaces the earlier one.
pub fn register_name(name: String, process: ProcessId) {
    registry_entries().as_mut().unwrap().insert(name, process);
}

pub fn unregister_name(name: &str) {
    registry_entries().as_mut().unwrap().remove(name);
}

/// Resolve `name` to a process and deliver a message to it.
pub fn send_by_name(
    sender: ProcessId,
    name: &str,
    msg_type: u32,
    request: bool,
    bytes: Vec<u8>,
) -> KernelResult<u64> {
    let target = *registry_entries()
        .as_ref()
        .unwrap()
        .get(name)
        .ok_or(KernelError::NotFound {
            resource: "named service",
            id: 0,
        })?;
    send(sender, target, msg_type, request, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn send_then_receive_preserves_order() {
        let target = ProcessId(900);
        PROCESS_TABLE
            .insert(crate::process::pcb::Process::new_kernel(
                target,
                "t".to_string(),
                crate::sched::Priority::DEFAULT,
            ))
            .unwrap();

        send(ProcessId(1), target, 1, false, alloc::vec![1]).unwrap();
        send(ProcessId(1), target, 2, false, alloc::vec![2]).unwrap();

        let first = receive(target).unwrap();
        let second = receive(target).unwrap();
        assert_eq!(first.msg_type, 1);
        assert_eq!(second.msg_type, 2);
        assert!(receive(target).is_err());

        PROCESS_TABLE.remove(target).unwrap();
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let target = ProcessId(901);
        let bytes = alloc::vec![0u8; MAX_MESSAGE_BYTES + 1];
        assert!(send(ProcessId(1), target, 0, false, bytes).is_err());
    }
}
