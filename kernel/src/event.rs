//! Kernel event queue.
//!
//! Two FIFOs keyed by origin: every trap-return tail drains the kernel-origin
//! queue in full before touching the user-origin one (spec §4.5, §8
//! "kernel-origin drains first"). Each [`EventType`] carries a list of
//! registered handlers, invoked in registration order; handlers bound as
//! "post" run after the non-post ones, so cleanup-style work can observe
//! what the primary handlers did.
//!
//! Replaces the source kernel's AVL tree of handlers (spec §9) with an
//! ordered map, since there is no need to preserve that particular balanced
//! tree's rebalancing behavior.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::trap::Origin;
use crate::error::{KernelError, KernelResult};
use crate::sync::once_lock::GlobalState;

/// Event types a handler can bind to (`original_source/include/core/event.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventType {
    Timer,
    Serial,
    Debug,
    InterruptCleanup,
    Process,
}

/// A registered event handler. Invoked with the event type that fired and
/// the origin (KERNEL/USER) of the trap that enqueued it.
pub type EventHandler = fn(EventType, Origin);

struct HandlerEntry {
    handler: EventHandler,
    post: bool,
}

struct EventQueues {
    /// Events enqueued from a kernel-origin trap.
    kernel: VecDeque<(EventType, Origin)>,
    /// Events enqueued from a user-origin trap.
    user: VecDeque<(EventType, Origin)>,
    handlers: BTreeMap<EventType, Vec<HandlerEntry>>,
}

impl EventQueues {
    fn new() -> Self {
        Self {
            kernel: VecDeque::new(),
            user: VecDeque::new(),
            handlers: BTreeMap::new(),
        }
    }

    fn bind(&mut self, event: EventType, handler: EventHandler, post: bool) -> KernelResult<()> {
        let entries = self.handlers.entry(event).or_default();
        if entries.iter().any(|e| e.handler as usize == handler as usize) {
            return Err(KernelError::AlreadyExists {
                resource: "event handler",
                id: event as u64,
            });
        }
        entries.push(HandlerEntry { handler, post });
        Ok(())
    }

    fn unbind(&mut self, event: EventType, handler: EventHandler) -> KernelResult<()> {
        let Some(entries) = self.handlers.get_mut(&event) else {
            return Err(KernelError::NotFound {
                resource: "event handler",
                id: event as u64,
            });
        };
        let before = entries.len();
        entries.retain(|e| e.handler as usize != handler as usize);
        if entries.len() == before {
            return Err(KernelError::NotFound {
                resource: "event handler",
                id: event as u64,
            });
        }
        Ok(())
    }

    fn enqueue(&mut self, event: EventType, origin: Origin) {
        match origin {
            Origin::Kernel => self.kernel.push_back((event, origin)),
            Origin::User => self.user.push_back((event, origin)),
        }
    }

    fn dispatch_one(&mut self, event: EventType, origin: Origin) {
        let Some(entries) = self.handlers.get(&event) else {
            return;
        };
        for entry in entries.iter().filter(|e| !e.post) {
            (entry.handler)(event, origin);
        }
        for entry in entries.iter().filter(|e| e.post) {
            (entry.handler)(event, origin);
        }
    }

    fn drain(&mut self) {
        while let Some((event, origin)) = self.kernel.pop_front() {
            self.dispatch_one(event, origin);
        }
        while let Some((event, origin)) = self.user.pop_front() {
            self.dispatch_one(event, origin);
        }
    }
}

static EVENT_QUEUES: GlobalState<Mutex<EventQueues>> = GlobalState::new();

/// Bring up the event queues. Must run once, before any `bind`/`enqueue`.
pub fn init() -> KernelResult<()> {
    EVENT_QUEUES
        .init(Mutex::new(EventQueues::new()))
        .map_err(|_| KernelError::AlreadyExists {
            resource: "event queues",
            id: 0,
        })
}

/// Register a handler for `event`. Idempotent registration is not implied —
/// binding the same handler twice for the same event is rejected (spec §4.5
/// "bind/unbind idempotent" refers to unbind-then-bind sequences being safe,
/// not duplicate binds).
pub fn bind(event: EventType, handler: EventHandler, post: bool) -> KernelResult<()> {
    EVENT_QUEUES
        .with_mut(|mtx| mtx.lock().bind(event, handler, post))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "event queues",
        }))
}

/// Remove a previously bound handler. Calling this on an event/handler pair
/// that is not currently bound returns `NotFound` rather than panicking, so
/// callers can unbind defensively.
pub fn unbind(event: EventType, handler: EventHandler) -> KernelResult<()> {
    EVENT_QUEUES
        .with_mut(|mtx| mtx.lock().unbind(event, handler))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "event queues",
        }))
}

/// Post an event. Called from IRQ handlers and from the scheduler itself
/// (`INTERRUPT_CLEANUP` on every trap return).
pub fn enqueue(event: EventType, origin: Origin) {
    EVENT_QUEUES.with_mut(|mtx| mtx.lock().enqueue(event, origin));
}

/// Drain both queues — kernel-origin first, then user-origin — dispatching
/// every pending event to its bound handlers. Called from the trap-return
/// tail (spec §4.5).
pub fn drain() {
    EVENT_QUEUES.with_mut(|mtx| mtx.lock().drain());
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static KERNEL_HITS: AtomicU32 = AtomicU32::new(0);
    static USER_HITS: AtomicU32 = AtomicU32::new(0);
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn on_kernel(_e: EventType, _o: Origin) {
        KERNEL_HITS.fetch_add(1, Ordering::SeqCst);
        ORDER.lock().push("kernel");
    }

    fn on_user(_e: EventType, _o: Origin) {
        USER_HITS.fetch_add(1, Ordering::SeqCst);
        ORDER.lock().push("user");
    }

    #[test]
    fn kernel_origin_drains_before_user_origin() {
        let mut q = EventQueues::new();
        q.bind(EventType::Debug, on_kernel, false).unwrap();
        q.bind(EventType::Serial, on_user, false).unwrap();
        ORDER.lock().clear();
        q.enqueue(EventType::Serial, Origin::User);
        q.enqueue(EventType::Debug, Origin::Kernel);
        q.drain();
        assert_eq!(&*ORDER.lock(), &["kernel", "user"]);
    }

    #[test]
    fn post_handlers_run_after_primary() {
        let mut q = EventQueues::new();
        ORDER.lock().clear();
        fn primary(_e: EventType, _o: Origin) {
            ORDER.lock().push("primary");
        }
        fn post(_e: EventType, _o: Origin) {
            ORDER.lock().push("post");
        }
        q.bind(EventType::Timer, post, true).unwrap();
        q.bind(EventType::Timer, primary, false).unwrap();
        q.enqueue(EventType::Timer, Origin::Kernel);
        q.drain();
        assert_eq!(&*ORDER.lock(), &["primary", "post"]);
    }

    #[test]
    fn unbind_missing_handler_errors() {
        let mut q = EventQueues::new();
        assert!(q.unbind(EventType::Process, on_kernel).is_err());
    }
}
