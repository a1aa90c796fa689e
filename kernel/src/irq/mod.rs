//! Interrupt line management.
//!
//! A flat handler table keyed by [`IrqNumber`], dispatched through whatever
//! concrete interrupt controller the board provides via [`IrqController`].
//! On entry to every trap (IRQ, FIQ, abort, or swi) the architecture layer
//! takes a [`crate::arch::trap::NestGuard`], classifies the trap's origin
//! with [`crate::arch::trap::classify_origin`], and switches onto the
//! current thread's kernel stack if the trap came from user mode — that
//! bookkeeping lives in `arch::trap`; this module only owns the handler
//! table and the controller delegation (spec §4.4, §6).

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::config::MAX_IRQ;
use crate::error::{KernelError, KernelResult};
use crate::sync::once_lock::GlobalState;

/// Architecture-independent IRQ number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqNumber(pub u32);

impl IrqNumber {
    pub const fn new(irq: u32) -> Self {
        Self(irq)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for IrqNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<IrqNumber> for u32 {
    fn from(irq: IrqNumber) -> u32 {
        irq.0
    }
}

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

/// A registered IRQ handler, invoked with the IRQ number that fired.
pub type IrqHandler = fn(IrqNumber);

/// How a line is routed (spec §4.4 `register_handler(..., kind, ...)`).
/// `Software` lines are never backed by real hardware and skip the
/// controller's acknowledge/EOI calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Normal,
    Fast,
    Software,
}

#[cfg(feature = "alloc")]
struct IrqEntry {
    primary: Option<(IrqHandler, HandlerKind)>,
    post: alloc::vec::Vec<(IrqHandler, HandlerKind)>,
}

#[cfg(feature = "alloc")]
impl IrqEntry {
    fn new() -> Self {
        Self {
            primary: None,
            post: alloc::vec::Vec::new(),
        }
    }
}

/// Contract the board's concrete interrupt controller (BCM2835/36 legacy
/// controller, or a generic GIC on newer SoCs) must satisfy. The kernel core
/// only ever talks to the active controller through this trait.
pub trait IrqController: Sync {
    fn enable(&self, irq: IrqNumber) -> KernelResult<()>;
    fn disable(&self, irq: IrqNumber) -> KernelResult<()>;
    fn acknowledge(&self, irq: IrqNumber) -> KernelResult<()>;
    fn eoi(&self, irq: IrqNumber) -> KernelResult<()>;
    fn set_priority(&self, irq: IrqNumber, priority: u8) -> KernelResult<()>;
    fn is_pending(&self, irq: IrqNumber) -> KernelResult<bool>;
}

/// Central handler table. Hardware enable/disable/ack/eoi/priority/pending
/// calls are delegated to whichever [`IrqController`] was installed at boot.
struct IrqManager {
    #[cfg(feature = "alloc")]
    handlers: BTreeMap<u32, IrqEntry>,
    controller: Option<&'static dyn IrqController>,
    dispatch_count: u64,
}

impl IrqManager {
    fn new() -> Self {
        Self {
            #[cfg(feature = "alloc")]
            handlers: BTreeMap::new(),
            controller: None,
            dispatch_count: 0,
        }
    }

    /// Install a handler on `irq`. `post=false` installs the primary
    /// handler (at most one per line); `post=true` appends to the list
    /// that runs after the primary handler, in registration order (spec
    /// §4.4).
    #[cfg(feature = "alloc")]
    fn register(
        &mut self,
        irq: IrqNumber,
        handler: IrqHandler,
        kind: HandlerKind,
        post: bool,
    ) -> KernelResult<()> {
        if irq.0 >= MAX_IRQ {
            return Err(KernelError::InvalidArgument { name: "irq" });
        }
        let entry = self.handlers.entry(irq.0).or_insert_with(IrqEntry::new);
        if post {
            entry.post.push((handler, kind));
        } else {
            if entry.primary.is_some() {
                return Err(KernelError::AlreadyExists {
                    resource: "IRQ handler",
                    id: irq.0 as u64,
                });
            }
            entry.primary = Some((handler, kind));
        }
        Ok(())
    }

    /// Remove a previously registered handler. `post` must match the value
    /// passed to [`Self::register`] for this `(irq, handler)` pair.
    #[cfg(feature = "alloc")]
    fn unregister(&mut self, irq: IrqNumber, handler: IrqHandler, post: bool) -> KernelResult<()> {
        let entry = self.handlers.get_mut(&irq.0).ok_or(KernelError::NotFound {
            resource: "IRQ handler",
            id: irq.0 as u64,
        })?;
        if post {
            let before = entry.post.len();
            entry.post.retain(|&(h, _)| h != handler);
            if entry.post.len() == before {
                return Err(KernelError::NotFound {
                    resource: "IRQ handler",
                    id: irq.0 as u64,
                });
            }
        } else {
            match entry.primary {
                Some((h, _)) if h == handler => entry.primary = None,
                _ => {
                    return Err(KernelError::NotFound {
                        resource: "IRQ handler",
                        id: irq.0 as u64,
                    })
                }
            }
        }
        Ok(())
    }

    /// Run the primary handler then every post handler, in registration
    /// order (spec §4.4, §8 "post handlers fire after non-post"). Hardware
    /// acknowledge/EOI is skipped for software-only lines.
    #[cfg(feature = "alloc")]
    fn dispatch(&mut self, irq: IrqNumber) {
        self.dispatch_count += 1;
        let Some(entry) = self.handlers.get(&irq.0) else {
            return;
        };
        let is_software = matches!(entry.primary, Some((_, HandlerKind::Software)));
        if !is_software {
            if let Some(controller) = self.controller {
                let _ = controller.acknowledge(irq);
            }
        }
        if let Some((handler, _)) = entry.primary {
            handler(irq);
        }
        for &(handler, _) in &entry.post {
            handler(irq);
        }
        if !is_software {
            if let Some(controller) = self.controller {
                let _ = controller.eoi(irq);
            }
        }
    }

    fn dispatch_count(&self) -> u64 {
        self.dispatch_count
    }

    fn controller(&self) -> KernelResult<&'static dyn IrqController> {
        self.controller.ok_or(KernelError::NotInitialized {
            subsystem: "IRQ controller",
        })
    }
}

static IRQ_MANAGER: GlobalState<Mutex<IrqManager>> = GlobalState::new();

/// Bring up the IRQ manager with the board's concrete controller. Must run
/// once, after the controller itself has been initialized.
pub fn init(controller: &'static dyn IrqController) -> KernelResult<()> {
    let mut manager = IrqManager::new();
    manager.controller = Some(controller);
    IRQ_MANAGER
        .init(Mutex::new(manager))
        .map_err(|_| KernelError::AlreadyExists {
            resource: "IRQ manager",
            id: 0,
        })?;
    log::info!("IRQ manager initialized");
    Ok(())
}

/// Register a handler for the given interrupt number (spec §4.4). At most
/// one non-`post` handler may be registered per line; any number of `post`
/// handlers may be registered, and they run after it in registration order.
#[cfg(feature = "alloc")]
pub fn register_handler(
    irq: IrqNumber,
    handler: IrqHandler,
    kind: HandlerKind,
    post: bool,
) -> KernelResult<()> {
    IRQ_MANAGER
        .with_mut(|mtx| mtx.lock().register(irq, handler, kind, post))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

/// Unregister a handler previously installed with [`register_handler`].
/// `post` must match the value used at registration.
#[cfg(feature = "alloc")]
pub fn unregister_handler(irq: IrqNumber, handler: IrqHandler, post: bool) -> KernelResult<()> {
    IRQ_MANAGER
        .with_mut(|mtx| mtx.lock().unregister(irq, handler, post))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

/// Dispatch an interrupt to its registered handler. Called from the
/// architecture entry point after `arch::trap::enter()` has taken its guard
/// and the kernel stack switch (if any) has happened. A line with no
/// registered handler is silently ignored (spurious interrupt).
#[cfg(feature = "alloc")]
pub fn dispatch(irq: IrqNumber) {
    IRQ_MANAGER.with_mut(|mtx| mtx.lock().dispatch(irq));
}

/// Scan every line for a pending source and dispatch the first one found
/// (spec §4.4 "get pending source from controller; dispatch registered
/// handler(s)"). Called from the architecture's IRQ/FIQ trap-entry path;
/// a spurious interrupt (nothing pending) is a no-op.
#[cfg(feature = "alloc")]
pub fn dispatch_pending() {
    let Some(controller) = IRQ_MANAGER
        .with(|mtx| mtx.lock().controller())
        .and_then(Result::ok)
    else {
        return;
    };
    for n in 0..MAX_IRQ {
        let irq = IrqNumber::new(n);
        if controller.is_pending(irq).unwrap_or(false) {
            dispatch(irq);
            return;
        }
    }
}

pub fn enable_irq(irq: IrqNumber) -> KernelResult<()> {
    IRQ_MANAGER
        .with(|mtx| mtx.lock().controller()?.enable(irq))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

pub fn disable_irq(irq: IrqNumber) -> KernelResult<()> {
    IRQ_MANAGER
        .with(|mtx| mtx.lock().controller()?.disable(irq))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

pub fn set_priority(irq: IrqNumber, priority: u8) -> KernelResult<()> {
    IRQ_MANAGER
        .with(|mtx| mtx.lock().controller()?.set_priority(irq, priority))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

pub fn is_pending(irq: IrqNumber) -> KernelResult<bool> {
    IRQ_MANAGER
        .with(|mtx| mtx.lock().controller()?.is_pending(irq))
        .unwrap_or(Err(KernelError::NotInitialized {
            subsystem: "IRQ manager",
        }))
}

/// Number of interrupts dispatched since initialization.
pub fn dispatch_count() -> u64 {
    IRQ_MANAGER.with(|mtx| mtx.lock().dispatch_count()).unwrap_or(0)
}

/// Handle a data abort (spec §7 "User-visible failure behavior"). A
/// kernel-mode abort is unrecoverable and panics; a user-mode abort kills
/// the faulting thread and lets the scheduler reap it on the next cleanup
/// pass, rather than taking the whole kernel down.
#[cfg(feature = "alloc")]
pub fn handle_data_abort(frame: &crate::arch::context::TrapFrame, fault_addr: usize) {
    if !frame.is_user_mode() {
        panic!("data abort in kernel mode at pc={:#x}, fault_addr={:#x}", frame.pc, fault_addr);
    }
    if let Some(tid) = crate::process::current_thread() {
        crate::process::kill_thread(tid);
    }
    crate::event::enqueue(crate::event::EventType::InterruptCleanup, crate::arch::trap::Origin::User);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubController;
    impl IrqController for StubController {
        fn enable(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn disable(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn acknowledge(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn eoi(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn set_priority(&self, _irq: IrqNumber, _priority: u8) -> KernelResult<()> {
            Ok(())
        }
        fn is_pending(&self, _irq: IrqNumber) -> KernelResult<bool> {
            Ok(false)
        }
    }

    fn noop(_irq: IrqNumber) {}
    fn noop2(_irq: IrqNumber) {}

    #[test]
    fn register_rejects_irq_beyond_max() {
        let mut manager = IrqManager::new();
        manager.controller = Some(&StubController);
        let over = IrqNumber::new(MAX_IRQ);
        assert_eq!(
            manager.register(over, noop, HandlerKind::Normal, false),
            Err(KernelError::InvalidArgument { name: "irq" })
        );
    }

    #[test]
    fn register_then_unregister_roundtrip() {
        let mut manager = IrqManager::new();
        manager.controller = Some(&StubController);
        let irq = IrqNumber::new(3);
        manager.register(irq, noop, HandlerKind::Normal, false).unwrap();
        assert!(manager
            .register(irq, noop, HandlerKind::Normal, false)
            .is_err());
        manager.unregister(irq, noop, false).unwrap();
        assert!(manager.unregister(irq, noop, false).is_err());
    }

    #[test]
    fn post_handlers_run_after_primary_in_registration_order() {
        use core::sync::atomic::{AtomicU8, Ordering};
        static ORDER: AtomicU8 = AtomicU8::new(0);
        static LOG: [AtomicU8; 3] = [AtomicU8::new(0), AtomicU8::new(0), AtomicU8::new(0)];

        fn primary(_irq: IrqNumber) {
            let slot = ORDER.fetch_add(1, Ordering::SeqCst);
            LOG[slot as usize].store(1, Ordering::SeqCst);
        }
        fn post_a(_irq: IrqNumber) {
            let slot = ORDER.fetch_add(1, Ordering::SeqCst);
            LOG[slot as usize].store(2, Ordering::SeqCst);
        }
        fn post_b(_irq: IrqNumber) {
            let slot = ORDER.fetch_add(1, Ordering::SeqCst);
            LOG[slot as usize].store(3, Ordering::SeqCst);
        }

        let mut manager = IrqManager::new();
        manager.controller = Some(&StubController);
        let irq = IrqNumber::new(5);
        manager.register(irq, primary, HandlerKind::Normal, false).unwrap();
        manager.register(irq, post_a, HandlerKind::Normal, true).unwrap();
        manager.register(irq, post_b, HandlerKind::Normal, true).unwrap();
        manager.dispatch(irq);

        assert_eq!(LOG[0].load(Ordering::SeqCst), 1);
        assert_eq!(LOG[1].load(Ordering::SeqCst), 2);
        assert_eq!(LOG[2].load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unregister_requires_matching_handler() {
        let mut manager = IrqManager::new();
        manager.controller = Some(&StubController);
        let irq = IrqNumber::new(7);
        manager.register(irq, noop, HandlerKind::Normal, false).unwrap();
        assert!(manager.unregister(irq, noop2, false).is_err());
        manager.unregister(irq, noop, false).unwrap();
    }

    struct PendingOnController(u32);
    impl IrqController for PendingOnController {
        fn enable(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn disable(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn acknowledge(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn eoi(&self, _irq: IrqNumber) -> KernelResult<()> {
            Ok(())
        }
        fn set_priority(&self, _irq: IrqNumber, _priority: u8) -> KernelResult<()> {
            Ok(())
        }
        fn is_pending(&self, irq: IrqNumber) -> KernelResult<bool> {
            Ok(irq.0 == self.0)
        }
    }

    #[test]
    fn dispatch_pending_finds_the_pending_line() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static HIT: AtomicU32 = AtomicU32::new(0);
        fn handler(irq: IrqNumber) {
            HIT.store(irq.0, Ordering::SeqCst);
        }

        static CONTROLLER: PendingOnController = PendingOnController(3);
        let mut manager = IrqManager::new();
        manager.controller = Some(&CONTROLLER);
        manager
            .register(IrqNumber::new(3), handler, HandlerKind::Normal, false)
            .unwrap();
        IRQ_MANAGER.init(Mutex::new(manager)).ok();

        dispatch_pending();
        assert_eq!(HIT.load(Ordering::SeqCst), 3);
    }
}
