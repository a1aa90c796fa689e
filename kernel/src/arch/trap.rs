//! Nesting discipline, origin classification, and the central trap-entry
//! functions the (out-of-scope) entry stub calls for each of the seven trap
//! kinds (spec §4.4).

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch::context::{self, TrapFrame};
use crate::config::NESTED_MAX;
use crate::event;

/// Current trap nesting depth on this (single) core.
static NEST_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Enter a trap handler, incrementing the nesting counter. Panics if the
/// nesting depth would exceed [`NESTED_MAX`] (spec §4.4 invariant 1).
///
/// Returns a guard that decrements the counter on drop, so every return
/// path — including an early `?` — restores the count.
pub fn enter() -> NestGuard {
    let depth = NEST_DEPTH.fetch_add(1, Ordering::AcqRel) + 1;
    if depth > NESTED_MAX {
        panic!("nested-trap counter overflow: depth {depth} exceeds NESTED_MAX {NESTED_MAX}");
    }
    NestGuard
}

/// RAII guard returned by [`enter`]; decrements the nesting counter when
/// the trap handler returns.
pub struct NestGuard;

impl Drop for NestGuard {
    fn drop(&mut self) {
        NEST_DEPTH.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Current nesting depth, for diagnostics.
pub fn nest_depth() -> u32 {
    NEST_DEPTH.load(Ordering::Acquire)
}

/// Registered ranges of kernel-stack virtual addresses, used to classify a
/// trapped PC as KERNEL- or USER-origin (spec §4.4 invariant 3). Each
/// thread's kernel stack is registered when the thread is created and
/// unregistered when it is destroyed.
const MAX_TRACKED_STACKS: usize = 256;

struct StackRange {
    base: AtomicUsize,
    top: AtomicUsize,
}

static KERNEL_STACK_RANGES: [StackRange; MAX_TRACKED_STACKS] = {
    const INIT: StackRange = StackRange {
        base: AtomicUsize::new(0),
        top: AtomicUsize::new(0),
    };
    [INIT; MAX_TRACKED_STACKS]
};

/// Register a thread's kernel stack range so traps originating inside it
/// classify as KERNEL-origin.
pub fn register_kernel_stack(base: usize, top: usize) {
    for slot in KERNEL_STACK_RANGES.iter() {
        if slot.top.load(Ordering::Acquire) == 0 {
            slot.base.store(base, Ordering::Release);
            slot.top.store(top, Ordering::Release);
            return;
        }
    }
}

/// Unregister a kernel stack range previously added by
/// [`register_kernel_stack`].
pub fn unregister_kernel_stack(base: usize) {
    for slot in KERNEL_STACK_RANGES.iter() {
        if slot.base.load(Ordering::Acquire) == base {
            slot.base.store(0, Ordering::Release);
            slot.top.store(0, Ordering::Release);
            return;
        }
    }
}

/// Event origin, carried on every CLEANUP event (spec §3 "Event").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Kernel,
    User,
}

/// Classify a saved PC as KERNEL- or USER-origin by checking whether it
/// falls within any registered kernel stack range.
pub fn classify_origin(saved_pc: usize) -> Origin {
    for slot in KERNEL_STACK_RANGES.iter() {
        let base = slot.base.load(Ordering::Acquire);
        let top = slot.top.load(Ordering::Acquire);
        if top != 0 && saved_pc >= base && saved_pc < top {
            return Origin::Kernel;
        }
    }
    Origin::User
}

/// Run `body` with `frame` published as the live trap frame, so
/// `schedule()` can save/load register state against it if a context
/// switch happens before this trap returns, then drain CLEANUP before
/// unpublishing it (spec §4.4 invariants 1-3; §4.6 "every trap return
/// drains CLEANUP"). Every handler below funnels through this.
fn run_trap<R>(frame: &mut TrapFrame, body: impl FnOnce(&mut TrapFrame) -> R) -> R {
    let _guard = enter();
    context::enter_frame(frame);
    let result = body(frame);
    event::drain();
    context::leave_frame();
    result
}

/// Supervisor call trap entry (spec §4.4 "look up syscall number; invoke
/// handler; populate result via saved register frame").
pub fn handle_swi(frame: &mut TrapFrame) {
    run_trap(frame, |f| crate::syscall::dispatch(f));
}

/// IRQ trap entry (spec §4.4 "get pending source from controller; dispatch
/// registered handler(s); enqueue CLEANUP event").
pub fn handle_irq(frame: &mut TrapFrame) {
    run_trap(frame, |_| crate::irq::dispatch_pending());
}

/// FIQ trap entry — same dispatch as IRQ, from the fast handler set (spec
/// §4.4 "Same as IRQ but from the 'fast' handler set").
pub fn handle_fiq(frame: &mut TrapFrame) {
    run_trap(frame, |_| crate::irq::dispatch_pending());
}

/// Data abort trap entry (spec §4.4, §9 "translate [user-mode data abort]
/// to thread termination"): kernel-mode fault is fatal, user-mode fault
/// kills the faulting thread.
pub fn handle_data_abort(frame: &mut TrapFrame, fault_addr: usize) {
    run_trap(frame, |f| crate::irq::handle_data_abort(f, fault_addr));
}

/// Prefetch abort trap entry (spec §4.4 "if debug exception and debugger
/// attached → post DEBUG event; else panic"). No debugger ever attaches,
/// so this always panics.
pub fn handle_prefetch_abort(frame: &mut TrapFrame) {
    run_trap(frame, |f| {
        panic!("prefetch abort at pc={:#x}, cpsr={:#x}", f.pc, f.cpsr);
    });
}

/// Undefined instruction trap entry (spec §4.4 "panic after dumping the
/// saved register frame").
pub fn handle_undefined(frame: &mut TrapFrame) {
    run_trap(frame, |f| {
        panic!("undefined instruction: {f:?}");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_unregistered_is_user() {
        assert_eq!(classify_origin(0x1234), Origin::User);
    }

    #[test]
    fn classify_registered_range_is_kernel() {
        register_kernel_stack(0x1000, 0x2000);
        assert_eq!(classify_origin(0x1500), Origin::Kernel);
        assert_eq!(classify_origin(0x5000), Origin::User);
        unregister_kernel_stack(0x1000);
        assert_eq!(classify_origin(0x1500), Origin::User);
    }

    #[test]
    fn handle_swi_dispatches_and_restores_nesting() {
        let mut frame = TrapFrame::zeroed();
        frame.r7 = 11; // kernel_putc
        frame.r0 = b'x' as u32;
        handle_swi(&mut frame);
        assert_eq!(frame.r0, 0);
        assert_eq!(nest_depth(), 0);
    }

    // A real panic here halts the kernel forever, so there is no trap
    // return to clear `CURRENT_FRAME`. Tests must clean that up themselves
    // (via `catch_unwind` + `leave_frame`) so a dangling pointer into this
    // test's stack frame doesn't outlive it for later tests to dereference.
    #[test]
    fn handle_undefined_panics() {
        let mut frame = TrapFrame::zeroed();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle_undefined(&mut frame);
        }));
        context::leave_frame();
        assert!(result.is_err());
    }

    #[test]
    fn handle_prefetch_abort_panics() {
        let mut frame = TrapFrame::zeroed();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle_prefetch_abort(&mut frame);
        }));
        context::leave_frame();
        assert!(result.is_err());
    }

    #[test]
    fn nest_guard_restores_depth() {
        assert_eq!(nest_depth(), 0);
        {
            let _g1 = enter();
            assert_eq!(nest_depth(), 1);
            {
                let _g2 = enter();
                assert_eq!(nest_depth(), 2);
            }
            assert_eq!(nest_depth(), 1);
        }
        assert_eq!(nest_depth(), 0);
    }
}
