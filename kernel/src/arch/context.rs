//! Saved CPU register state.
//!
//! `TrapFrame` is the in-memory layout the trap-entry assembly pushes onto
//! the active stack (spec §4.4: "Parameters and return values live in the
//! saved register frame; the frame is the in-memory representation of the
//! CPU state pushed by the trap entry assembly"). `ThreadContext` is the
//! subset of it a scheduler swaps on a context switch.

/// Register frame saved on trap entry and restored on trap return.
///
/// Field order matches what the (out-of-scope) entry stub pushes: r0-r12,
/// then the banked sp/lr of the interrupted mode, then pc and cpsr.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            r0: 0,
            r1: 0,
            r2: 0,
            r3: 0,
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            sp: 0,
            lr: 0,
            pc: 0,
            cpsr: 0,
        }
    }

    /// Syscall argument registers, r0..r3 (spec §6 "Inputs (regs)").
    pub fn syscall_args(&self) -> [u32; 4] {
        [self.r0, self.r1, self.r2, self.r3]
    }

    /// Set the syscall return value in r0.
    pub fn set_return_value(&mut self, value: isize) {
        self.r0 = value as u32;
    }

    /// USR mode bits of CPSR (M[4:0] = 0b10000).
    pub fn is_user_mode(&self) -> bool {
        (self.cpsr & 0x1f) == 0b10000
    }
}

/// Mode bits for CPSR[4:0].
pub const MODE_USR: u32 = 0b10000;
pub const MODE_SVC: u32 = 0b10011;

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// The trap frame currently being serviced, published by whichever
/// trap-entry function is on the call stack right now. Null when no trap
/// is live. `schedule()` reads and writes through this pointer rather than
/// through a `Thread` directly, since the only live copy of a running
/// thread's registers is the one the (out-of-scope) entry assembly pushed
/// onto the trap stack (spec §4.6 step 5).
static CURRENT_FRAME: AtomicPtr<TrapFrame> = AtomicPtr::new(core::ptr::null_mut());

/// The current thread's kernel stack pointer, published by
/// [`load_current`] for the (out-of-scope) entry stub to switch onto on
/// the next user-mode trap.
static CURRENT_KERNEL_SP: AtomicUsize = AtomicUsize::new(0);

/// Publish `frame` as the live trap frame. Called by every trap-entry
/// function before it does any nontrivial work.
pub fn enter_frame(frame: *mut TrapFrame) {
    CURRENT_FRAME.store(frame, Ordering::Release);
}

/// Clear the live trap frame pointer. Called by every trap-entry function
/// just before it returns to the entry stub.
pub fn leave_frame() {
    CURRENT_FRAME.store(core::ptr::null_mut(), Ordering::Release);
}

/// Copy the live trap frame into `context.frame`: the outgoing thread's
/// register state at the moment its trap is about to return into a
/// different thread (spec §4.6 step 5 "save the outgoing register frame").
/// A no-op if no trap is currently live.
pub fn save_current(context: &mut ThreadContext) {
    let ptr = CURRENT_FRAME.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: a non-null pointer was published by `enter_frame` from a
        // trap handler still executing further up this same call stack —
        // the only way `schedule()` runs — so it points at a live,
        // correctly aligned `TrapFrame`.
        context.frame = unsafe { *ptr };
    }
}

/// Overwrite the live trap frame with `context.frame`, the incoming
/// thread's saved registers, so the pending trap return resumes it instead
/// of the outgoing thread (spec §4.6 step 5 "load the incoming thread's
/// frame"). Also publishes `context.kernel_sp` for the entry stub's next
/// trap. A no-op on the frame if no trap is currently live (e.g. the very
/// first dispatch out of the idle loop).
pub fn load_current(context: &ThreadContext) {
    CURRENT_KERNEL_SP.store(context.kernel_sp, Ordering::Release);
    let ptr = CURRENT_FRAME.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: see `save_current`.
        unsafe { *ptr = context.frame };
    }
}

/// The current thread's kernel stack pointer.
pub fn current_kernel_sp() -> usize {
    CURRENT_KERNEL_SP.load(Ordering::Acquire)
}

/// A thread's saved execution context: its [`TrapFrame`] plus the kernel
/// stack pointer it should resume on. The scheduler (C6) swaps this on every
/// context switch.
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
    pub frame: TrapFrame,
    pub kernel_sp: usize,
}

impl ThreadContext {
    pub const fn zeroed() -> Self {
        Self {
            frame: TrapFrame::zeroed(),
            kernel_sp: 0,
        }
    }

    /// Construct the initial context for a new thread so that its first
    /// dispatch enters at `entry` in USR mode with `sp = user_stack_top`
    /// (spec §4.6 "Thread creation within a process").
    pub fn new_user(entry: usize, user_stack_top: usize, kernel_sp: usize, arg: u32) -> Self {
        let mut frame = TrapFrame::zeroed();
        frame.pc = entry as u32;
        frame.sp = user_stack_top as u32;
        frame.r0 = arg;
        frame.cpsr = MODE_USR;
        Self { frame, kernel_sp }
    }

    /// Construct the initial context for a kernel-mode thread (spec's
    /// {KERNEL, USER} process `type`).
    pub fn new_kernel(entry: usize, kernel_stack_top: usize, arg: u32) -> Self {
        let mut frame = TrapFrame::zeroed();
        frame.pc = entry as u32;
        frame.sp = kernel_stack_top as u32;
        frame.r0 = arg;
        frame.cpsr = MODE_SVC;
        Self {
            frame,
            kernel_sp: kernel_stack_top,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: `CURRENT_FRAME`/`CURRENT_KERNEL_SP` are process-global,
    // so exercising enter/save/load/leave across separate parallel tests
    // would race.
    #[test]
    fn save_and_load_round_trip_through_the_live_frame() {
        let mut live = TrapFrame::zeroed();
        live.r0 = 0xaaaa;
        live.pc = 0x1000;

        enter_frame(&mut live as *mut TrapFrame);

        let mut outgoing = ThreadContext::zeroed();
        save_current(&mut outgoing);
        assert_eq!(outgoing.frame.r0, 0xaaaa);
        assert_eq!(outgoing.frame.pc, 0x1000);

        let mut incoming = ThreadContext::zeroed();
        incoming.frame.r0 = 0xbbbb;
        incoming.frame.pc = 0x2000;
        incoming.kernel_sp = 0x3000;
        load_current(&incoming);

        assert_eq!(live.r0, 0xbbbb);
        assert_eq!(live.pc, 0x2000);
        assert_eq!(current_kernel_sp(), 0x3000);

        leave_frame();
        let mut after_leave = ThreadContext::zeroed();
        after_leave.frame.r0 = 0x1234;
        save_current(&mut after_leave);
        assert_eq!(after_leave.frame.r0, 0x1234, "save_current is a no-op with no live frame");
    }
}
