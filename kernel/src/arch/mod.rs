//! Architecture façade for 32-bit ARMv6/ARMv7.
//!
//! Everything that must touch raw hardware state — barriers, TLB/cache
//! maintenance, MMIO accessors, the paging-format probe — lives in this
//! module behind a typed interface. No other subsystem carries
//! `core::arch::asm!`.
//!
//! The functions below only have real bodies on `target_arch = "arm"`; unit
//! tests for everything else (mm, sched, process, ...) run on the host, so
//! a non-ARM stand-in with the same signatures is provided for `cargo test`
//! to link against. Neither stand-in is reachable from a real boot, since
//! `bootstrap` itself is ARM-only.

pub mod barriers;
pub mod context;
pub mod timer;
pub mod trap;

/// Which page-table format this CPU uses, chosen once at boot from
/// `ID_MMFR0` (spec §4.2 "Format selection: at boot, read the ID register
/// and branch on it").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingFormatKind {
    /// VMSA v6/v7, 32-bit physical, two-level tables.
    Short,
    /// ARMv7 LPAE, 40-bit physical, three-level tables.
    Long,
}

#[cfg(target_arch = "arm")]
mod imp {
    use super::PagingFormatKind;
    use core::arch::asm;

    /// Read `ID_MMFR0` (Memory Model Feature Register 0) and report which
    /// VMSA variant this core supports. Bits [3:0] (`VMSA`) are `0b0101` or
    /// higher on cores implementing the Short-descriptor format; LPAE
    /// support is reported the same way. We treat any core that reports
    /// LPAE support as preferring the Long format, matching the bring-up
    /// code of the reference kernel this was distilled from.
    pub fn probe_paging_format() -> PagingFormatKind {
        let mmfr0: u32;
        // SAFETY: MRC p15, 0, <Rt>, c0, c1, 4 reads ID_MMFR0, a read-only
        // feature-identification register available at every exception
        // level.
        unsafe {
            asm!("mrc p15, 0, {0}, c0, c1, 4", out(reg) mmfr0, options(nomem, nostack, preserves_flags));
        }
        let vmsa_field = mmfr0 & 0xf;
        if vmsa_field >= 0x5 {
            PagingFormatKind::Long
        } else {
            PagingFormatKind::Short
        }
    }

    /// Halt the CPU in a low-power wait state until the next interrupt.
    /// Used by the scheduler when no thread is READY (spec §4.6 step 6).
    pub fn wait_for_interrupt() {
        // SAFETY: WFI is a normal, privileged-or-not instruction that
        // suspends execution until an interrupt is pending; it has no side
        // effects beyond that suspension.
        unsafe {
            asm!("wfi", options(nomem, nostack, preserves_flags));
        }
    }

    /// Halt forever with interrupts disabled. Used by the panic handler
    /// (spec §7: "Panic: ... halts with interrupts disabled").
    pub fn halt_forever() -> ! {
        loop {
            // SAFETY: CPSIDif disables IRQ and FIQ; wfi then suspends
            // execution. Both are ordinary privileged instructions with no
            // memory effects.
            unsafe {
                asm!("cpsid if", "wfi", options(nomem, nostack));
            }
        }
    }

    /// Disable IRQ and FIQ, returning the previous CPSR so it can be
    /// restored.
    pub fn disable_interrupts() -> u32 {
        let cpsr: u32;
        // SAFETY: MRS reads CPSR (no side effects); CPSID disables IRQ/FIQ.
        // Used to bracket critical sections (spec §5: "Interrupts are
        // disabled during heap structural mutations and during scheduler
        // bucket mutations").
        unsafe {
            asm!(
                "mrs {0}, cpsr",
                "cpsid if",
                out(reg) cpsr,
                options(nomem, nostack)
            );
        }
        cpsr
    }

    /// Restore a CPSR value saved by [`disable_interrupts`].
    pub fn restore_interrupts(saved_cpsr: u32) {
        // SAFETY: MSR writes the flags/interrupt-mask bits of CPSR back to
        // their saved value. `saved_cpsr` was produced by a prior
        // `disable_interrupts` call on this same core, so the value is a
        // valid CPSR snapshot.
        unsafe {
            asm!("msr cpsr_c, {0}", in(reg) saved_cpsr, options(nomem, nostack));
        }
    }
}

#[cfg(not(target_arch = "arm"))]
mod imp {
    use super::PagingFormatKind;
    use core::sync::atomic::{AtomicU32, Ordering};

    /// Host stand-in: every unit test that cares about the format picks one
    /// explicitly rather than relying on this probe.
    pub fn probe_paging_format() -> PagingFormatKind {
        PagingFormatKind::Short
    }

    pub fn wait_for_interrupt() {}

    pub fn halt_forever() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    static HOST_IRQ_STATE: AtomicU32 = AtomicU32::new(0);

    pub fn disable_interrupts() -> u32 {
        HOST_IRQ_STATE.swap(1, Ordering::AcqRel)
    }

    pub fn restore_interrupts(saved_cpsr: u32) {
        HOST_IRQ_STATE.store(saved_cpsr, Ordering::Release);
    }
}

pub use imp::{
    disable_interrupts, halt_forever, probe_paging_format, restore_interrupts, wait_for_interrupt,
};

/// Run `f` with interrupts disabled, restoring the previous state
/// afterwards. The standard critical-section helper used by C1/C3/C6.
pub fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    let saved = disable_interrupts();
    let result = f();
    restore_interrupts(saved);
    result
}
