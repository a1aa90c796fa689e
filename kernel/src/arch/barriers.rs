//! Barriers, TLB and cache maintenance, MMIO accessors.
//!
//! Thin wrappers over the ARMv6/ARMv7 coprocessor instructions the virtual
//! memory subsystem needs. Kept deliberately small and `unsafe` throughout;
//! callers are expected to know the architectural preconditions (spec §9:
//! "Keep as a small, explicitly unsafe architecture module with the same
//! contracts; all other modules depend on it through a typed façade").
//!
//! As in `arch::mod`, the real bodies only exist on `target_arch = "arm"`;
//! a non-ARM stand-in backs host unit tests of callers like `mm::page_table`.

#[cfg(target_arch = "arm")]
mod imp {
    use core::arch::asm;

    /// Data Synchronization Barrier: no instruction after this one executes
    /// until all memory accesses before it have completed.
    #[inline(always)]
    pub fn dsb() {
        // SAFETY: DSB has no memory side effects of its own; it only orders
        // ones that already happened.
        unsafe { asm!("dsb", options(nomem, nostack, preserves_flags)) }
    }

    /// Data Memory Barrier: orders memory accesses without waiting for
    /// completion.
    #[inline(always)]
    pub fn dmb() {
        // SAFETY: same as dsb.
        unsafe { asm!("dmb", options(nomem, nostack, preserves_flags)) }
    }

    /// Instruction Synchronization Barrier: flushes the pipeline so that
    /// subsequently fetched instructions see the effects of prior context
    /// changes (page-table swaps, self-modifying code).
    #[inline(always)]
    pub fn isb() {
        // SAFETY: ISB has no memory side effects; it only affects
        // instruction fetch ordering.
        unsafe { asm!("isb", options(nomem, nostack, preserves_flags)) }
    }

    /// Invalidate the entire TLB (both formats use the same invalidate-all
    /// encoding: `MCR p15, 0, <Rt>, c8, c7, 0`).
    ///
    /// # Safety
    /// The caller must ensure no code is relying on stale translations
    /// surviving this call, and must follow with [`dsb`] + [`isb`] if it
    /// needs the invalidation to be visible before the next instruction
    /// (this function already does so).
    pub unsafe fn invalidate_tlb_all() {
        asm!(
            "mcr p15, 0, {zero}, c8, c7, 0",
            zero = in(reg) 0u32,
            options(nomem, nostack, preserves_flags)
        );
        dsb();
        isb();
    }

    /// Invalidate a single TLB entry by its MVA (`MCR p15, 0, <Rt>, c8, c7,
    /// 1`).
    ///
    /// # Safety
    /// `vaddr` must be the virtual address whose translation is being
    /// changed; the caller is responsible for not relying on the old
    /// translation after this call.
    pub unsafe fn invalidate_tlb_entry(vaddr: usize) {
        asm!(
            "mcr p15, 0, {v}, c8, c7, 1",
            v = in(reg) vaddr as u32,
            options(nomem, nostack, preserves_flags)
        );
        dsb();
        isb();
    }

    /// Clean and invalidate the entire data cache by set/way. Only needed
    /// around full context switches on cores without cache coherency with
    /// the MMU table walker; kept as an explicit, rarely-called operation.
    ///
    /// # Safety
    /// Caller must ensure no other core (there is exactly one on this
    /// target) observes memory in an inconsistent state mid-operation.
    pub unsafe fn clean_invalidate_dcache_all() {
        // A full set/way clean+invalidate loop depends on CCSIDR geometry;
        // the common case on the targeted single-core boards is a flat loop
        // over all sets/ways of the one data cache level.
        let ccsidr: u32;
        asm!("mrc p15, 1, {0}, c0, c0, 0", out(reg) ccsidr, options(nomem, nostack, preserves_flags));
        let line_size = 4usize << ((ccsidr & 0x7) + 2);
        let associativity = ((ccsidr >> 3) & 0x3ff) as usize + 1;
        let num_sets = ((ccsidr >> 13) & 0x7fff) as usize + 1;
        let way_shift = 32 - (associativity as u32).leading_zeros().min(31);
        let set_shift = (line_size as u32).trailing_zeros();

        for way in 0..associativity {
            for set in 0..num_sets {
                let sw = ((way as u32) << way_shift) | ((set as u32) << set_shift);
                asm!("mcr p15, 0, {0}, c7, c14, 2", in(reg) sw, options(nomem, nostack, preserves_flags));
            }
        }
        dsb();
    }

    /// Install the translation table base register 0 (`TTBR0`) with a
    /// physical root table address. Used by both paging formats'
    /// `activate()`.
    ///
    /// # Safety
    /// `root_phys` must point at a valid, fully-constructed root page table
    /// for the active format; installing a half-built table corrupts every
    /// subsequent translation.
    pub unsafe fn set_ttbr0(root_phys: u32) {
        asm!("mcr p15, 0, {0}, c2, c0, 0", in(reg) root_phys, options(nomem, nostack, preserves_flags));
        isb();
    }

    /// Read back `TTBR0`.
    pub fn read_ttbr0() -> u32 {
        let v: u32;
        // SAFETY: pure register read.
        unsafe { asm!("mrc p15, 0, {0}, c2, c0, 0", out(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }
}

#[cfg(not(target_arch = "arm"))]
mod imp {
    use core::sync::atomic::{AtomicU32, Ordering};

    pub fn dsb() {}
    pub fn dmb() {}
    pub fn isb() {}

    /// # Safety
    /// No real TLB on the host; trivially satisfied.
    pub unsafe fn invalidate_tlb_all() {}

    /// # Safety
    /// No real TLB on the host; trivially satisfied.
    pub unsafe fn invalidate_tlb_entry(_vaddr: usize) {}

    /// # Safety
    /// No real cache on the host; trivially satisfied.
    pub unsafe fn clean_invalidate_dcache_all() {}

    static HOST_TTBR0: AtomicU32 = AtomicU32::new(0);

    /// # Safety
    /// Host stand-in: just records the value for `read_ttbr0` to echo back.
    pub unsafe fn set_ttbr0(root_phys: u32) {
        HOST_TTBR0.store(root_phys, Ordering::Release);
    }

    pub fn read_ttbr0() -> u32 {
        HOST_TTBR0.load(Ordering::Acquire)
    }
}

pub use imp::{
    clean_invalidate_dcache_all, dmb, dsb, invalidate_tlb_all, invalidate_tlb_entry, isb,
    read_ttbr0, set_ttbr0,
};

/// Write a byte to a memory-mapped I/O register.
///
/// # Safety
/// `addr` must be a valid, mapped MMIO register address; the write's effect
/// is device-defined.
#[inline(always)]
pub unsafe fn mmio_write32(addr: usize, value: u32) {
    unsafe { (addr as *mut u32).write_volatile(value) }
}

/// Read a 32-bit memory-mapped I/O register.
///
/// # Safety
/// `addr` must be a valid, mapped MMIO register address.
#[inline(always)]
pub unsafe fn mmio_read32(addr: usize) -> u32 {
    unsafe { (addr as *const u32).read_volatile() }
}
