//! Page-table formats.
//!
//! ARMv6/v7 cores support two incompatible translation table layouts: the
//! classic Short-descriptor format (2-level, 32-bit physical) and, on cores
//! with LPAE, the Long-descriptor format (3-level, 40-bit physical). The
//! format is chosen once at boot (spec §4.2 "Format selection") and the rest
//! of the kernel talks to whichever one is active only through the
//! [`PagingFormat`] trait — no other code branches on which format is in use.

use crate::arch::barriers;
use crate::config::FRAME_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{self, FrameNumber};

/// Permission and caching attributes for a mapping, expressed independently
/// of either page-table format's bit encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags {
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
    pub device: bool,
}

impl MapFlags {
    pub const fn kernel_rw() -> Self {
        Self {
            writable: true,
            user: false,
            executable: false,
            device: false,
        }
    }

    pub const fn kernel_code() -> Self {
        Self {
            writable: false,
            user: false,
            executable: true,
            device: false,
        }
    }

    pub const fn user_rw() -> Self {
        Self {
            writable: true,
            user: true,
            executable: false,
            device: false,
        }
    }

    pub const fn user_code() -> Self {
        Self {
            writable: false,
            user: true,
            executable: true,
            device: false,
        }
    }

    pub const fn device() -> Self {
        Self {
            writable: true,
            user: false,
            executable: false,
            device: true,
        }
    }
}

/// The capability set shared by both translation table layouts (spec §9
/// "Design Notes": "model the two page-table formats as implementations of
/// one small trait rather than as a format enum threaded through every
/// call").
///
/// A root table owns exactly one physical frame tree; dropping a format
/// instance does not free it — callers manage frame lifetime explicitly via
/// [`PagingFormat::destroy`].
pub trait PagingFormat: Sized {
    /// Allocate and zero a fresh root table, ready for `map`/`activate`.
    fn new_root() -> KernelResult<Self>;

    /// Physical address of the root table, for `activate`/bookkeeping.
    fn root_phys(&self) -> u32;

    /// Reconstruct a handle over an existing root table, e.g. to operate on
    /// a foreign address space via a temporary mapping.
    fn from_root_phys(root_phys: u32) -> Self;

    /// Map one page. Allocates intermediate tables as needed. Returns
    /// [`KernelError::AlreadyMapped`] if the virtual address is already
    /// mapped.
    fn map(&mut self, vaddr: u32, frame: FrameNumber, flags: MapFlags) -> KernelResult<()>;

    /// Unmap one page, returning the frame that was mapped there.
    fn unmap(&mut self, vaddr: u32) -> KernelResult<FrameNumber>;

    /// Resolve a virtual address to its backing frame and flags, without
    /// modifying the table.
    fn resolve(&self, vaddr: u32) -> Option<(FrameNumber, MapFlags)>;

    /// Install this table as the active translation for the current mode
    /// (`TTBR0`) and invalidate the TLB.
    fn activate(&self);

    /// Free every frame owned by this table tree, including the root.
    fn destroy(self);
}

const PAGE_SHIFT: u32 = 12;
const SECTION_SHIFT: u32 = 20;

// ---------------------------------------------------------------------------
// Short-descriptor format (VMSA v6/v7, 2-level)
// ---------------------------------------------------------------------------

const SHORT_L1_ENTRIES: usize = 4096;
const SHORT_L2_ENTRIES: usize = 256;

const SHORT_L1_TYPE_FAULT: u32 = 0b00;
const SHORT_L1_TYPE_PAGE_TABLE: u32 = 0b01;
const SHORT_L1_TYPE_SECTION: u32 = 0b10;

const SHORT_L2_TYPE_FAULT: u32 = 0b00;
const SHORT_L2_TYPE_SMALL: u32 = 0b10;

/// Short-descriptor (classic VMSA) translation tables. L1 has 4096 entries
/// each covering 1 MiB (a section, or a pointer to an L2 table of 256
/// entries each covering a 4 KiB small page).
pub struct ShortFormat {
    l1_frame: FrameNumber,
}

impl ShortFormat {
    fn l1_ptr(&self) -> *mut u32 {
        self.l1_frame.addr() as *mut u32
    }

    fn l2_ptr(l2_phys: u32) -> *mut u32 {
        l2_phys as *mut u32
    }

    fn alloc_l2() -> KernelResult<FrameNumber> {
        let frame = frame_allocator::allocate(1, 1)
            .map_err(|_| KernelError::OutOfMemory { requested_frames: 1 })?;
        // SAFETY: `frame` was just allocated and is not referenced elsewhere.
        unsafe {
            core::ptr::write_bytes(frame.addr() as *mut u8, 0, FRAME_SIZE);
        }
        Ok(frame)
    }

    fn small_page_flags(flags: MapFlags) -> u32 {
        // AP bits [5:4] and [9] (APX): 0b11 for full access, 0b01 for
        // privileged-only; XN bit[0] for never-execute.
        let mut entry = SHORT_L2_TYPE_SMALL;
        let ap = if flags.user { 0b11 } else { 0b01 };
        entry |= ap << 4;
        if !flags.executable {
            entry |= 1; // XN
        }
        if flags.device {
            entry |= 1 << 2; // B bit: bufferable, treated as device-ish here
        } else if flags.writable {
            entry |= 1 << 3; // C bit: cacheable
        }
        entry
    }
}

impl PagingFormat for ShortFormat {
    fn new_root() -> KernelResult<Self> {
        // L1 needs 16 KiB = 4 frames, and TTBR0 requires that base 16 KiB
        // aligned, so the allocation itself must start on a 4-frame boundary.
        let l1_frame = frame_allocator::allocate(4, 4)
            .map_err(|_| KernelError::OutOfMemory { requested_frames: 4 })?;
        // SAFETY: freshly allocated, exclusively owned frame range.
        unsafe {
            core::ptr::write_bytes(l1_frame.addr() as *mut u8, 0, FRAME_SIZE * 4);
        }
        Ok(Self { l1_frame })
    }

    fn root_phys(&self) -> u32 {
        self.l1_frame.addr()
    }

    fn from_root_phys(root_phys: u32) -> Self {
        Self {
            l1_frame: FrameNumber::from_addr(root_phys),
        }
    }

    fn map(&mut self, vaddr: u32, frame: FrameNumber, flags: MapFlags) -> KernelResult<()> {
        let l1_index = (vaddr >> SECTION_SHIFT) as usize % SHORT_L1_ENTRIES;
        // SAFETY: l1_frame owns a valid, exclusively-accessed L1 table.
        let l1 = unsafe { self.l1_ptr().add(l1_index) };
        let l1_entry = unsafe { l1.read_volatile() };

        let l2_phys = if l1_entry & 0b11 == SHORT_L1_TYPE_FAULT {
            let l2_frame = Self::alloc_l2()?;
            let l2_phys = l2_frame.addr();
            unsafe {
                l1.write_volatile(l2_phys | SHORT_L1_TYPE_PAGE_TABLE);
            }
            l2_phys
        } else if l1_entry & 0b11 == SHORT_L1_TYPE_PAGE_TABLE {
            l1_entry & !0x3ff
        } else {
            return Err(KernelError::AlreadyMapped { addr: vaddr as usize });
        };

        let l2_index = (vaddr >> PAGE_SHIFT) as usize % SHORT_L2_ENTRIES;
        let l2 = unsafe { Self::l2_ptr(l2_phys).add(l2_index) };
        let existing = unsafe { l2.read_volatile() };
        if existing & 0b11 != SHORT_L2_TYPE_FAULT {
            return Err(KernelError::AlreadyMapped { addr: vaddr as usize });
        }

        let entry = (frame.addr() & !0xfff) | Self::small_page_flags(flags);
        unsafe {
            l2.write_volatile(entry);
        }
        Ok(())
    }

    fn unmap(&mut self, vaddr: u32) -> KernelResult<FrameNumber> {
        let l1_index = (vaddr >> SECTION_SHIFT) as usize % SHORT_L1_ENTRIES;
        let l1 = unsafe { self.l1_ptr().add(l1_index) };
        let l1_entry = unsafe { l1.read_volatile() };
        if l1_entry & 0b11 != SHORT_L1_TYPE_PAGE_TABLE {
            return Err(KernelError::Unmapped { addr: vaddr as usize });
        }
        let l2_phys = l1_entry & !0x3ff;
        let l2_index = (vaddr >> PAGE_SHIFT) as usize % SHORT_L2_ENTRIES;
        let l2 = unsafe { Self::l2_ptr(l2_phys).add(l2_index) };
        let entry = unsafe { l2.read_volatile() };
        if entry & 0b11 == SHORT_L2_TYPE_FAULT {
            return Err(KernelError::Unmapped { addr: vaddr as usize });
        }
        unsafe {
            l2.write_volatile(0);
        }
        unsafe {
            barriers::invalidate_tlb_entry(vaddr as usize);
        }
        Ok(FrameNumber::from_addr(entry & !0xfff))
    }

    fn resolve(&self, vaddr: u32) -> Option<(FrameNumber, MapFlags)> {
        let l1_index = (vaddr >> SECTION_SHIFT) as usize % SHORT_L1_ENTRIES;
        let l1 = unsafe { self.l1_ptr().add(l1_index) };
        let l1_entry = unsafe { l1.read_volatile() };
        if l1_entry & 0b11 != SHORT_L1_TYPE_PAGE_TABLE {
            return None;
        }
        let l2_phys = l1_entry & !0x3ff;
        let l2_index = (vaddr >> PAGE_SHIFT) as usize % SHORT_L2_ENTRIES;
        let l2 = unsafe { Self::l2_ptr(l2_phys).add(l2_index) };
        let entry = unsafe { l2.read_volatile() };
        if entry & 0b11 == SHORT_L2_TYPE_FAULT {
            return None;
        }
        let ap = (entry >> 4) & 0b11;
        let flags = MapFlags {
            writable: ap == 0b11 || ap == 0b01,
            user: ap == 0b11,
            executable: entry & 1 == 0,
            device: entry & (1 << 2) != 0,
        };
        Some((FrameNumber::from_addr(entry & !0xfff), flags))
    }

    fn activate(&self) {
        unsafe {
            barriers::set_ttbr0(self.root_phys());
            barriers::invalidate_tlb_all();
        }
    }

    fn destroy(self) {
        for l1_index in 0..SHORT_L1_ENTRIES {
            let l1 = unsafe { self.l1_ptr().add(l1_index) };
            let entry = unsafe { l1.read_volatile() };
            if entry & 0b11 == SHORT_L1_TYPE_PAGE_TABLE {
                let l2_frame = FrameNumber::from_addr(entry & !0x3ff);
                frame_allocator::free(l2_frame, 1);
            }
        }
        frame_allocator::free(self.l1_frame, 4);
    }
}

// ---------------------------------------------------------------------------
// Long-descriptor format (ARMv7 LPAE, 3-level)
// ---------------------------------------------------------------------------

const LONG_ENTRIES: usize = 512;
const LONG_L1_SHIFT: u32 = 30;
const LONG_L2_SHIFT: u32 = 21;

const LONG_DESC_VALID: u64 = 1 << 0;
const LONG_DESC_TABLE: u64 = 1 << 1;
const LONG_DESC_PAGE: u64 = 1 << 1;
const LONG_DESC_AF: u64 = 1 << 10;

/// ARMv7 LPAE translation tables: a 3-level, 512-entry-per-level hierarchy
/// over a 40-bit physical address space. Each leaf maps a 4 KiB page (block
/// mappings at L2 are not used here; the kernel only ever maps page-granular
/// regions, spec §4.2 scope).
pub struct LongFormat {
    l1_frame: FrameNumber,
}

impl LongFormat {
    fn table_ptr(phys: u32) -> *mut u64 {
        phys as *mut u64
    }

    fn alloc_table() -> KernelResult<FrameNumber> {
        let frame = frame_allocator::allocate(1, 1)
            .map_err(|_| KernelError::OutOfMemory { requested_frames: 1 })?;
        unsafe {
            core::ptr::write_bytes(frame.addr() as *mut u8, 0, FRAME_SIZE);
        }
        Ok(frame)
    }

    fn leaf_attrs(flags: MapFlags) -> u64 {
        let mut entry = LONG_DESC_VALID | LONG_DESC_PAGE | LONG_DESC_AF;
        // AP[2:1] in bits [7:6]: 01 = read/write any, 11 = read-only any.
        let ap = if flags.writable { 0b01 } else { 0b11 };
        entry |= (ap as u64) << 6;
        if flags.user {
            entry |= 1 << 6; // AP[1] user-accessible bit already part of ap above
        }
        if !flags.executable {
            entry |= 1 << 54; // XN
        }
        if flags.device {
            entry |= 0b00 << 2; // MAIR index 0 reserved for device memory
        } else {
            entry |= 0b01 << 2; // MAIR index 1 reserved for normal memory
        }
        entry
    }
}

impl PagingFormat for LongFormat {
    fn new_root() -> KernelResult<Self> {
        let l1_frame = Self::alloc_table()?;
        Ok(Self { l1_frame })
    }

    fn root_phys(&self) -> u32 {
        self.l1_frame.addr()
    }

    fn from_root_phys(root_phys: u32) -> Self {
        Self {
            l1_frame: FrameNumber::from_addr(root_phys),
        }
    }

    fn map(&mut self, vaddr: u32, frame: FrameNumber, flags: MapFlags) -> KernelResult<()> {
        let l1_index = (vaddr >> LONG_L1_SHIFT) as usize % LONG_ENTRIES;
        let l1 = unsafe { Self::table_ptr(self.l1_frame.addr()).add(l1_index) };
        let l1_entry = unsafe { l1.read_volatile() };

        let l2_phys = if l1_entry & LONG_DESC_VALID == 0 {
            let l2_frame = Self::alloc_table()?;
            let l2_phys = l2_frame.addr();
            unsafe {
                l1.write_volatile(l2_phys as u64 | LONG_DESC_VALID | LONG_DESC_TABLE);
            }
            l2_phys
        } else {
            (l1_entry & 0x0000_ffff_ffff_f000) as u32
        };

        let l2_index = (vaddr >> LONG_L2_SHIFT) as usize % LONG_ENTRIES;
        let l2 = unsafe { Self::table_ptr(l2_phys).add(l2_index) };
        let l2_entry = unsafe { l2.read_volatile() };
        if l2_entry & LONG_DESC_VALID == 0 {
            let l3_frame = Self::alloc_table()?;
            let l3_phys = l3_frame.addr();
            unsafe {
                l2.write_volatile(l3_phys as u64 | LONG_DESC_VALID | LONG_DESC_TABLE);
            }
        } else if l2_entry & LONG_DESC_TABLE == 0 {
            return Err(KernelError::AlreadyMapped { addr: vaddr as usize });
        }
        let l3_phys = (unsafe { l2.read_volatile() } & 0x0000_ffff_ffff_f000) as u32;

        let l3_index = (vaddr >> PAGE_SHIFT) as usize % LONG_ENTRIES;
        let l3 = unsafe { Self::table_ptr(l3_phys).add(l3_index) };
        let existing = unsafe { l3.read_volatile() };
        if existing & LONG_DESC_VALID != 0 {
            return Err(KernelError::AlreadyMapped { addr: vaddr as usize });
        }
        let entry = (frame.addr() as u64 & 0x0000_ffff_ffff_f000) | Self::leaf_attrs(flags);
        unsafe {
            l3.write_volatile(entry);
        }
        Ok(())
    }

    fn unmap(&mut self, vaddr: u32) -> KernelResult<FrameNumber> {
        let l1_index = (vaddr >> LONG_L1_SHIFT) as usize % LONG_ENTRIES;
        let l1 = unsafe { Self::table_ptr(self.l1_frame.addr()).add(l1_index) };
        let l1_entry = unsafe { l1.read_volatile() };
        if l1_entry & LONG_DESC_VALID == 0 {
            return Err(KernelError::Unmapped { addr: vaddr as usize });
        }
        let l2_phys = (l1_entry & 0x0000_ffff_ffff_f000) as u32;

        let l2_index = (vaddr >> LONG_L2_SHIFT) as usize % LONG_ENTRIES;
        let l2 = unsafe { Self::table_ptr(l2_phys).add(l2_index) };
        let l2_entry = unsafe { l2.read_volatile() };
        if l2_entry & LONG_DESC_VALID == 0 {
            return Err(KernelError::Unmapped { addr: vaddr as usize });
        }
        let l3_phys = (l2_entry & 0x0000_ffff_ffff_f000) as u32;

        let l3_index = (vaddr >> PAGE_SHIFT) as usize % LONG_ENTRIES;
        let l3 = unsafe { Self::table_ptr(l3_phys).add(l3_index) };
        let entry = unsafe { l3.read_volatile() };
        if entry & LONG_DESC_VALID == 0 {
            return Err(KernelError::Unmapped { addr: vaddr as usize });
        }
        unsafe {
            l3.write_volatile(0);
        }
        unsafe {
            barriers::invalidate_tlb_entry(vaddr as usize);
        }
        Ok(FrameNumber::from_addr((entry & 0x0000_ffff_ffff_f000) as u32))
    }

    fn resolve(&self, vaddr: u32) -> Option<(FrameNumber, MapFlags)> {
        let l1_index = (vaddr >> LONG_L1_SHIFT) as usize % LONG_ENTRIES;
        let l1_entry =
            unsafe { Self::table_ptr(self.l1_frame.addr()).add(l1_index).read_volatile() };
        if l1_entry & LONG_DESC_VALID == 0 {
            return None;
        }
        let l2_phys = (l1_entry & 0x0000_ffff_ffff_f000) as u32;

        let l2_index = (vaddr >> LONG_L2_SHIFT) as usize % LONG_ENTRIES;
        let l2_entry = unsafe { Self::table_ptr(l2_phys).add(l2_index).read_volatile() };
        if l2_entry & LONG_DESC_VALID == 0 {
            return None;
        }
        let l3_phys = (l2_entry & 0x0000_ffff_ffff_f000) as u32;

        let l3_index = (vaddr >> PAGE_SHIFT) as usize % LONG_ENTRIES;
        let entry = unsafe { Self::table_ptr(l3_phys).add(l3_index).read_volatile() };
        if entry & LONG_DESC_VALID == 0 {
            return None;
        }
        let ap = (entry >> 6) & 0b11;
        let flags = MapFlags {
            writable: ap & 0b01 == 0b01,
            user: ap & 0b01 == 0b01,
            executable: entry & (1 << 54) == 0,
            device: (entry >> 2) & 0b11 == 0,
        };
        Some((FrameNumber::from_addr((entry & 0x0000_ffff_ffff_f000) as u32), flags))
    }

    fn activate(&self) {
        unsafe {
            barriers::set_ttbr0(self.root_phys());
            barriers::invalidate_tlb_all();
        }
    }

    fn destroy(self) {
        for l1_index in 0..LONG_ENTRIES {
            let l1_entry =
                unsafe { Self::table_ptr(self.l1_frame.addr()).add(l1_index).read_volatile() };
            if l1_entry & LONG_DESC_VALID == 0 {
                continue;
            }
            let l2_phys = (l1_entry & 0x0000_ffff_ffff_f000) as u32;
            for l2_index in 0..LONG_ENTRIES {
                let l2_entry = unsafe { Self::table_ptr(l2_phys).add(l2_index).read_volatile() };
                if l2_entry & LONG_DESC_VALID == 0 {
                    continue;
                }
                let l3_phys = (l2_entry & 0x0000_ffff_ffff_f000) as u32;
                frame_allocator::free(FrameNumber::from_addr(l3_phys), 1);
            }
            frame_allocator::free(FrameNumber::from_addr(l2_phys), 1);
        }
        frame_allocator::free(self.l1_frame, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_flags_helpers_agree_with_intent() {
        assert!(MapFlags::kernel_code().executable);
        assert!(!MapFlags::kernel_code().user);
        assert!(MapFlags::user_rw().user);
        assert!(MapFlags::user_rw().writable);
        assert!(!MapFlags::user_code().writable);
    }
}
