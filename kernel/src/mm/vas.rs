//! Address-space contexts.
//!
//! A [`Context`] wraps one root translation table plus the bookkeeping the
//! rest of the kernel needs to grow and inspect it: a bump cursor for
//! `map_random`, and a temporary-mapping window for touching frames that
//! belong to some other (possibly foreign, possibly inactive) context
//! without switching `TTBR0` (spec §4.2 "Temporary mappings").
//!
//! KERNEL and USER contexts differ only in which half of the address space
//! they own: every context's kernel half (`KERNEL_HALF_START..`) is backed
//! by the same leaf tables as the one true kernel context, so a syscall entry
//! never needs to switch tables to see kernel code and data.

use spin::{Mutex, Once};

use crate::arch::PagingFormatKind;
use crate::config::{FRAME_SIZE, KERNEL_HALF_START, TEMPORARY_WINDOW_SIZE, TEMPORARY_WINDOW_START};
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{self, FrameNumber};
use crate::mm::page_table::{LongFormat, MapFlags, PagingFormat, ShortFormat};
use crate::mm::{self};

/// Dispatches to whichever concrete page-table format this boot selected.
/// `PagingFormat::new_root` returns `Self`, which rules out a trait object;
/// this enum is the runtime-selected equivalent (spec §9: "model the two
/// page-table formats as implementations of one small trait").
enum AnyTable {
    Short(ShortFormat),
    Long(LongFormat),
}

impl AnyTable {
    fn new() -> KernelResult<Self> {
        match mm::paging_format() {
            PagingFormatKind::Short => Ok(AnyTable::Short(ShortFormat::new_root()?)),
            PagingFormatKind::Long => Ok(AnyTable::Long(LongFormat::new_root()?)),
        }
    }

    fn root_phys(&self) -> u32 {
        match self {
            AnyTable::Short(t) => t.root_phys(),
            AnyTable::Long(t) => t.root_phys(),
        }
    }

    fn map(&mut self, vaddr: u32, frame: FrameNumber, flags: MapFlags) -> KernelResult<()> {
        match self {
            AnyTable::Short(t) => t.map(vaddr, frame, flags),
            AnyTable::Long(t) => t.map(vaddr, frame, flags),
        }
    }

    fn unmap(&mut self, vaddr: u32) -> KernelResult<FrameNumber> {
        match self {
            AnyTable::Short(t) => t.unmap(vaddr),
            AnyTable::Long(t) => t.unmap(vaddr),
        }
    }

    fn resolve(&self, vaddr: u32) -> Option<(FrameNumber, MapFlags)> {
        match self {
            AnyTable::Short(t) => t.resolve(vaddr),
            AnyTable::Long(t) => t.resolve(vaddr),
        }
    }

    fn activate(&self) {
        match self {
            AnyTable::Short(t) => t.activate(),
            AnyTable::Long(t) => t.activate(),
        }
    }

    fn destroy(self) {
        match self {
            AnyTable::Short(t) => t.destroy(),
            AnyTable::Long(t) => t.destroy(),
        }
    }

    fn step_size(&self) -> u32 {
        match self {
            AnyTable::Short(_) => 1 << 20, // one L1 section
            AnyTable::Long(_) => 1 << 30,  // one L1 block
        }
    }
}

/// Which half of a [`Context`] is live. A KERNEL context owns the entire
/// address space; a USER context owns only the lower half and shares the
/// upper half's leaf tables with the kernel context (spec §3 process `type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Kernel,
    User,
}

/// One address space: a root table plus the cursors needed to grow it.
pub struct Context {
    kind: ContextKind,
    table: Mutex<AnyTable>,
    /// Next candidate address for `map_random`, reset per context.
    mmap_cursor: Mutex<usize>,
}

/// The one true kernel context. Every USER context's kernel half points at
/// this context's leaf tables.
static KERNEL_CONTEXT: Once<Context> = Once::new();

impl Context {
    /// Create the kernel context. Must run exactly once, before any user
    /// context is created.
    pub fn init_kernel() -> KernelResult<()> {
        let table = AnyTable::new()?;
        KERNEL_CONTEXT.call_once(|| Context {
            kind: ContextKind::Kernel,
            table: Mutex::new(table),
            mmap_cursor: Mutex::new(KERNEL_HALF_START),
        });
        Ok(())
    }

    /// Borrow the kernel context.
    pub fn kernel() -> &'static Context {
        KERNEL_CONTEXT.get().expect("Context::init_kernel not called")
    }

    /// Create a new user context, sharing the kernel context's upper half.
    pub fn new_user() -> KernelResult<Self> {
        let mut table = AnyTable::new()?;
        Self::share_kernel_half(&mut table);
        Ok(Self {
            kind: ContextKind::User,
            table: Mutex::new(table),
            mmap_cursor: Mutex::new(0x0001_0000),
        })
    }

    /// Point this table's kernel-half leaf entries at the same physical
    /// tables the kernel context uses, so a fresh user context never takes a
    /// fault on kernel code/data (spec §4.2: contexts "share a kernel half
    /// via identical leaf table pointers"). Uses whichever granularity the
    /// active format maps at its top level (1 MiB short-format sections,
    /// 1 GiB long-format L1 blocks) to cover the shared range with one
    /// `resolve`+`map` pair per step rather than per page.
    fn share_kernel_half(table: &mut AnyTable) {
        let kernel = Self::kernel();
        let kernel_table = kernel.table.lock();
        let step = table.step_size();
        let mut vaddr = KERNEL_HALF_START as u32;
        loop {
            if let Some((frame, flags)) = kernel_table.resolve(vaddr) {
                let _ = table.map(vaddr, frame, flags);
            }
            match vaddr.checked_add(step) {
                Some(next) if next > vaddr => vaddr = next,
                _ => break,
            }
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn root_phys(&self) -> u32 {
        self.table.lock().root_phys()
    }

    /// Map one page at a caller-chosen address.
    pub fn map(&self, vaddr: usize, frame: FrameNumber, flags: MapFlags) -> KernelResult<()> {
        self.table.lock().map(vaddr as u32, frame, flags)
    }

    /// Allocate `frame_count` fresh physical frames and map them at the next
    /// free address in this context's mmap region, returning the base
    /// virtual address. Used by the heap to grow (spec §4.3 "grows ... via
    /// C2's map_random").
    pub fn map_random(&self, frame_count: usize, flags: MapFlags) -> KernelResult<usize> {
        if frame_count == 0 {
            return Err(KernelError::InvalidArgument { name: "frame_count" });
        }
        let mut cursor = self.mmap_cursor.lock();
        let base = *cursor;
        let mut mapped = 0;
        for i in 0..frame_count {
            let frame = frame_allocator::allocate(1, 1).map_err(|_| KernelError::OutOfMemory {
                requested_frames: frame_count - i,
            })?;
            let vaddr = base + i * FRAME_SIZE;
            let mut table = self.table.lock();
            if let Err(e) = table.map(vaddr as u32, frame, flags) {
                frame_allocator::free(frame, 1);
                for j in 0..mapped {
                    let rollback_vaddr = base + j * FRAME_SIZE;
                    if let Ok(f) = table.unmap(rollback_vaddr as u32) {
                        frame_allocator::free(f, 1);
                    }
                }
                return Err(e);
            }
            mapped += 1;
        }
        *cursor = base + frame_count * FRAME_SIZE;
        Ok(base)
    }

    /// Unmap one page, freeing its backing frame.
    pub fn unmap(&self, vaddr: usize) -> KernelResult<()> {
        let frame = self.table.lock().unmap(vaddr as u32)?;
        frame_allocator::free(frame, 1);
        self.flush_address(vaddr);
        Ok(())
    }

    /// Reserve `frame_count` pages of virtual address space in this
    /// context's mmap region without backing or mapping them. Used to pick
    /// an address range for frames that come from elsewhere (a named shared
    /// region) rather than from a fresh allocation (spec §4.7 `acquire`).
    pub fn reserve_random(&self, frame_count: usize) -> KernelResult<usize> {
        if frame_count == 0 {
            return Err(KernelError::InvalidArgument { name: "frame_count" });
        }
        let mut cursor = self.mmap_cursor.lock();
        let base = *cursor;
        *cursor = base + frame_count * FRAME_SIZE;
        Ok(base)
    }

    /// Unmap one page without freeing its backing frame: the frame belongs
    /// to whatever foreign owner mapped it here (a named shared region, or
    /// another context's `map_temporary`), not to this context.
    pub fn unmap_foreign(&self, vaddr: usize) -> KernelResult<()> {
        self.table.lock().unmap(vaddr as u32)?;
        self.flush_address(vaddr);
        Ok(())
    }

    pub fn resolve(&self, vaddr: usize) -> Option<(FrameNumber, MapFlags)> {
        self.table.lock().resolve(vaddr as u32)
    }

    pub fn activate(&self) {
        self.table.lock().activate();
    }

    pub fn flush_address(&self, vaddr: usize) {
        unsafe {
            crate::arch::barriers::invalidate_tlb_entry(vaddr);
        }
    }

    pub fn flush_all(&self) {
        unsafe {
            crate::arch::barriers::invalidate_tlb_all();
        }
    }

    /// Map a single foreign frame into the fixed temporary window so kernel
    /// code can touch a page belonging to a context that is not currently
    /// active (spec §4.2 "Temporary mappings": "touching foreign contexts
    /// without activating them"). Returns the temporary virtual address.
    pub fn map_temporary(&self, frame: FrameNumber, flags: MapFlags) -> KernelResult<usize> {
        let vaddr = TEMPORARY_WINDOW_START;
        self.table.lock().map(vaddr as u32, frame, flags)?;
        self.flush_address(vaddr);
        Ok(vaddr)
    }

    /// Undo a [`map_temporary`] mapping without freeing the backing frame
    /// (the frame belongs to the foreign context, not this one).
    pub fn unmap_temporary(&self) -> KernelResult<()> {
        let vaddr = TEMPORARY_WINDOW_START as u32;
        self.table.lock().unmap(vaddr)?;
        self.flush_address(vaddr as usize);
        Ok(())
    }

    /// Reserve the temporary mapping window. Kept as an explicit step,
    /// separate from [`map_temporary`], so a future format with its own
    /// intermediate-table setup has somewhere to do it once per context
    /// rather than on every mapping.
    pub fn prepare_temporary(&self) -> KernelResult<()> {
        debug_assert!(TEMPORARY_WINDOW_SIZE >= FRAME_SIZE);
        Ok(())
    }

    /// Destroy this context, freeing every frame it owns. The kernel context
    /// must never be destroyed.
    pub fn destroy(self) -> KernelResult<()> {
        if self.kind == ContextKind::Kernel {
            return Err(KernelError::PermissionDenied {
                operation: "destroy kernel context",
            });
        }
        self.table.into_inner().destroy();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_kind_distinguishes_kernel_from_user() {
        assert_ne!(ContextKind::Kernel, ContextKind::User);
    }
}
