//! Memory management: physical frames, address spaces, and the kernel heap.

pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod vas;

pub use frame_allocator::FrameNumber;
pub use heap::KernelHeap;
pub use page_table::{LongFormat, MapFlags, PagingFormat, ShortFormat};
pub use vas::{Context, ContextKind};

use crate::arch::{self, PagingFormatKind};
use crate::config::FRAME_SIZE;
use crate::sync::once_lock::GlobalState;

/// Which paging format this boot selected, set once by [`init`].
static SELECTED_FORMAT: GlobalState<PagingFormatKind> = GlobalState::new();

/// Bring up memory management: probe the paging format, hand the placement
/// allocator its initial range, and leave the bitmap transition to the
/// caller once the full memory map is known (spec §4.1/§4.2 "at boot").
///
/// # Safety
/// Must run exactly once, before any frame or mapping operation, with
/// interrupts disabled.
pub unsafe fn init(placement_start_frame: usize, placement_limit_frame: usize) {
    let format = arch::probe_paging_format();
    let _ = SELECTED_FORMAT.init(format);
    frame_allocator::placement_init(placement_start_frame, placement_limit_frame);
    log::info!("selected paging format: {format:?}");
}

/// Which paging format this boot selected.
pub fn paging_format() -> PagingFormatKind {
    SELECTED_FORMAT.with(|f| *f).expect("mm::init not called")
}

/// Complete the placement-to-bitmap transition once the full physical memory
/// map has been surveyed (spec §4.1 "Phases").
pub fn transition_to_bitmap(base_frame: usize, total_frames: usize) {
    frame_allocator::transition_to_bitmap(base_frame, total_frames);
}

/// Reserve every frame covering `[addr, addr + size)` (spec §4.1: "used
/// during initialization to reserve the kernel image, initial tables, MMIO
/// windows, and the ramdisk").
pub fn mark_range_used(addr: usize, size: usize) {
    frame_allocator::mark_range_used(addr, size);
}

/// Counterpart to [`mark_range_used`].
pub fn mark_range_free(addr: usize, size: usize) {
    frame_allocator::mark_range_free(addr, size);
}

/// Round `addr` down to the nearest frame boundary.
pub const fn frame_align_down(addr: usize) -> usize {
    addr & !(FRAME_SIZE - 1)
}

/// Round `addr` up to the nearest frame boundary.
pub const fn frame_align_up(addr: usize) -> usize {
    (addr + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)
}

/// Number of frames needed to cover `size` bytes.
pub const fn frames_for(size: usize) -> usize {
    frame_align_up(size) / FRAME_SIZE
}
