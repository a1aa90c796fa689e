//! Kernel heap.
//!
//! A demand-growing extent allocator: a first-fit free list of blocks, each
//! carrying a header with a magic guard word so corruption (double-free,
//! writing past an allocation) is caught on the next operation that touches
//! the header. Unlike a bump or slab design, a freed block returns to the
//! free list directly; the heap only gives pages back to C2 when it shrinks
//! below [`HEAP_MIN_SIZE`] convent from the high end.
//!
//! The heap starts empty and grows one mapping at a time via
//! [`Context::map_random`] on the kernel context, rather than reserving all
//! of `HEAP_START..HEAP_MAX` up front — spec §4.3 "demand-growing".

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Mutex;

use crate::config::{HEAP_MAX, HEAP_MIN_SIZE, HEAP_START};
use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::MapFlags;
use crate::mm::vas::Context;

/// Marks a live block header; corrupted if read back as anything else.
const MAGIC_LIVE: u32 = 0x4845_4150; // "HEAP"
/// Marks a freed block header, so a double-free is caught rather than
/// silently re-linking the free list.
const MAGIC_FREE: u32 = 0x4645_4544; // "FEED"

const ALIGN: usize = 8;

/// Header immediately preceding every block this allocator hands out.
#[repr(C)]
struct BlockHeader {
    magic: u32,
    /// Usable size in bytes, excluding this header.
    size: usize,
    next_free: Option<NonNull<BlockHeader>>,
}

impl BlockHeader {
    unsafe fn data_ptr(header: NonNull<BlockHeader>) -> *mut u8 {
        unsafe { (header.as_ptr() as *mut u8).add(HEADER_SIZE) }
    }

    unsafe fn from_data_ptr(data: *mut u8) -> NonNull<BlockHeader> {
        let header = unsafe { data.sub(HEADER_SIZE) as *mut BlockHeader };
        unsafe { NonNull::new_unchecked(header) }
    }
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

struct HeapState {
    /// Singly linked free list, addresses strictly increasing is not
    /// required; first-fit walks it in list order.
    free_list: Option<NonNull<BlockHeader>>,
    /// One past the highest mapped byte of the heap region.
    extent_end: usize,
    mapped_bytes: usize,
}

// SAFETY: all access goes through the outer Mutex.
unsafe impl Send for HeapState {}

/// Kernel heap allocator, installed as the `#[global_allocator]`.
pub struct KernelHeap {
    state: Mutex<Option<HeapState>>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Bring the heap up with its first extent. Must run once, after C2's
    /// kernel context exists.
    pub fn init(&self) -> KernelResult<()> {
        let mut guard = self.state.lock();
        if guard.is_some() {
            return Err(KernelError::AlreadyExists {
                resource: "kernel heap",
                id: 0,
            });
        }
        let mut state = HeapState {
            free_list: None,
            extent_end: HEAP_START,
            mapped_bytes: 0,
        };
        grow(&mut state, HEAP_MIN_SIZE)?;
        *guard = Some(state);
        Ok(())
    }

    fn alloc_inner(&self, layout: Layout) -> *mut u8 {
        let requested = align_up(layout.size().max(1), ALIGN);
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return core::ptr::null_mut();
        };

        if let Some(block) = take_free_block(state, requested) {
            // SAFETY: `block` came from our own free list, still mapped.
            unsafe {
                (*block.as_ptr()).magic = MAGIC_LIVE;
                return BlockHeader::data_ptr(block);
            }
        }

        let needed = HEADER_SIZE + requested;
        let grow_amount = needed.max(HEAP_MIN_SIZE);
        if grow(state, grow_amount).is_err() {
            return core::ptr::null_mut();
        }
        match take_free_block(state, requested) {
            Some(block) => unsafe {
                (*block.as_ptr()).magic = MAGIC_LIVE;
                BlockHeader::data_ptr(block)
            },
            None => core::ptr::null_mut(),
        }
    }

    fn dealloc_inner(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: `ptr` was returned by `alloc_inner`, so it has a valid
        // header immediately before it.
        let mut header = unsafe { BlockHeader::from_data_ptr(ptr) };
        // SAFETY: header is a live allocation's header, exclusively ours
        // while we hold the heap lock below.
        unsafe {
            let h = header.as_mut();
            assert_eq!(h.magic, MAGIC_LIVE, "heap corruption: bad magic on free");
            h.magic = MAGIC_FREE;
        }
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };
        unsafe {
            header.as_mut().next_free = state.free_list;
        }
        state.free_list = Some(header);
    }

    /// Usable size of a live allocation, for realloc-in-place decisions
    /// (spec §4.3 "allocated_length retrievable for realloc").
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by this allocator and not
    /// yet freed.
    pub unsafe fn allocated_length(&self, ptr: *mut u8) -> usize {
        let header = unsafe { BlockHeader::from_data_ptr(ptr) };
        unsafe {
            assert_eq!((*header.as_ptr()).magic, MAGIC_LIVE, "heap corruption: bad magic on query");
            (*header.as_ptr()).size
        }
    }

    /// Bytes currently mapped into the heap extent, for diagnostics.
    pub fn mapped_bytes(&self) -> usize {
        self.state.lock().as_ref().map(|s| s.mapped_bytes).unwrap_or(0)
    }

    /// Resize a live allocation: allocate `new_size`, copy
    /// `min(old_size, new_size)` bytes, free the original (spec §4.3
    /// "reallocate").
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by this allocator and not
    /// yet freed.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> KernelResult<*mut u8> {
        let old_size = unsafe { self.allocated_length(ptr) };
        if new_size <= old_size {
            return Ok(ptr);
        }
        let layout = unsafe {
            Layout::from_size_align_unchecked(new_size, ALIGN)
        };
        let new_ptr = self.alloc_inner(layout);
        if new_ptr.is_null() {
            return Err(KernelError::OutOfMemory {
                requested_frames: crate::mm::frames_for(new_size),
            });
        }
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        }
        self.dealloc_inner(ptr);
        Ok(new_ptr)
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Map `amount` additional bytes (rounded up to whole frames) onto the end
/// of the heap extent and push the new space onto the free list as one
/// block (spec §4.3 "grows ... via C2's map_random").
fn grow(state: &mut HeapState, amount: usize) -> KernelResult<()> {
    if state.extent_end + amount > HEAP_MAX {
        return Err(KernelError::OutOfMemory {
            requested_frames: crate::mm::frames_for(amount),
        });
    }
    let frame_count = crate::mm::frames_for(amount);
    let base = Context::kernel().map_random(frame_count, MapFlags::kernel_rw())?;
    debug_assert_eq!(base, state.extent_end, "heap extent must grow contiguously");

    let mapped = frame_count * crate::config::FRAME_SIZE;
    state.extent_end += mapped;
    state.mapped_bytes += mapped;

    let header_ptr = base as *mut BlockHeader;
    // SAFETY: `base` is freshly mapped, zeroed, exclusively-owned memory at
    // least `mapped` bytes long.
    unsafe {
        header_ptr.write(BlockHeader {
            magic: MAGIC_FREE,
            size: mapped - HEADER_SIZE,
            next_free: state.free_list,
        });
    }
    state.free_list = NonNull::new(header_ptr);
    Ok(())
}

/// Remove and return the first free block at least `requested` bytes, first
/// fit. Splits the block if the remainder can itself hold a header plus a
/// non-trivial amount of data.
fn take_free_block(state: &mut HeapState, requested: usize) -> Option<NonNull<BlockHeader>> {
    let mut prev: Option<NonNull<BlockHeader>> = None;
    let mut cursor = state.free_list;

    while let Some(mut block) = cursor {
        // SAFETY: every node on the free list is a mapped, live header.
        let (size, next) = unsafe { (block.as_ref().size, block.as_ref().next_free) };
        if size >= requested {
            match prev {
                Some(mut p) => unsafe { p.as_mut().next_free = next },
                None => state.free_list = next,
            }

            let remainder = size.saturating_sub(requested + HEADER_SIZE);
            if remainder >= ALIGN {
                // SAFETY: splitting within memory owned by this block.
                unsafe {
                    let split_ptr =
                        (BlockHeader::data_ptr(block) as *mut u8).add(requested) as *mut BlockHeader;
                    split_ptr.write(BlockHeader {
                        magic: MAGIC_FREE,
                        size: remainder,
                        next_free: state.free_list,
                    });
                    state.free_list = NonNull::new(split_ptr);
                    block.as_mut().size = requested;
                }
            }
            return Some(block);
        }
        prev = Some(block);
        cursor = next;
    }
    None
}

// SAFETY: allocation/deallocation are internally synchronized by the heap's
// own mutex; neither call retains references across the lock.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_inner(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.dealloc_inner(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
    }
}
