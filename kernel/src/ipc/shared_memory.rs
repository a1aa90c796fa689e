//! Named shared-memory regions with refcount-gated frame freeing (spec
//! §4.7). A region's backing frames are freed exactly once: when its
//! refcount drops to zero and it has been marked for destruction (spec §8
//! "Shared-memory refcount").

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{self, FrameNumber};
use crate::mm::page_table::MapFlags;
use crate::mm::vas::Context;

/// A named block of physical frames, mappable into any number of contexts.
pub struct SharedRegion {
    frames: Vec<FrameNumber>,
    ref_count: AtomicU32,
    destroy_pending: bool,
}

impl SharedRegion {
    pub fn size_bytes(&self) -> usize {
        self.frames.len() * crate::config::FRAME_SIZE
    }
}

/// Number of frames backing `name`, if it exists. Callers that `acquire` a
/// region need this to later `release` the same number of pages.
pub fn frame_count(name: &str) -> Option<usize> {
    REGISTRY.lock().regions.get(name).map(|r| r.frames.len())
}

struct Registry {
    regions: BTreeMap<String, SharedRegion>,
}

impl Registry {
    const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

/// Allocate `frame_count` fresh frames and register them under `name`.
/// Rejects a name that already exists (spec §4.7 `create`).
pub fn create(name: String, frame_count: usize) -> KernelResult<()> {
    if frame_count == 0 {
        return Err(KernelError::InvalidArgument { name: "frame_count" });
    }
    let mut registry = REGISTRY.lock();
    if registry.regions.contains_key(&name) {
        return Err(KernelError::AlreadyExists {
            resource: "shared region",
            id: 0,
        });
    }
    let base = frame_allocator::allocate(frame_count, 1).map_err(|_| KernelError::OutOfMemory {
        requested_frames: frame_count,
    })?;
    let frames = (0..frame_count as u32).map(|i| FrameNumber::new(base.0 + i)).collect();
    registry.regions.insert(
        name,
        SharedRegion {
            frames,
            ref_count: AtomicU32::new(0),
            destroy_pending: false,
        },
    );
    Ok(())
}

/// Map `name`'s frames into `context` at the next free address in its mmap
/// region, bumping its refcount (spec §4.7 `acquire`). Returns the base
/// virtual address.
pub fn acquire(name: &str, context: &Context, flags: MapFlags) -> KernelResult<usize> {
    let frames = {
        let registry = REGISTRY.lock();
        let region = registry.regions.get(name).ok_or(KernelError::NotFound {
            resource: "shared region",
            id: 0,
        })?;
        region.frames.clone()
    };

    let base = context.reserve_random(frames.len())?;
    for (i, frame) in frames.iter().enumerate() {
        let vaddr = base + i * crate::config::FRAME_SIZE;
        context.map(vaddr, *frame, flags)?;
    }

    let mut registry = REGISTRY.lock();
    if let Some(region) = registry.regions.get_mut(name) {
        region.ref_count.fetch_add(1, Ordering::AcqRel);
    }
    Ok(base)
}

/// Unmap a previously acquired region from `context` and drop its refcount.
/// If the count reaches zero and the region is destroy-pending, its frames
/// are freed now (spec §4.7 `release`, §8 refcount invariant).
pub fn release(name: &str, context: &Context, base: usize, frame_count: usize) -> KernelResult<()> {
    for i in 0..frame_count {
        let vaddr = base + i * crate::config::FRAME_SIZE;
        let _ = context.unmap_foreign(vaddr);
    }

    let mut registry = REGISTRY.lock();
    let should_free = if let Some(region) = registry.regions.get_mut(name) {
        let remaining = region.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        remaining == 0 && region.destroy_pending
    } else {
        false
    };
    if should_free {
        if let Some(region) = registry.regions.remove(name) {
            for frame in region.frames {
                frame_allocator::free(frame, 1);
            }
        }
    }
    Ok(())
}

/// Mark `name` for destruction: frees its frames immediately if nothing
/// currently holds it, otherwise defers to the last [`release`].
pub fn destroy(name: &str) -> KernelResult<()> {
    let mut registry = REGISTRY.lock();
    let region = registry.regions.get_mut(name).ok_or(KernelError::NotFound {
        resource: "shared region",
        id: 0,
    })?;
    region.destroy_pending = true;
    if region.ref_count.load(Ordering::Acquire) == 0 {
        if let Some(region) = registry.regions.remove(name) {
            for frame in region.frames {
                frame_allocator::free(frame, 1);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_with_zero_refcount_frees_immediately() {
        create("test-region-a".into(), 1).unwrap();
        destroy("test-region-a").unwrap();
        assert!(!REGISTRY.lock().regions.contains_key("test-region-a"));
    }

    #[test]
    fn create_rejects_duplicate_name() {
        create("test-region-b".into(), 1).unwrap();
        assert!(create("test-region-b".into(), 1).is_err());
        destroy("test-region-b").unwrap();
    }
}
