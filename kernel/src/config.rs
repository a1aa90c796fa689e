//! Compile-time kernel configuration.
//!
//! Hard-coded virtual-layout constants live here instead of scattered across
//! subsystems, per the single-header convention: every constant a subsystem
//! treats as fixed is documented at its one definition site.

/// Size of a physical/virtual page frame on ARMv6/ARMv7.
pub const FRAME_SIZE: usize = 4096;

/// Start of the kernel half of every address space. Identical in every
/// [`Context`](crate::mm::vas::Context) — user contexts point at the same
/// leaf tables for this range and above.
pub const KERNEL_HALF_START: usize = 0xC000_0000;

/// Start of the kernel heap's virtual range.
pub const HEAP_START: usize = 0xD000_0000;

/// Upper bound of the kernel heap's virtual range (exclusive).
pub const HEAP_MAX: usize = 0xD400_0000;

/// Heap will not return extent pages to C1/C2 while at or below this size,
/// to avoid thrashing on workloads that allocate-free around a boundary.
pub const HEAP_MIN_SIZE: usize = 64 * 1024;

/// Start of the fixed kernel-virtual window used for temporary mappings of
/// foreign contexts (see `Context::prepare_temporary`).
pub const TEMPORARY_WINDOW_START: usize = 0xD800_0000;

/// Size of the temporary mapping window.
pub const TEMPORARY_WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// Top of the user stack region; stacks grow down from here within a
/// process's stack-slot manager.
pub const USER_STACK_TOP: usize = 0xB000_0000;

/// Kernel stack size allocated per thread, in frames.
pub const KERNEL_STACK_PAGES: usize = 2;

/// Maximum nesting depth of trap handlers before the kernel panics.
pub const NESTED_MAX: u32 = 4;

/// Maximum number of threads a single process may hold.
pub const MAX_THREADS_PER_PROCESS: usize = 256;

/// Number of distinct IRQ sources the platform's controller can report.
pub const MAX_IRQ: u32 = 128;
