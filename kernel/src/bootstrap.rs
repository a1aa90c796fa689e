//! Kernel boot sequence (spec §4, §6, §8 "Cold boot").
//!
//! The entry stub — board bring-up before the MMU and a stack exist, out of
//! scope here — hands control to [`run`] once it can make two Rust-level
//! calls: install a console (`print::init`) and jump in with the board's
//! concrete [`irq::IrqController`]. From there `run` brings up every
//! subsystem in dependency order, loads `init` off the ramdisk, and falls
//! into the idle loop that the `InterruptCleanup` event's `schedule()` then
//! drives for the rest of the system's life.

use crate::board::{RAM_BASE, RAM_BYTES};
use crate::config::FRAME_SIZE;
use crate::error::KernelResult;
use crate::irq::IrqController;
use crate::mm::vas::Context;
use crate::sched::Priority;
use crate::{elf, event, irq, log_service, mm, process, ramdisk};

/// End of the kernel image in physical memory; the ramdisk immediately
/// follows it (spec §6 "Ramdisk format"). Provided by the (out-of-scope)
/// linker script.
extern "C" {
    static _kernel_end: u8;
}

/// Name of the one executable the cold-boot scenario expects on the
/// ramdisk (spec §8 scenario 1).
const INIT_NAME: &str = "init";

/// Bring up every subsystem, in the order each depends on the last.
///
/// # Safety
/// Must run exactly once, early in boot, before any other kernel code
/// touches memory management, and with interrupts disabled throughout
/// (the IRQ manager and scheduler are not yet armed to receive them).
unsafe fn kernel_init(controller: &'static dyn IrqController) -> KernelResult<()> {
    log_service::init();
    log::info!("kernel boot starting");

    // SAFETY: taking the address of an extern static, never dereferenced.
    let kernel_end = unsafe { &_kernel_end as *const u8 as usize };
    let placement_start = mm::frame_align_up(kernel_end) / FRAME_SIZE;
    let total_frames = RAM_BYTES / FRAME_SIZE;

    // SAFETY: first touch of memory management, interrupts disabled, as
    // required by `mm::init`.
    unsafe {
        mm::init(placement_start, total_frames);
    }
    Context::init_kernel()?;
    // The reference board's memory map is known ahead of time (no ATAGS/DTB
    // walk, which is board bring-up), so the bitmap transition can happen
    // immediately instead of waiting on a separate memory survey.
    mm::transition_to_bitmap(RAM_BASE / FRAME_SIZE, total_frames);

    // Reserve the ramdisk's footprint now, before the heap or anything else
    // can claim a frame inside it (spec §4.1: "reserve ... the ramdisk").
    let ramdisk_base = kernel_end;
    let ramdisk_limit = RAM_BYTES - (ramdisk_base - RAM_BASE);
    // SAFETY: `ramdisk_base` points just past the kernel image, within the
    // fixed RAM window set up above; `ramdisk_limit` bounds the scan to it.
    let ramdisk_size = unsafe { ramdisk::extent(ramdisk_base as *const u8, ramdisk_limit) };
    mm::mark_range_used(ramdisk_base, ramdisk_size);

    crate::ALLOCATOR.init()?;
    log::info!("kernel heap online");

    event::init()?;
    crate::sched::init()?;
    irq::init(controller)?;
    process::init()?;
    log::info!("core subsystems online");

    Ok(())
}

/// Locate `init` on the ramdisk and load it as the first user process (spec
/// §8 scenario 1: "init's pid is 1").
fn create_init_process() -> KernelResult<(process::ProcessId, process::ThreadId)> {
    // SAFETY: taking the address of an extern static, never dereferenced
    // directly; the linker guarantees `_kernel_end` is a valid symbol.
    let ramdisk_base = unsafe { &_kernel_end as *const u8 };
    let ramdisk_limit = RAM_BYTES - (ramdisk_base as usize - RAM_BASE);

    // SAFETY: `ramdisk_base` points just past the kernel image, within the
    // fixed RAM window configured in `kernel_init`; `ramdisk_limit` bounds
    // the scan to that window.
    let image = unsafe { ramdisk::find(ramdisk_base, ramdisk_limit, INIT_NAME) }
        .ok_or(crate::error::KernelError::NotFound {
            resource: "ramdisk entry",
            id: 0,
        })?;

    process::create_user_process_with("init", Priority::DEFAULT, process::KERNEL_PID, |context| {
        let loaded = elf::load(context, image)?;
        Ok(loaded.entry)
    })
}

/// Kernel entry point, called once the (out-of-scope) entry stub has set up
/// the MMU, a kernel stack, and a console (`print::init`), and has jumped
/// here in SVC mode with the board's concrete [`IrqController`].
///
/// Never returns: every subsequent transfer of control happens through the
/// scheduler, driven by the `InterruptCleanup` event off the back of
/// hardware interrupts.
pub fn run(controller: &'static dyn IrqController) -> ! {
    // SAFETY: this is the one and only call, made before anything else in
    // the kernel has touched memory management or scheduling.
    if let Err(e) = unsafe { kernel_init(controller) } {
        panic!("boot failed: {e:?}");
    }

    match create_init_process() {
        Ok((pid, _tid)) => log::info!("init process created, pid={}", pid.0),
        Err(e) => log::error!("failed to create init process: {e:?}"),
    }

    println!("BOOTOK");

    // `schedule()` only ever runs off the back of the InterruptCleanup
    // event (spec §4.6); this loop just gives the core something to do
    // between interrupts until the timer's first tick arrives.
    loop {
        event::drain();
        crate::arch::wait_for_interrupt();
    }
}
