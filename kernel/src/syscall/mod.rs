//! Syscall dispatch (spec §6).
//!
//! Entered from `arch::trap`'s SWI path with the trapped thread's
//! [`TrapFrame`]; arguments come from `r0..r3` and the return value goes
//! back in `r0`. Every syscall number not in the table is rejected with
//! `InvalidArgument`.

extern crate alloc;

use alloc::vec::Vec;

use crate::arch::context::TrapFrame;
use crate::error::{KernelError, KernelResult};
use crate::ipc::message;
use crate::mm::page_table::MapFlags;
use crate::mm::vas::Context;
use crate::process::{self, ProcessId, ThreadId};
use crate::sched;

/// Syscall numbers (spec §6 table). 9 is reserved; no syscall is assigned
/// to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    ProcessCreate,
    ProcessExit,
    ProcessId,
    ProcessParentId,
    ProcessKill,
    ThreadId,
    ThreadCreate,
    ThreadExit,
    ThreadKill,
    KernelPutc,
    KernelPuts,
    MessageSend,
    Mmap,
}

impl TryFrom<u32> for Syscall {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            1 => Ok(Self::ProcessCreate),
            2 => Ok(Self::ProcessExit),
            3 => Ok(Self::ProcessId),
            4 => Ok(Self::ProcessParentId),
            5 => Ok(Self::ProcessKill),
            6 => Ok(Self::ThreadId),
            7 => Ok(Self::ThreadCreate),
            8 => Ok(Self::ThreadExit),
            10 => Ok(Self::ThreadKill),
            11 => Ok(Self::KernelPutc),
            12 => Ok(Self::KernelPuts),
            20 => Ok(Self::MessageSend),
            21 => Ok(Self::Mmap),
            _ => Err(()),
        }
    }
}

/// Confirm every page in `[ptr, ptr+len)` is mapped in `context` before the
/// kernel dereferences it (spec §6 "Input validation").
fn validate_user_range(context: &Context, ptr: usize, len: usize) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let start = crate::mm::frame_align_down(ptr);
    let end = crate::mm::frame_align_up(ptr.saturating_add(len));
    let mut page = start;
    while page < end {
        if context.resolve(page).is_none() {
            return Err(KernelError::Unmapped { addr: page });
        }
        page += crate::config::FRAME_SIZE;
    }
    Ok(())
}

fn current_process_or_err() -> KernelResult<ProcessId> {
    process::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })
}

fn current_thread_or_err() -> KernelResult<ThreadId> {
    process::current_thread().ok_or(KernelError::NotInitialized {
        subsystem: "current thread",
    })
}

/// Entry point called from the trap path on an SWI (spec §4.4: "performs the
/// syscall inline"). Dispatches on `frame.r7` (conventional ARM syscall
/// number register) and writes the result back into `frame.r0`.
pub fn dispatch(frame: &mut TrapFrame) {
    let args = frame.syscall_args();
    let result = match Syscall::try_from(frame.r7) {
        Ok(syscall) => handle(syscall, args),
        Err(()) => Err(KernelError::InvalidArgument { name: "syscall number" }),
    };
    frame.set_return_value(match result {
        Ok(value) => value as isize,
        Err(e) => e.to_errno(),
    });
}

fn handle(syscall: Syscall, args: [u32; 4]) -> KernelResult<usize> {
    match syscall {
        Syscall::ProcessCreate => sys_process_create(args[0] as usize, args[1] as usize),
        Syscall::ProcessExit => sys_process_exit(),
        Syscall::ProcessId => sys_process_id(),
        Syscall::ProcessParentId => sys_process_parent_id(),
        Syscall::ProcessKill => sys_process_kill(args[0] as u64),
        Syscall::ThreadId => sys_thread_id(),
        Syscall::ThreadCreate => sys_thread_create(args[0] as usize, args[1]),
        Syscall::ThreadExit => sys_thread_exit(),
        Syscall::ThreadKill => sys_thread_kill(args[0] as u64),
        Syscall::KernelPutc => sys_kernel_putc(args[0]),
        Syscall::KernelPuts => sys_kernel_puts(args[0] as usize, args[1] as usize),
        Syscall::MessageSend => sys_message_send(args[0] as u64, args[1], args[2] as usize, args[3] as usize),
        Syscall::Mmap => sys_mmap(args[0] as usize, args[1] as usize),
    }
}

/// `process_create(image_ptr) -> pid`: loads an ELF image mapped in the
/// caller's address space into a fresh USER process (spec §6).
fn sys_process_create(image_ptr: usize, image_len: usize) -> KernelResult<usize> {
    let caller = current_process_or_err()?;
    let image = read_user_bytes(caller, image_ptr, image_len)?;

    let (pid, _tid) = process::create_user_process_with(
        "user",
        sched::Priority::DEFAULT,
        caller,
        |context| crate::elf::load(context, &image).map(|loaded| loaded.entry),
    )?;
    Ok(pid.0 as usize)
}

/// Copy `len` bytes starting at `ptr` out of `pid`'s address space via the
/// kernel's temporary mapping window, validating every page first.
fn read_user_bytes(pid: ProcessId, ptr: usize, len: usize) -> KernelResult<Vec<u8>> {
    let context = crate::process::table::PROCESS_TABLE.with(pid, |p| {
        // SAFETY-relevant note: this closure only copies the fields it needs;
        // it never returns a reference into `p`.
        p.context.as_context() as *const Context
    })?;
    // SAFETY: `context` points at a `Context` owned by the process table
    // entry we just looked up; it outlives this function since no other
    // code removes a process mid-syscall on this single core.
    let context = unsafe { &*context };
    validate_user_range(context, ptr, len)?;

    let mut out = Vec::with_capacity(len);
    let mut remaining = len;
    let mut addr = ptr;
    while remaining > 0 {
        let page = crate::mm::frame_align_down(addr);
        let offset_in_page = addr - page;
        let (frame, _) = context.resolve(page).ok_or(KernelError::Unmapped { addr: page })?;
        let tmp = Context::kernel().map_temporary(frame, MapFlags::kernel_rw())?;
        let copy_len = (crate::config::FRAME_SIZE - offset_in_page).min(remaining);
        // SAFETY: `tmp + offset_in_page .. +copy_len` lies within the single
        // freshly mapped temporary page.
        let slice = unsafe {
            core::slice::from_raw_parts((tmp + offset_in_page) as *const u8, copy_len)
        };
        out.extend_from_slice(slice);
        Context::kernel().unmap_temporary()?;
        addr += copy_len;
        remaining -= copy_len;
    }
    Ok(out)
}

fn sys_process_exit() -> KernelResult<usize> {
    let pid = current_process_or_err()?;
    process::kill_process(pid)?;
    sched::yield_current();
    Ok(0)
}

fn sys_process_id() -> KernelResult<usize> {
    Ok(current_process_or_err()?.0 as usize)
}

fn sys_process_parent_id() -> KernelResult<usize> {
    let pid = current_process_or_err()?;
    Ok(process::parent_of(pid)?.0 as usize)
}

fn sys_process_kill(pid: u64) -> KernelResult<usize> {
    process::kill_process(ProcessId(pid))?;
    Ok(0)
}

fn sys_thread_id() -> KernelResult<usize> {
    Ok(current_thread_or_err()?.0 as usize)
}

fn sys_thread_create(entry: usize, arg: u32) -> KernelResult<usize> {
    let tid = process::create_kernel_thread(entry, sched::Priority::DEFAULT, arg)?;
    Ok(tid.0 as usize)
}

fn sys_thread_exit() -> KernelResult<usize> {
    let tid = current_thread_or_err()?;
    process::kill_thread(tid);
    sched::yield_current();
    Ok(0)
}

fn sys_thread_kill(tid: u64) -> KernelResult<usize> {
    process::kill_thread(ThreadId(tid));
    Ok(0)
}

fn sys_kernel_putc(ch: u32) -> KernelResult<usize> {
    crate::print!("{}", ch as u8 as char);
    Ok(0)
}

/// `kernel_puts(ptr, len) -> bytes written`.
fn sys_kernel_puts(ptr: usize, len: usize) -> KernelResult<usize> {
    let pid = current_process_or_err()?;
    let bytes = read_user_bytes(pid, ptr, len)?;
    for &b in &bytes {
        crate::print!("{}", b as char);
    }
    Ok(bytes.len())
}

/// `message_send(target_pid, type, ptr, len) -> message_id` (spec §4.7).
fn sys_message_send(target: u64, msg_type: u32, ptr: usize, len: usize) -> KernelResult<usize> {
    let sender = current_process_or_err()?;
    let bytes = read_user_bytes(sender, ptr, len)?;
    let id = message::send(sender, ProcessId(target), msg_type, false, bytes)?;
    Ok(id as usize)
}

/// `mmap(frame_count, prot) -> vaddr` — grows the caller's address space by
/// `frame_count` fresh pages (spec §6; full `{addr,len,prot,flags,fd,off}`
/// POSIX surface is out of scope, `fd`/`off`-backed mapping does not apply
/// to a kernel with no filesystem).
fn sys_mmap(frame_count: usize, prot: usize) -> KernelResult<usize> {
    let pid = current_process_or_err()?;
    let context = crate::process::table::PROCESS_TABLE.with(pid, |p| {
        p.context.as_context() as *const Context
    })?;
    let context = unsafe { &*context };
    let flags = if prot & 0b010 != 0 {
        MapFlags::user_rw()
    } else {
        MapFlags::user_code()
    };
    let base = context.map_random(frame_count.max(1), flags)?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_match_table() {
        assert_eq!(Syscall::try_from(1), Ok(Syscall::ProcessCreate));
        assert_eq!(Syscall::try_from(9), Err(()));
        assert_eq!(Syscall::try_from(10), Ok(Syscall::ThreadKill));
        assert_eq!(Syscall::try_from(12), Ok(Syscall::KernelPuts));
        assert_eq!(Syscall::try_from(21), Ok(Syscall::Mmap));
    }
}
