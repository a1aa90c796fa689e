//! Inter-process communication: per-process messaging and named shared
//! memory (spec §4.7). Recoverable errors are reported through the common
//! [`crate::error::KernelError`] rather than a separate IPC-specific type.

pub mod message;
pub mod shared_memory;

pub use message::Message;

pub fn init() {
    log::info!("IPC subsystem initialized");
}
