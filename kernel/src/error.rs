//! Kernel error types.
//!
//! `KernelError` is the single recoverable-error type threaded through every
//! CORE subsystem. Fatal conditions are never represented here — they go
//! straight through `panic!` (see `main.rs`'s panic handler), since a panic
//! cannot be caught or translated.

use core::fmt;

/// Recoverable kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    InvalidArgument {
        name: &'static str,
    },
    OutOfMemory {
        requested_frames: usize,
    },
    AlreadyMapped {
        addr: usize,
    },
    Unmapped {
        addr: usize,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    PermissionDenied {
        operation: &'static str,
    },
    WouldBlock,
    IoError {
        device: &'static str,
    },
    NotSupported {
        operation: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Standard result type for recoverable kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name } => write!(f, "invalid argument: {name}"),
            Self::OutOfMemory { requested_frames } => {
                write!(f, "out of memory: requested {requested_frames} frames")
            }
            Self::AlreadyMapped { addr } => write!(f, "already mapped at {addr:#x}"),
            Self::Unmapped { addr } => write!(f, "unmapped at {addr:#x}"),
            Self::NotFound { resource, id } => write!(f, "{resource} {id} not found"),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for {operation}")
            }
            Self::WouldBlock => write!(f, "operation would block"),
            Self::IoError { device } => write!(f, "I/O error on {device}"),
            Self::NotSupported { operation } => write!(f, "not supported: {operation}"),
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {resource}"),
            Self::AlreadyExists { resource, id } => {
                write!(f, "{resource} {id} already exists")
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {subsystem}")
            }
        }
    }
}

/// Numeric errno-style code for the syscall result register (spec §6/§7:
/// negative error codes in the syscall result register).
impl KernelError {
    pub fn to_errno(self) -> isize {
        match self {
            Self::InvalidArgument { .. } => -1,
            Self::OutOfMemory { .. } => -2,
            Self::AlreadyMapped { .. } => -3,
            Self::Unmapped { .. } => -4,
            Self::NotFound { .. } => -5,
            Self::PermissionDenied { .. } => -6,
            Self::WouldBlock => -7,
            Self::IoError { .. } => -8,
            Self::NotSupported { .. } => -9,
            Self::ResourceExhausted { .. } => -10,
            Self::AlreadyExists { .. } => -11,
            Self::NotInitialized { .. } => -12,
        }
    }
}

#[macro_export]
macro_rules! kernel_error {
    (InvalidArgument { $name:expr }) => {
        $crate::error::KernelError::InvalidArgument { name: $name }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
