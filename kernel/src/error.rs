//! Kernel error types.
//!
//! Structured error values used throughout the kernel instead of bare
//! sentinel integers. The syscall boundary is the only place errors are
//! lowered to the userspace ABI's `-1`.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    InvalidAddress {
        addr: u32,
    },
    /// A page-directory slot is already occupied
    AlreadyMapped {
        virt_index: u32,
    },
    /// Physical/virtual addresses disagree modulo the page size
    MisalignedRegion {
        phys: u32,
        virt: u32,
    },

    /// Process-related errors
    ProcessNotFound {
        pid: i32,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    NotFound {
        resource: &'static str,
        id: u32,
    },
    AlreadyExists {
        resource: &'static str,
        id: u32,
    },
    PermissionDenied {
        operation: &'static str,
    },
    /// A malformed or unexpected packet was dropped
    MalformedPacket {
        protocol: &'static str,
        reason: &'static str,
    },
    /// Operation would block
    WouldBlock,
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid address: 0x{:x}", addr),
            Self::AlreadyMapped { virt_index } => {
                write!(f, "Page directory slot {} already mapped", virt_index)
            }
            Self::MisalignedRegion { phys, virt } => {
                write!(
                    f,
                    "Region 0x{:x} -> 0x{:x} misaligned within a large page",
                    phys, virt
                )
            }
            Self::ProcessNotFound { pid } => write!(f, "Process {} not found", pid),
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::PermissionDenied { operation } => {
                write!(f, "Permission denied for operation: {}", operation)
            }
            Self::MalformedPacket { protocol, reason } => {
                write!(f, "Malformed {} packet: {}", protocol, reason)
            }
            Self::WouldBlock => write!(f, "Operation would block"),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl KernelError {
    /// Lower an error to the userspace ABI sentinel.
    pub fn as_syscall_retval(&self) -> i32 {
        -1
    }
}
