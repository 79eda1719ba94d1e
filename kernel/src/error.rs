//! Kernel error types
//!
//! One crate-wide error enum with per-subsystem payloads. Inside the kernel
//! failures travel as `KernelResult`/`Option`; the syscall layer is the
//! only place they are flattened to the numeric ABI codes.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical or fixed-block allocation failed
    OutOfMemory,
    /// Address is unaligned or outside the expected space
    InvalidAddress { addr: usize },
    /// Argument failed validation before any state change
    InvalidArgument { name: &'static str },
    /// Capability-related errors
    CapError(CapError),
    /// IPC-related errors
    IpcError(IpcError),
    /// Scheduler-related errors
    SchedError(SchedError),
    /// Subsystem used before its boot-time init completed
    NotInitialized { subsystem: &'static str },
    /// Named thing does not exist
    NotFound,
}

/// Capability-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    InvalidCookie,
    WrongType,
    MapExhausted,
}

/// IPC-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    ChannelNotFound { cookie: u64 },
    MessageNotFound { cookie: u64 },
    BufferUnaligned { addr: usize },
    BufferTooLarge { size: usize, max: usize },
    NameExists,
    NameNotFound,
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    NoCurrentTask,
    NotOwner,
    MutexBusy,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {addr:#x}"),
            Self::InvalidArgument { name } => write!(f, "Invalid argument '{name}'"),
            Self::CapError(e) => write!(f, "Capability error: {e:?}"),
            Self::IpcError(e) => write!(f, "IPC error: {e:?}"),
            Self::SchedError(e) => write!(f, "Scheduler error: {e:?}"),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {subsystem}")
            }
            Self::NotFound => write!(f, "Not found"),
        }
    }
}

impl From<CapError> for KernelError {
    fn from(err: CapError) -> Self {
        Self::CapError(err)
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::IpcError(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedError(err)
    }
}
