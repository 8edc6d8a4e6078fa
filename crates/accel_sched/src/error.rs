//! Unified error types for accel_sched.

use crate::device::AccessMode;

/// Result type for scheduling operations.
pub type ExecResult<T> = Result<T, ExecError>;

/// Unified error type for command, context and scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// `run()` was called while a previous execution is still in flight.
    #[error("Bad command state, can't launch command {0}")]
    CommandBusy(u64),

    /// A callback was added to an unmanaged command that is currently running.
    #[error("Cannot add callback to running unmanaged command {0}")]
    CallbackOnUnmanaged(u64),

    /// A CU context is already open with a different access mode.
    #[error("Conflicting access mode for CU({cu}): open as {existing}, requested {requested}")]
    ConflictingAccess {
        /// CU index.
        cu: u32,
        /// Mode the live context was opened with.
        existing: AccessMode,
        /// Mode requested by the caller.
        requested: AccessMode,
    },

    /// Lookup of a handle that was never registered or already closed.
    #[error("Unknown handle: {0}")]
    UnknownHandle(String),

    /// Invalid argument passed to a kernel or command accessor.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No kernel or CU matched the requested name.
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// Operation not permitted with the kernel's access mode.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Exec buffer allocation failed.
    #[error("Exec buffer allocation failed: size={size}, reason={reason}")]
    AllocationFailed {
        /// Requested allocation size in bytes.
        size: usize,
        /// Reason for allocation failure.
        reason: String,
    },

    /// Register read or write failed.
    #[error("Register I/O failed at offset {offset:#x}: {reason}")]
    RegisterIo {
        /// Register offset.
        offset: u64,
        /// Reason reported by the device.
        reason: String,
    },

    /// Hardware context open or close failed.
    #[error("Context operation failed: {0}")]
    ContextFailed(String),

    /// Exec buffer submission failed.
    #[error("Command submission failed: {0}")]
    SubmissionFailed(String),

    /// Device level failure not covered by the other variants.
    #[error("Device error: {0}")]
    Device(String),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    /// Scheduler was stopped.
    #[error("Scheduler stopped: {0}")]
    SchedulerStopped(String),

    /// A graph task panicked before producing a result.
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed.
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// I/O error (thread spawn, config file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Create an allocation error.
    pub fn allocation(size: usize, reason: impl Into<String>) -> Self {
        ExecError::AllocationFailed {
            size,
            reason: reason.into(),
        }
    }

    /// Create a register I/O error.
    pub fn register_io(offset: u64, reason: impl Into<String>) -> Self {
        ExecError::RegisterIo {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a conflicting access mode error.
    pub fn conflicting_access(cu: u32, existing: AccessMode, requested: AccessMode) -> Self {
        ExecError::ConflictingAccess {
            cu,
            existing,
            requested,
        }
    }

    /// Check if this error reports caller misuse rather than a device failure.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ExecError::CommandBusy(_)
                | ExecError::CallbackOnUnmanaged(_)
                | ExecError::ConflictingAccess { .. }
                | ExecError::UnknownHandle(_)
                | ExecError::InvalidArgument(_)
                | ExecError::AccessDenied(_)
        )
    }
}

/// Render a panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
