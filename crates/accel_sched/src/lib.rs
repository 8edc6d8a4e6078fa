//! # accel_sched
//!
//! Command scheduling for accelerator compute units (CUs).
//!
//! This crate turns kernel invocations into command packets, dispatches
//! them to CUs through one of three interchangeable scheduler backends and
//! reports completion back to waiters, callbacks and a dependency graph:
//!
//! - **sws**: software scheduler polling CU control registers from the host
//! - **kds**: exec buffers handed to the kernel driver scheduler
//! - **mbs**: packets written into the embedded scheduler's command queue
//!
//! ## Features
//!
//! - Pooled exec buffers recycled per device
//! - Shared/exclusive CU contexts with a weak cache
//! - Managed (callback) and unmanaged (blocking wait) completion paths
//! - Kernels with `name:{inst,...}` CU selection and typed arguments
//! - An event graph whose nodes run after their dependencies complete
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use accel_sched::prelude::*;
//!
//! let runtime = Runtime::new(SchedConfig::default())?;
//! let device: Arc<dyn Device> = Arc::new(SimDevice::new(0, 4));
//! runtime.init_device(&device)?;
//!
//! let kernel = Kernel::open(&runtime, &device, &uuid, "vadd", AccessMode::Shared)?;
//! let run = Run::new(&kernel)?;
//! run.set_arg(3, ArgValue::Scalar(&1024u32.to_le_bytes()))?;
//! run.start()?;
//! run.wait(None)?;
//! ```
//!
//! ## Configuration
//!
//! [`SchedConfig`] is read from the JSON file named by `ACCEL_SCHED_CONFIG`
//! and `ACCEL_SCHED_<FIELD>` overrides. `kds` selects the driver scheduler,
//! otherwise `ert` selects the command queue, otherwise the software
//! scheduler runs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod enqueue;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod scheduler;

// Re-export commonly used types
pub use command::{Command, CommandState, CommandType, ConfigurePacket, Header, Opcode};
pub use config::SchedConfig;
pub use context::{ContextRegistry, CuContext};
pub use device::{AccessMode, BoHandle, CompletionMode, Device, DeviceId, SimDevice, XclbinMetadata};
pub use enqueue::{Completion, Event, EventHandle, EventHandler, EventQueue};
pub use error::{ExecError, ExecResult};
pub use kernel::{ArgKind, ArgValue, Argument, Kernel, Run};
pub use memory::{ExecBuffer, ExecBufferPool};
pub use registry::HandleRegistry;
pub use runtime::{KernelHandle, RunHandle, Runtime};
pub use scheduler::{BackendKind, KdsScheduler, MbsScheduler, SchedulerBackend, SwsScheduler};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::command::{Command, CommandState, Opcode};
    pub use crate::config::SchedConfig;
    pub use crate::device::{AccessMode, Device, SimDevice};
    pub use crate::enqueue::{Event, EventHandler, EventQueue};
    pub use crate::error::{ExecError, ExecResult};
    pub use crate::kernel::{ArgValue, Kernel, Run};
    pub use crate::runtime::Runtime;
    pub use std::sync::Arc;
}
