//! Runtime: the owner of process-wide scheduling state.
//!
//! A [`Runtime`] ties together the configuration, the exec buffer arena,
//! the CU context cache, the selected scheduler backend and the kernel and
//! run handle tables. Tests build isolated runtimes with [`Runtime::new`];
//! applications usually share [`Runtime::global`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{Command, CommandState, ConfigurePacket, Opcode};
use crate::config::{self, SchedConfig};
use crate::context::ContextRegistry;
use crate::device::{loaded_metadata, AccessMode, Device, DeviceId};
use crate::error::{ExecError, ExecResult};
use crate::kernel::{Kernel, Run};
use crate::memory::ExecBufferPool;
use crate::registry::HandleRegistry;
use crate::scheduler::{create_backend, SchedulerBackend};

/// Opaque handle of a kernel opened through [`Runtime::open_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Opaque handle of a run created through [`Runtime::create_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunHandle(pub u64);

/// Scheduling runtime.
pub struct Runtime {
    config: SchedConfig,
    exec_buffers: Arc<ExecBufferPool>,
    contexts: ContextRegistry,
    scheduler: Arc<dyn SchedulerBackend>,
    kernels: HandleRegistry<Kernel>,
    runs: HandleRegistry<Run>,
    initialized: Mutex<HashSet<DeviceId>>,
}

impl Runtime {
    /// Create a runtime with the backend selected by `config`.
    pub fn new(config: SchedConfig) -> ExecResult<Self> {
        config.validate()?;
        let scheduler = create_backend(&config)?;
        Ok(Self::with_backend(config, scheduler))
    }

    /// Create a runtime around an existing backend.
    pub fn with_backend(config: SchedConfig, scheduler: Arc<dyn SchedulerBackend>) -> Self {
        Self {
            exec_buffers: Arc::new(ExecBufferPool::new(config.exec_buffer_size)),
            config,
            contexts: ContextRegistry::new(),
            scheduler,
            kernels: HandleRegistry::new("kernel"),
            runs: HandleRegistry::new("run"),
            initialized: Mutex::new(HashSet::new()),
        }
    }

    /// Process-wide runtime built from [`config::global`] on first use.
    pub fn global() -> ExecResult<&'static Runtime> {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();

        if let Some(runtime) = GLOBAL.get() {
            return Ok(runtime);
        }
        let runtime = Runtime::new(config::global().clone())?;
        // A racing initializer may win; its runtime is the one everyone sees.
        Ok(GLOBAL.get_or_init(|| runtime))
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Exec buffer arena.
    pub fn exec_buffers(&self) -> &Arc<ExecBufferPool> {
        &self.exec_buffers
    }

    /// CU context cache.
    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    /// Selected scheduler backend.
    pub fn scheduler(&self) -> &Arc<dyn SchedulerBackend> {
        &self.scheduler
    }

    /// Create a raw command on `device`.
    pub fn command(&self, device: &Arc<dyn Device>, opcode: Opcode) -> ExecResult<Arc<Command>> {
        Command::new(device, opcode, &self.exec_buffers, &self.scheduler)
    }

    /// Prepare `device` for scheduling.
    ///
    /// Initializes the backend for the device and runs the configure
    /// handshake built from the loaded xclbin. Later calls are no-ops.
    pub fn init_device(&self, device: &Arc<dyn Device>) -> ExecResult<()> {
        let mut initialized = self.initialized.lock();
        if initialized.contains(&device.id()) {
            return Ok(());
        }

        let start = Instant::now();
        self.scheduler.init(device)?;
        let metadata = loaded_metadata(device.as_ref())?;
        let packet = ConfigurePacket::from_config(
            &self.config,
            &metadata.cu_addresses(),
            metadata.max_regmap_bytes(),
            self.scheduler.requires_polling(),
        );

        let cmd = self.command(device, Opcode::Configure)?;
        cmd.write_payload(0, &packet.to_words())?;
        cmd.run()?;
        let state = cmd.wait(None)?;
        if state != CommandState::Completed {
            return Err(ExecError::SchedulerError(format!(
                "configure of {} finished in state {}",
                device.id(),
                state
            )));
        }

        initialized.insert(device.id());
        info!(
            "Initialized {} with {} CUs on {} backend in {}µs",
            device.id(),
            packet.num_cus(),
            self.scheduler.kind(),
            start.elapsed().as_micros()
        );
        Ok(())
    }

    /// Whether [`Runtime::init_device`] has completed for `device`.
    pub fn is_initialized(&self, device: &Arc<dyn Device>) -> bool {
        self.initialized.lock().contains(&device.id())
    }

    /// Open a kernel and register it under a new handle.
    pub fn open_kernel(
        &self,
        device: &Arc<dyn Device>,
        xclbin: &Uuid,
        name: &str,
        access: AccessMode,
    ) -> ExecResult<KernelHandle> {
        let kernel = Kernel::open(self, device, xclbin, name, access)?;
        let handle = KernelHandle(self.kernels.register(kernel));
        debug!("Registered kernel '{}' as {:?}", name, handle);
        Ok(handle)
    }

    /// Kernel behind `handle`.
    pub fn kernel(&self, handle: KernelHandle) -> ExecResult<Arc<Kernel>> {
        self.kernels.lookup(handle.0)
    }

    /// Forget `handle`. The kernel's contexts close once its runs are gone.
    pub fn close_kernel(&self, handle: KernelHandle) -> ExecResult<()> {
        self.kernels.unregister(handle.0).map(drop)
    }

    /// Create a run of the kernel behind `kernel`.
    pub fn create_run(&self, kernel: KernelHandle) -> ExecResult<RunHandle> {
        let kernel = self.kernel(kernel)?;
        let run = Run::new(&kernel)?;
        Ok(RunHandle(self.runs.register(Arc::new(run))))
    }

    /// Run behind `handle`.
    pub fn run(&self, handle: RunHandle) -> ExecResult<Arc<Run>> {
        self.runs.lookup(handle.0)
    }

    /// Forget `handle`.
    pub fn close_run(&self, handle: RunHandle) -> ExecResult<()> {
        self.runs.unregister(handle.0).map(drop)
    }

    /// Drop all handles and stop the backend.
    ///
    /// Returns the first error a background thread recorded, or an error
    /// if commands were still active.
    pub fn shutdown(&self) -> ExecResult<()> {
        self.runs.clear();
        self.kernels.clear();
        self.scheduler.shutdown()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.scheduler.kind())
            .field("kernels", &self.kernels.len())
            .field("runs", &self.runs.len())
            .finish()
    }
}
