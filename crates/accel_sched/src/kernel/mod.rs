//! Kernels and runs.
//!
//! A [`Kernel`] binds a kernel name to the CUs that implement it, holding
//! their contexts open for its lifetime. A [`Run`] is one reusable
//! execution of a kernel: a start command with the kernel's CU mask and a
//! register map payload filled through [`Run::set_arg`].
//!
//! # Example
//!
//! ```rust,ignore
//! let kernel = Kernel::open(&runtime, &device, &uuid, "vadd:{vadd_1,vadd_3}", AccessMode::Shared)?;
//! let run = Run::new(&kernel)?;
//! run.set_arg(0, ArgValue::Buffer(a_addr))?;
//! run.set_arg(3, ArgValue::Scalar(&n.to_le_bytes()))?;
//! run.start()?;
//! assert_eq!(run.wait(None)?, CommandState::Completed);
//! ```

pub mod argument;

pub use argument::{ArgKind, ArgValue, Argument};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::command::{Command, CommandState, EventHook, Opcode};
use crate::context::CuContext;
use crate::device::{AccessMode, Device};
use crate::enqueue::{Event, EventHandle, EventQueue};
use crate::error::{ExecError, ExecResult};
use crate::memory::ExecBufferPool;
use crate::runtime::Runtime;
use crate::scheduler::SchedulerBackend;

/// Split `kernel:{inst1,inst2}` into the kernel name and instance filter.
///
/// A plain `kernel` (or `kernel:inst` without braces) selects every CU of
/// the kernel.
pub fn parse_kernel_name(name: &str) -> (&str, Option<Vec<&str>>) {
    let Some((kernel, rest)) = name.split_once(':') else {
        return (name, None);
    };
    match rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        Some(list) => (
            kernel,
            Some(list.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()),
        ),
        None => (kernel, None),
    }
}

/// A kernel bound to a set of CUs.
pub struct Kernel {
    name: String,
    scheduler: Arc<dyn SchedulerBackend>,
    pool: Arc<ExecBufferPool>,
    device: Arc<dyn Device>,
    xclbin: Uuid,
    access: AccessMode,
    rw_shared: bool,
    cu_indices: Vec<u32>,
    cus: Vec<Arc<CuContext>>,
    _virtual_cu: Arc<CuContext>,
    args: Vec<Argument>,
    regmap_words: usize,
}

impl Kernel {
    /// Open kernel `name` on `device`.
    ///
    /// CUs are matched by kernel name and, for `name:{a,b}`, by instance
    /// name. Every matching CU's context is opened with `access`.
    pub fn open(
        runtime: &Runtime,
        device: &Arc<dyn Device>,
        xclbin: &Uuid,
        name: &str,
        access: AccessMode,
    ) -> ExecResult<Arc<Self>> {
        let (kernel_name, instances) = parse_kernel_name(name);
        let metadata = device.xclbin_metadata(xclbin)?;
        let virtual_cu = runtime.contexts().open_virtual_cu(device, xclbin)?;

        let mut cu_indices = Vec::new();
        let mut ips = Vec::new();
        for (cu_index, ip_index) in metadata.cu_ip_indices().into_iter().enumerate() {
            let ip = &metadata.ip_layout[ip_index as usize];
            if ip.kernel_name() != kernel_name {
                continue;
            }
            if let Some(instances) = &instances {
                if !instances.contains(&ip.instance_name()) {
                    continue;
                }
            }
            cu_indices.push(cu_index as u32);
            ips.push(ip_index);
        }
        if cu_indices.is_empty() {
            return Err(ExecError::KernelNotFound(format!(
                "no compute units matching '{}'",
                name
            )));
        }

        let cus = cu_indices
            .iter()
            .zip(&ips)
            .map(|(&cu, &ip)| runtime.contexts().open(device, xclbin, ip, cu, access))
            .collect::<ExecResult<Vec<_>>>()?;

        let meta = metadata.kernel(kernel_name).ok_or_else(|| {
            ExecError::KernelNotFound(format!("no argument metadata for kernel '{}'", kernel_name))
        })?;
        let connectivity = cus[0].connectivity();
        let args = meta
            .args
            .iter()
            .cloned()
            .map(|arg| {
                let group = connectivity.arg_memidx(arg.index);
                Argument::new(arg, group)
            })
            .collect();

        debug!(
            "Opened kernel {} on {} with CUs {:?}",
            kernel_name,
            device.id(),
            cu_indices
        );

        Ok(Arc::new(Self {
            name: kernel_name.to_string(),
            scheduler: Arc::clone(runtime.scheduler()),
            pool: Arc::clone(runtime.exec_buffers()),
            device: Arc::clone(device),
            xclbin: *xclbin,
            access,
            rw_shared: runtime.config().rw_shared,
            cu_indices,
            cus,
            _virtual_cu: virtual_cu,
            args,
            regmap_words: meta.regmap_words(),
        }))
    }

    /// Kernel name without instance filter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the kernel runs on.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// xclbin the kernel comes from.
    pub fn xclbin(&self) -> Uuid {
        self.xclbin
    }

    /// Access mode of the kernel's CU contexts.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// CU indices the kernel may run on.
    pub fn cu_indices(&self) -> &[u32] {
        &self.cu_indices
    }

    /// Arguments in index order.
    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Register map size in words.
    pub fn regmap_words(&self) -> usize {
        self.regmap_words
    }

    fn arg(&self, index: usize) -> ExecResult<&Argument> {
        self.args.get(index).ok_or_else(|| {
            ExecError::InvalidArgument(format!("kernel '{}' has no argument {}", self.name, index))
        })
    }

    /// Memory bank buffers for argument `index` should be placed in.
    pub fn group_id(&self, index: usize) -> ExecResult<i32> {
        self.arg(index)?.group_id().ok_or_else(|| {
            ExecError::InvalidArgument(format!("argument {} has no memory connection", index))
        })
    }

    /// Register map byte offset of argument `index`.
    pub fn arg_offset(&self, index: usize) -> ExecResult<u32> {
        Ok(self.arg(index)?.offset())
    }

    fn register_cu(&self, offset: u32, force: bool) -> ExecResult<&CuContext> {
        let [cu] = self.cus.as_slice() else {
            return Err(ExecError::AccessDenied(
                "cannot read or write kernel with multiple compute units".into(),
            ));
        };
        if !force && cu.access() != AccessMode::Exclusive && !self.rw_shared {
            return Err(ExecError::AccessDenied(
                "cannot read or write kernel with shared access".into(),
            ));
        }
        if offset as u64 + 4 > cu.size() {
            return Err(ExecError::InvalidArgument(format!(
                "register offset {:#x} outside kernel register space",
                offset
            )));
        }
        Ok(cu)
    }

    /// Read a CU register.
    pub fn read_register(&self, offset: u32) -> ExecResult<u32> {
        let cu = self.register_cu(offset, false)?;
        self.device.read_register_u32(cu.address() + offset as u64)
    }

    /// Write a CU register.
    pub fn write_register(&self, offset: u32, value: u32) -> ExecResult<()> {
        let cu = self.register_cu(offset, false)?;
        self.device.write_register_u32(cu.address() + offset as u64, value)
    }

    /// Read `count` consecutive registers regardless of access mode.
    fn read_registers(&self, offset: u32, count: usize) -> ExecResult<Vec<u32>> {
        (0..count as u32)
            .map(|n| {
                let cu = self.register_cu(offset + 4 * n, true)?;
                self.device.read_register_u32(cu.address() + (offset + 4 * n) as u64)
            })
            .collect()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("device", &self.device.id())
            .field("cus", &self.cu_indices)
            .field("access", &self.access)
            .finish()
    }
}

/// One execution context of a kernel.
pub struct Run {
    kernel: Arc<Kernel>,
    cmd: Arc<Command>,
}

impl Run {
    /// Create a run with an empty register map.
    pub fn new(kernel: &Arc<Kernel>) -> ExecResult<Self> {
        let cmd = Command::new(
            &kernel.device,
            Opcode::StartCu,
            &kernel.pool,
            &kernel.scheduler,
        )?;
        cmd.set_cu_mask(&kernel.cu_indices)?;
        cmd.set_payload_len(kernel.regmap_words)?;
        Ok(Self {
            kernel: Arc::clone(kernel),
            cmd,
        })
    }

    /// Kernel this run executes.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Underlying command.
    pub fn command(&self) -> &Arc<Command> {
        &self.cmd
    }

    /// Set argument `index`.
    pub fn set_arg(&self, index: usize, value: ArgValue<'_>) -> ExecResult<()> {
        let arg = self.kernel.arg(index)?;
        let words = arg.value_words(value)?;
        let count = (arg.size() as usize / 4).min(words.len());
        if count == 0 {
            return Ok(());
        }
        self.cmd
            .write_payload(arg.offset() as usize / 4, &words[..count])
    }

    /// Read argument `index` back from the CU's registers.
    ///
    /// Needs a kernel with a single CU; shared access is allowed.
    pub fn get_arg(&self, index: usize) -> ExecResult<Vec<u32>> {
        let arg = self.kernel.arg(index)?;
        self.kernel
            .read_registers(arg.offset(), arg.size() as usize / 4)
    }

    /// Start the run.
    pub fn start(&self) -> ExecResult<()> {
        self.cmd.run()
    }

    /// Start the run with a completion hook.
    pub fn start_with_event(&self, hook: EventHook) -> ExecResult<()> {
        self.cmd.run_with_event(hook)
    }

    /// Wait for the run to complete. See [`Command::wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> ExecResult<CommandState> {
        self.cmd.wait(timeout)
    }

    /// Current packet state.
    pub fn state(&self) -> CommandState {
        self.cmd.state()
    }

    /// Register a completion callback.
    pub fn add_callback<F>(&self, callback: F) -> ExecResult<()>
    where
        F: Fn(CommandState) + Send + Sync + 'static,
    {
        self.cmd.add_callback(callback)
    }

    /// Enqueue the run as a graph node that completes when the run does.
    pub fn enqueue(&self, queue: &EventQueue, deps: &[EventHandle]) -> Event<CommandState> {
        let cmd = Arc::clone(&self.cmd);
        queue.enqueue_async(deps, move |completion| {
            let slot = Arc::new(Mutex::new(Some(completion)));
            let hook_slot = Arc::clone(&slot);
            let hook: EventHook = Box::new(move |state| {
                if let Some(completion) = hook_slot.lock().take() {
                    completion.complete(Ok(state));
                }
            });
            if let Err(e) = cmd.run_with_event(hook) {
                // The hook never fires for a run that failed to start.
                let completion = slot.lock().take();
                match completion {
                    Some(completion) => completion.complete(Err(e)),
                    None => return Err(e),
                }
            }
            Ok(())
        })
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("kernel", &self.kernel.name)
            .field("command", &self.cmd.uid())
            .finish()
    }
}
