//! Command scheduler backends.
//!
//! Three interchangeable strategies drive commands to completion:
//!
//! - [`SwsScheduler`]: software scheduler polling CU control registers
//! - [`KdsScheduler`]: exec buffers submitted to the kernel driver scheduler,
//!   completions observed by one monitor thread per device
//! - [`MbsScheduler`]: packets written straight into the embedded scheduler's
//!   command queue, completions read from its status registers
//!
//! The backend is chosen once from configuration ([`create_backend`]) and
//! injected into every command.

pub mod kds;
pub mod mbs;
pub mod notify;
pub mod sws;

pub use kds::KdsScheduler;
pub use mbs::MbsScheduler;
pub use notify::{Notifier, NotifyQueue};
pub use sws::SwsScheduler;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::command::{Command, CommandState};
use crate::config::SchedConfig;
use crate::device::Device;
use crate::error::{panic_message, ExecError, ExecResult};

/// Scheduler backend identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Software scheduler.
    Sws,
    /// Kernel driver scheduler.
    Kds,
    /// Embedded scheduler command queue.
    Mbs,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sws => write!(f, "sws"),
            BackendKind::Kds => write!(f, "kds"),
            BackendKind::Mbs => write!(f, "mbs"),
        }
    }
}

/// Strategy interface implemented by every scheduler backend.
pub trait SchedulerBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Prepare a device for scheduling. Called once per device before the
    /// configure handshake.
    fn init(&self, device: &Arc<dyn Device>) -> ExecResult<()>;

    /// Hand a command over for execution. `managed` commands must be
    /// completed through [`Command::notify`].
    fn submit(&self, cmd: Arc<Command>, managed: bool) -> ExecResult<()>;

    /// Blocking wait used by unmanaged commands.
    fn wait(&self, cmd: &Command, timeout: Option<Duration>) -> ExecResult<CommandState> {
        Ok(cmd.wait_notified(timeout))
    }

    /// Stop background threads. Fails if commands were still active or a
    /// background thread died.
    fn shutdown(&self) -> ExecResult<()>;

    /// First fatal error recorded by a background thread.
    fn last_error(&self) -> Option<String>;

    /// Whether the configure packet must request polling mode.
    fn requires_polling(&self) -> bool {
        false
    }
}

/// Create the backend selected by `config`.
pub fn create_backend(config: &SchedConfig) -> ExecResult<Arc<dyn SchedulerBackend>> {
    let kind = config.backend_kind();
    info!("Selected {} scheduler backend", kind);
    Ok(match kind {
        BackendKind::Sws => Arc::new(SwsScheduler::new(config)?),
        BackendKind::Kds => Arc::new(KdsScheduler::new(config)?),
        BackendKind::Mbs => Arc::new(MbsScheduler::new(config)?),
    })
}

/// Keeps the first fatal error of a background thread.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(Mutex<Option<String>>);

impl ErrorSlot {
    pub(crate) fn record(&self, message: String) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    pub(crate) fn check(&self) -> ExecResult<()> {
        match self.get() {
            Some(message) => Err(ExecError::SchedulerError(message)),
            None => Ok(()),
        }
    }
}

/// Spawn a named thread whose errors and panics are logged and recorded.
pub(crate) fn spawn_guarded<F>(name: &str, errors: Arc<ErrorSlot>, body: F) -> ExecResult<JoinHandle<()>>
where
    F: FnOnce() -> ExecResult<()> + Send + 'static,
{
    let thread_name = name.to_string();
    let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            info!("{} thread started", thread_name);
            let message = match catch_unwind(AssertUnwindSafe(body)) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
            };
            match message {
                Some(message) => {
                    error!("{} thread failed: {}", thread_name, message);
                    errors.record(format!("{}: {}", thread_name, message));
                }
                None => info!("{} thread stopped", thread_name),
            }
        })?;
    Ok(handle)
}

/// Join a worker thread unless called from that very thread.
pub(crate) fn join_worker(handle: JoinHandle<()>) {
    if handle.thread().id() == std::thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        error!("worker thread panicked outside its guard");
    }
}

/// Sleep between idle polling iterations.
pub(crate) fn throttle(us: u64) {
    if us > 0 {
        std::thread::sleep(Duration::from_micros(us));
    }
}
