//! Kernel driver scheduler.
//!
//! Exec buffers are handed to the driver with `exec_buf`. Managed commands
//! are tracked by one monitor thread per device that sleeps in `exec_wait`
//! and notifies every tracked command whose packet reached a terminal
//! state. Unmanaged commands are waited on by the caller, which polls the
//! packet state between `exec_wait` calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::notify::Notifier;
use super::{join_worker, spawn_guarded, BackendKind, ErrorSlot, SchedulerBackend};
use crate::command::{Command, CommandState};
use crate::config::SchedConfig;
use crate::device::{Device, DeviceId};
use crate::error::{ExecError, ExecResult};

struct MonitorState {
    submitted: Vec<Arc<Command>>,
    stop: bool,
}

struct Monitor {
    device: Arc<dyn Device>,
    state: Mutex<MonitorState>,
    work: Condvar,
    notifier: Arc<Notifier>,
    wait_timeout_ms: u32,
}

impl Monitor {
    fn run(&self) -> ExecResult<()> {
        loop {
            {
                let mut state = self.state.lock();
                while state.submitted.is_empty() && !state.stop {
                    self.work.wait(&mut state);
                }
                if state.stop {
                    if state.submitted.is_empty() {
                        return Ok(());
                    }
                    return Err(ExecError::SchedulerStopped(format!(
                        "stopped with {} active commands",
                        state.submitted.len()
                    )));
                }
            }

            self.device.exec_wait(self.wait_timeout_ms)?;

            let completed: Vec<Arc<Command>> = {
                let mut state = self.state.lock();
                let (done, running) = state
                    .submitted
                    .drain(..)
                    .partition(|cmd: &Arc<Command>| cmd.state().is_terminal());
                state.submitted = running;
                done
            };
            for cmd in completed {
                let state = cmd.state();
                self.notifier.notify(cmd, state);
            }
        }
    }
}

#[derive(Default)]
struct WaitState {
    in_wait: bool,
    counter: u64,
}

/// Per-device driver state.
struct KdsDevice {
    device: Arc<dyn Device>,
    monitor: Arc<Monitor>,
    thread: Mutex<Option<JoinHandle<()>>>,
    waits: Mutex<WaitState>,
    wait_done: Condvar,
}

impl KdsDevice {
    fn new(
        device: Arc<dyn Device>,
        notifier: Arc<Notifier>,
        wait_timeout_ms: u32,
        errors: Arc<ErrorSlot>,
    ) -> ExecResult<Self> {
        let monitor = Arc::new(Monitor {
            device: Arc::clone(&device),
            state: Mutex::new(MonitorState {
                submitted: Vec::new(),
                stop: false,
            }),
            work: Condvar::new(),
            notifier,
            wait_timeout_ms,
        });
        let thread_monitor = Arc::clone(&monitor);
        let handle = spawn_guarded(&format!("kds-monitor-{}", device.id().index()), errors, move || {
            thread_monitor.run()
        })?;

        Ok(Self {
            device,
            monitor,
            thread: Mutex::new(Some(handle)),
            waits: Mutex::new(WaitState::default()),
            wait_done: Condvar::new(),
        })
    }

    /// Track a managed command, then hand it to the driver.
    fn launch(&self, cmd: Arc<Command>) -> ExecResult<()> {
        let uid = cmd.uid();
        let handle = cmd.handle();
        {
            let mut state = self.monitor.state.lock();
            if state.stop {
                return Err(ExecError::SchedulerStopped("kds monitor is stopped".into()));
            }
            state.submitted.push(cmd);
        }
        self.monitor.work.notify_one();

        if let Err(e) = self.device.exec_buf(handle) {
            self.monitor.state.lock().submitted.retain(|c| c.uid() != uid);
            return Err(e);
        }
        Ok(())
    }

    /// Number of `exec_wait` calls that have returned so far.
    fn wait_generation(&self) -> u64 {
        self.waits.lock().counter
    }

    /// Let exactly one caller sit in `exec_wait`; the others wait for it to
    /// report back and then re-check their command.
    ///
    /// `seen` is the generation the caller last observed. If another call
    /// returned since then, this returns at once so the caller re-checks.
    fn wait_for_work(&self, timeout_ms: u32, seen: &mut u64) -> ExecResult<()> {
        let mut waits = self.waits.lock();

        if *seen == waits.counter {
            if waits.in_wait {
                let _ = self
                    .wait_done
                    .wait_for(&mut waits, Duration::from_millis(timeout_ms as u64));
            } else {
                waits.in_wait = true;
                drop(waits);
                let result = self.device.exec_wait(timeout_ms);
                waits = self.waits.lock();
                waits.in_wait = false;
                waits.counter += 1;
                self.wait_done.notify_all();
                *seen = waits.counter;
                return result.map(|_| ());
            }
        }

        *seen = waits.counter;
        Ok(())
    }

    fn stop(&self) {
        self.monitor.state.lock().stop = true;
        self.monitor.work.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            join_worker(handle);
        }
    }
}

/// Kernel driver scheduler backend.
pub struct KdsScheduler {
    devices: Mutex<HashMap<DeviceId, Arc<KdsDevice>>>,
    notifier: Arc<Notifier>,
    wait_timeout_ms: u32,
    errors: Arc<ErrorSlot>,
}

impl KdsScheduler {
    /// Create the backend. Monitor threads start when devices are initialized.
    pub fn new(config: &SchedConfig) -> ExecResult<Self> {
        Ok(Self {
            devices: Mutex::new(HashMap::new()),
            notifier: Arc::new(Notifier::new(
                "kds",
                config.threaded_notification,
                config.notify_workers,
            )?),
            wait_timeout_ms: config.kds_wait_timeout_ms,
            errors: Arc::new(ErrorSlot::default()),
        })
    }

    fn device(&self, id: DeviceId) -> ExecResult<Arc<KdsDevice>> {
        self.devices
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecError::SchedulerError(format!("{} was never initialized", id)))
    }

    /// Managed commands tracked by the monitor of `device`.
    pub fn tracked(&self, device: DeviceId) -> usize {
        self.devices
            .lock()
            .get(&device)
            .map(|d| d.monitor.state.lock().submitted.len())
            .unwrap_or(0)
    }
}

impl SchedulerBackend for KdsScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::Kds
    }

    fn init(&self, device: &Arc<dyn Device>) -> ExecResult<()> {
        let mut devices = self.devices.lock();
        if devices.contains_key(&device.id()) {
            return Ok(());
        }
        let kdev = KdsDevice::new(
            Arc::clone(device),
            Arc::clone(&self.notifier),
            self.wait_timeout_ms,
            self.errors.clone(),
        )?;
        info!("{}: kds monitor started", device.id());
        devices.insert(device.id(), Arc::new(kdev));
        Ok(())
    }

    fn submit(&self, cmd: Arc<Command>, managed: bool) -> ExecResult<()> {
        self.errors.check()?;
        let kdev = self.device(cmd.device().id())?;
        if managed {
            kdev.launch(cmd)
        } else {
            debug!("exec_buf for unmanaged command {}", cmd.uid());
            kdev.device.exec_buf(cmd.handle())
        }
    }

    fn wait(&self, cmd: &Command, timeout: Option<Duration>) -> ExecResult<CommandState> {
        if cmd.is_done() {
            return Ok(cmd.state());
        }
        let kdev = self.device(cmd.device().id())?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut seen = kdev.wait_generation();

        loop {
            let state = cmd.state();
            if state.is_terminal() {
                cmd.notify(state);
                return Ok(state);
            }
            let mut wait_ms = self.wait_timeout_ms;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(state);
                }
                let left = (deadline - now).as_millis().max(1);
                wait_ms = wait_ms.min(left.min(u32::MAX as u128) as u32);
            }
            kdev.wait_for_work(wait_ms, &mut seen)?;
        }
    }

    fn shutdown(&self) -> ExecResult<()> {
        let devices: Vec<_> = self.devices.lock().drain().map(|(_, d)| d).collect();
        for kdev in devices {
            kdev.stop();
        }
        self.notifier.stop();
        self.errors.check()
    }

    fn last_error(&self) -> Option<String> {
        self.errors.get().or_else(|| self.notifier.last_error())
    }
}

impl Drop for KdsScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("kds scheduler shutdown: {}", e);
        }
    }
}
