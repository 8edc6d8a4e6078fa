//! Embedded scheduler command queue.
//!
//! Packets are copied into a slot of the device command queue (payload
//! first, header last so the embedded scheduler never sees a partial
//! packet). Completion is read back from the clear-on-read status
//! registers at [`CSR_ADDR`], one bit per slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use fixedbitset::FixedBitSet;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use super::notify::Notifier;
use super::{join_worker, spawn_guarded, throttle, BackendKind, ErrorSlot, SchedulerBackend};
use crate::command::packet::{CQ_BASE_ADDR, CQ_SIZE, CQ_STATUS_REGISTER_ADDR, CSR_ADDR};
use crate::command::{Command, CommandState};
use crate::config::SchedConfig;
use crate::device::{Device, DeviceId};
use crate::error::{ExecError, ExecResult};

/// Maximum number of command queue slots.
pub const MAX_SLOTS: usize = 256;

/// Slot bookkeeping for one device's command queue.
struct HwQueue {
    device: Arc<dyn Device>,
    num_slots: usize,
    used: FixedBitSet,
    complete: FixedBitSet,
    cqint: bool,
}

impl HwQueue {
    fn new(device: Arc<dyn Device>, slot_size: u32, cqint: bool) -> Self {
        let num_slots = (CQ_SIZE / slot_size.max(1) as usize).clamp(1, MAX_SLOTS);
        let mut used = FixedBitSet::with_capacity(MAX_SLOTS);
        used.set_range(num_slots.., true);
        Self {
            device,
            num_slots,
            used,
            complete: FixedBitSet::with_capacity(MAX_SLOTS),
            cqint,
        }
    }

    fn slot_size(&self) -> u64 {
        (CQ_SIZE / self.num_slots) as u64
    }

    fn acquire(&mut self) -> Option<usize> {
        let idx = (0..self.num_slots).find(|&i| !self.used.contains(i))?;
        self.used.insert(idx);
        Some(idx)
    }

    fn release(&mut self, idx: usize) {
        self.used.set(idx, false);
        self.complete.set(idx, false);
    }

    fn read_status(&mut self) -> ExecResult<()> {
        let bytes = ((self.num_slots / 8).max(4) + 3) & !3;
        let mut data = vec![0u8; bytes];
        self.device.read_register(CSR_ADDR, &mut data)?;

        for (i, &byte) in data.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if (byte >> bit) & 1 != 0 {
                    let idx = i * 8 + bit;
                    if idx < self.num_slots {
                        self.complete.insert(idx);
                    }
                }
            }
        }
        Ok(())
    }

    /// Release `idx` if its completion bit is set, reading status if needed.
    fn clear_if_ready(&mut self, idx: usize) -> ExecResult<bool> {
        if !self.used.contains(idx) {
            return Ok(false);
        }
        if !self.complete.contains(idx) {
            self.read_status()?;
        }
        if self.complete.contains(idx) {
            self.release(idx);
            return Ok(true);
        }
        Ok(false)
    }

    fn write_command(&self, idx: usize, cmd: &Command) -> ExecResult<()> {
        let header_offset = CQ_BASE_ADDR + self.slot_size() * idx as u64;
        let count = cmd.header().count() as usize;
        let data = cmd.packet().snapshot(1, count);
        trace!("mbs slot {} writing {} bytes", idx, 4 * (count + 1));

        self.device.write_register_words(header_offset + 4, &data)?;

        cmd.set_state(CommandState::New);
        self.device.write_register_u32(header_offset, cmd.header().0)?;

        if self.cqint {
            if let Some(&addr) = CQ_STATUS_REGISTER_ADDR.get(idx / 32) {
                self.device.write_register_u32(addr, 1 << (idx % 32))?;
            }
        }
        Ok(())
    }
}

struct MbsCommand {
    cmd: Arc<Command>,
    device: DeviceId,
    slot: Option<usize>,
}

struct Control {
    pending: Vec<MbsCommand>,
    stop: bool,
    sleeping: bool,
}

struct MbsShared {
    control: Mutex<Control>,
    work: Condvar,
    queues: Mutex<HashMap<DeviceId, HwQueue>>,
    notifier: Notifier,
    slot_size: u32,
    cqint: bool,
    throttle_us: u64,
    errors: Arc<ErrorSlot>,
}

impl MbsShared {
    /// Claim a slot and write the packet. Returns false if the queue is full.
    ///
    /// The slot is given back if the packet cannot be written.
    fn start(queues: &mut HashMap<DeviceId, HwQueue>, entry: &mut MbsCommand) -> ExecResult<bool> {
        let queue = queues.get_mut(&entry.device).ok_or_else(|| {
            ExecError::SchedulerError(format!("no command queue for {}", entry.device))
        })?;
        let Some(idx) = queue.acquire() else {
            return Ok(false);
        };
        if let Err(e) = queue.write_command(idx, &entry.cmd) {
            queue.release(idx);
            return Err(e);
        }
        entry.slot = Some(idx);
        debug!("Command {} running in slot {}", entry.cmd.uid(), idx);
        Ok(true)
    }

    fn run(&self) -> ExecResult<()> {
        let mut cmds: Vec<MbsCommand> = Vec::new();
        loop {
            {
                let mut control = self.control.lock();
                while !control.stop && control.pending.is_empty() && cmds.is_empty() {
                    control.sleeping = true;
                    self.work.wait(&mut control);
                    control.sleeping = false;
                }
                if control.stop {
                    let active = cmds.len() + control.pending.len();
                    if active > 0 {
                        return Err(ExecError::SchedulerStopped(format!(
                            "stopped with {} active commands",
                            active
                        )));
                    }
                    return Ok(());
                }
                cmds.append(&mut control.pending);
            }

            throttle(self.throttle_us);
            self.update(&mut cmds)?;
        }
    }

    fn update(&self, cmds: &mut Vec<MbsCommand>) -> ExecResult<()> {
        let mut finished = Vec::new();
        let mut failed = Vec::new();
        {
            let mut queues = self.queues.lock();
            let mut i = 0;
            while i < cmds.len() {
                let entry = &mut cmds[i];
                match entry.slot {
                    None => match Self::start(&mut queues, entry) {
                        Ok(_) => i += 1,
                        Err(e) => {
                            warn!("Command {} could not be started: {}", entry.cmd.uid(), e);
                            failed.push(cmds.remove(i));
                        }
                    },
                    Some(idx) => {
                        let done = match queues.get_mut(&entry.device) {
                            Some(queue) => queue.clear_if_ready(idx)?,
                            None => false,
                        };
                        if done {
                            finished.push(cmds.remove(i));
                        } else {
                            i += 1;
                        }
                    }
                }
            }
        }

        for entry in finished {
            entry.cmd.set_state(CommandState::Completed);
            self.notifier.notify(entry.cmd, CommandState::Completed);
        }
        for entry in failed {
            entry.cmd.set_state(CommandState::Error);
            self.notifier.notify(entry.cmd, CommandState::Error);
        }
        Ok(())
    }
}

/// Embedded scheduler backend.
pub struct MbsScheduler {
    shared: Arc<MbsShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MbsScheduler {
    /// Start the scheduler thread.
    pub fn new(config: &SchedConfig) -> ExecResult<Self> {
        let errors = Arc::new(ErrorSlot::default());
        let shared = Arc::new(MbsShared {
            control: Mutex::new(Control {
                pending: Vec::new(),
                stop: false,
                sleeping: false,
            }),
            work: Condvar::new(),
            queues: Mutex::new(HashMap::new()),
            notifier: Notifier::new("mbs", config.threaded_notification, config.notify_workers)?,
            slot_size: config.ert_slotsize,
            cqint: config.cqint,
            throttle_us: config.polling_throttle_us,
            errors: errors.clone(),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = spawn_guarded("mbs-scheduler", errors, move || loop_shared.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Number of command queue slots for a device.
    pub fn num_slots(&self, device: DeviceId) -> Option<usize> {
        self.shared.queues.lock().get(&device).map(|q| q.num_slots)
    }
}

impl SchedulerBackend for MbsScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::Mbs
    }

    fn init(&self, device: &Arc<dyn Device>) -> ExecResult<()> {
        let mut queues = self.shared.queues.lock();
        if queues.contains_key(&device.id()) {
            return Ok(());
        }
        let queue = HwQueue::new(Arc::clone(device), self.shared.slot_size, self.shared.cqint);
        info!("{}: mbs command queue with {} slots", device.id(), queue.num_slots);
        queues.insert(device.id(), queue);
        Ok(())
    }

    fn submit(&self, cmd: Arc<Command>, _managed: bool) -> ExecResult<()> {
        self.shared.errors.check()?;
        let device = cmd.device().id();
        if !self.shared.queues.lock().contains_key(&device) {
            return Err(ExecError::SchedulerError(format!(
                "no command queue for {}",
                device
            )));
        }

        let mut entry = MbsCommand {
            cmd,
            device,
            slot: None,
        };
        let mut control = self.shared.control.lock();
        if control.stop {
            return Err(ExecError::SchedulerStopped("mbs scheduler is stopped".into()));
        }
        // Start right away when the scheduler thread is asleep.
        if control.sleeping {
            MbsShared::start(&mut self.shared.queues.lock(), &mut entry)?;
        }
        control.pending.push(entry);
        drop(control);
        self.shared.work.notify_one();
        Ok(())
    }

    fn shutdown(&self) -> ExecResult<()> {
        self.shared.control.lock().stop = true;
        self.shared.work.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            join_worker(handle);
        }
        self.shared.notifier.stop();
        self.shared.errors.check()
    }

    fn last_error(&self) -> Option<String> {
        self.shared
            .errors
            .get()
            .or_else(|| self.shared.notifier.last_error())
    }

    fn requires_polling(&self) -> bool {
        true
    }
}

impl Drop for MbsScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("mbs scheduler shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Header, Opcode};
    use crate::device::{CompletionMode, SimDevice};
    use crate::memory::ExecBufferPool;

    #[test]
    fn test_slot_count_follows_slot_size() {
        let dev: Arc<dyn Device> = Arc::new(SimDevice::new(0, 1));
        assert_eq!(HwQueue::new(dev.clone(), 0x1000, false).num_slots, 16);
        assert_eq!(HwQueue::new(dev.clone(), 0x100, false).num_slots, 256);
        assert_eq!(HwQueue::new(dev, 0x80, false).num_slots, MAX_SLOTS);
    }

    #[test]
    fn test_write_and_complete_slot() {
        let sim = Arc::new(SimDevice::new(0, 2).with_completion_mode(CompletionMode::Manual));
        let device: Arc<dyn Device> = sim.clone();
        let backend: Arc<dyn SchedulerBackend> =
            Arc::new(MbsScheduler::new(&SchedConfig::default().with_ert(true)).unwrap());
        let pool = Arc::new(ExecBufferPool::new(4096));
        let cmd = Command::new(&device, Opcode::StartCu, &pool, &backend).unwrap();
        cmd.set_cu_mask(&[1]).unwrap();
        cmd.write_payload(0, &[0, 0, 0, 0, 7]).unwrap();

        let mut queue = HwQueue::new(device.clone(), 0x1000, true);
        let idx = queue.acquire().unwrap();
        assert_eq!(idx, 0);
        queue.write_command(idx, &cmd).unwrap();

        let header = Header(sim.cq_word(0));
        assert_eq!(header.state(), CommandState::New);
        assert_eq!(sim.cq_word(1), 0b10);
        assert_eq!(sim.cq_word(6), 7);
        assert_eq!(sim.cq_interrupts(), 1);

        assert!(!queue.clear_if_ready(idx).unwrap());
        assert_eq!(sim.complete_cq_slots(), 1);
        assert!(queue.clear_if_ready(idx).unwrap());
        assert!(!queue.clear_if_ready(idx).unwrap());
        assert_eq!(queue.acquire(), Some(0));
        backend.shutdown().unwrap();
    }

    #[test]
    fn test_failed_write_gives_slot_back() {
        let sim = Arc::new(SimDevice::new(0, 1).with_completion_mode(CompletionMode::Manual));
        let device: Arc<dyn Device> = sim.clone();
        let backend: Arc<dyn SchedulerBackend> =
            Arc::new(MbsScheduler::new(&SchedConfig::default().with_ert(true)).unwrap());
        let pool = Arc::new(ExecBufferPool::new(4096));
        let cmd = Command::new(&device, Opcode::StartCu, &pool, &backend).unwrap();
        cmd.set_cu_mask(&[0]).unwrap();

        let mut queues = HashMap::new();
        queues.insert(device.id(), HwQueue::new(device.clone(), 0x1000, false));
        let mut entry = MbsCommand {
            cmd,
            device: device.id(),
            slot: None,
        };

        sim.set_register_failure(true);
        for _ in 0..20 {
            assert!(MbsShared::start(&mut queues, &mut entry).is_err());
            assert_eq!(entry.slot, None);
        }
        sim.set_register_failure(false);

        assert!(MbsShared::start(&mut queues, &mut entry).unwrap());
        assert_eq!(entry.slot, Some(0));
        backend.shutdown().unwrap();
    }
}
