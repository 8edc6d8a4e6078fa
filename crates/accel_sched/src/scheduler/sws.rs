//! Software scheduler.
//!
//! A single scheduler thread owns all CU and submit-queue state. Client
//! threads only touch the staging list that hands new commands over.
//!
//! Per command the scheduler walks `queued → submitted → running →
//! completed → freed`:
//! - **queued → submitted** when the device's submit queue has a free slot;
//! - **submitted → running** when the lowest indexed CU of the command's CU
//!   mask is ready (AP_START low). The register map is written with word 0
//!   cleared, then AP_START is asserted;
//! - **running → completed** when the CU reports AP_DONE/AP_IDLE and the
//!   command is at the head of that CU's FIFO of started commands;
//! - **completed → freed** releases the slot and delivers the notification.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use fixedbitset::FixedBitSet;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::notify::Notifier;
use super::{join_worker, spawn_guarded, throttle, BackendKind, ErrorSlot, SchedulerBackend};
use crate::command::packet::{
    ConfigurePacket, AP_CONTINUE, AP_DONE, AP_IDLE, AP_START, CQ_SIZE, EXEC_WRITE_PAIRS_OFFSET,
};
use crate::command::{Command, CommandState, Opcode};
use crate::config::SchedConfig;
use crate::device::{loaded_metadata, Device, DeviceId};
use crate::error::{ExecError, ExecResult};

/// Maximum number of submit queue slots.
pub const MAX_SLOTS: usize = 128;

/// One compute unit as seen by the scheduler.
#[derive(Debug)]
struct SwsCu {
    index: u32,
    addr: u64,
    running: VecDeque<u64>,
    ctrlreg: u32,
    done_cnt: u32,
    run_cnt: u32,
}

impl SwsCu {
    fn new(index: u32, addr: u64) -> Self {
        Self {
            index,
            addr,
            running: VecDeque::new(),
            ctrlreg: 0,
            done_cnt: 0,
            run_cnt: 0,
        }
    }

    fn poll(&mut self, device: &dyn Device) -> ExecResult<()> {
        self.ctrlreg = device.read_register_u32(self.addr)?;
        if self.run_cnt > 0 && self.ctrlreg & (AP_DONE | AP_IDLE) != 0 {
            self.done_cnt += 1;
            self.run_cnt -= 1;
            device.write_register_u32(self.addr, AP_CONTINUE)?;
        }
        Ok(())
    }

    fn ready(&mut self, device: &dyn Device) -> ExecResult<bool> {
        if self.ctrlreg & AP_START != 0 {
            self.poll(device)?;
        }
        Ok(self.ctrlreg & AP_START == 0)
    }

    /// Command at the head of the FIFO if the CU has reported a completion.
    fn done_head(&mut self, device: &dyn Device) -> ExecResult<Option<u64>> {
        if self.done_cnt == 0 {
            self.poll(device)?;
        }
        Ok(if self.done_cnt > 0 {
            self.running.front().copied()
        } else {
            None
        })
    }

    fn pop_done(&mut self) {
        if self.done_cnt > 0 {
            self.done_cnt -= 1;
            self.running.pop_front();
        }
    }

    fn start(&mut self, device: &dyn Device, cmd: &Command) -> ExecResult<()> {
        let mut regmap = cmd.payload_words();
        if cmd.opcode() == Opcode::ExecWrite && regmap.len() > EXEC_WRITE_PAIRS_OFFSET {
            for pair in regmap[EXEC_WRITE_PAIRS_OFFSET..].chunks_exact(2) {
                device.write_register_u32(self.addr + pair[0] as u64, pair[1])?;
            }
            regmap.truncate(EXEC_WRITE_PAIRS_OFFSET);
        }
        if let Some(ctrl) = regmap.first_mut() {
            *ctrl = 0;
            device.write_register_words(self.addr, &regmap)?;
        }
        device.write_register_u32(self.addr, AP_START)?;

        self.ctrlreg |= AP_START;
        self.run_cnt += 1;
        self.running.push_back(cmd.uid());
        debug!("CU {} started command {}", self.index, cmd.uid());
        Ok(())
    }
}

/// Per-device submit queue and CUs.
struct ExecCore {
    device: Arc<dyn Device>,
    num_slots: usize,
    slots: FixedBitSet,
    cus: Vec<SwsCu>,
}

impl ExecCore {
    fn new(device: Arc<dyn Device>, cu_addrs: &[u64], slot_size: u32) -> Self {
        let mut core = Self {
            device,
            num_slots: 0,
            slots: FixedBitSet::with_capacity(MAX_SLOTS),
            cus: cu_addrs
                .iter()
                .enumerate()
                .map(|(i, &addr)| SwsCu::new(i as u32, addr))
                .collect(),
        };
        core.set_slot_size(slot_size);
        core
    }

    fn set_slot_size(&mut self, slot_size: u32) {
        self.num_slots = (CQ_SIZE / slot_size.max(1) as usize).min(MAX_SLOTS);
        self.slots.clear();
        self.slots.set_range(self.num_slots.., true);
    }

    fn acquire_slot(&mut self) -> Option<usize> {
        let slot = (0..self.num_slots).find(|&i| !self.slots.contains(i))?;
        self.slots.insert(slot);
        Some(slot)
    }

    fn release_slot(&mut self, slot: usize) {
        self.slots.set(slot, false);
    }

    fn idle(&self) -> bool {
        self.cus.iter().all(|cu| cu.running.is_empty())
    }

    fn configure(&mut self, packet: &ConfigurePacket) -> ExecResult<()> {
        if packet.slot_size == 0 || packet.slot_size as usize > CQ_SIZE {
            return Err(ExecError::InvalidConfig(format!(
                "configure slot size {:#x}",
                packet.slot_size
            )));
        }
        if !self.idle() {
            return Err(ExecError::SchedulerError(
                "configure while CUs are running".into(),
            ));
        }
        let in_use = self.slots.count_ones(..self.num_slots);
        self.set_slot_size(packet.slot_size);
        // Only the configure command itself may hold a slot here.
        for slot in 0..in_use.min(self.num_slots) {
            self.slots.insert(slot);
        }
        self.cus = packet
            .cu_addrs
            .iter()
            .enumerate()
            .map(|(i, &addr)| SwsCu::new(i as u32, addr as u64))
            .collect();
        info!(
            "{}: sws configured {} CUs, {} slots",
            self.device.id(),
            self.cus.len(),
            self.num_slots
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwsState {
    Queued,
    Submitted,
    Running,
    Completed,
}

struct SwsCommand {
    cmd: Arc<Command>,
    device: DeviceId,
    state: SwsState,
    slot: Option<usize>,
    cu: Option<usize>,
    result: CommandState,
}

impl SwsCommand {
    fn new(cmd: Arc<Command>) -> Self {
        cmd.set_state(CommandState::Queued);
        Self {
            device: cmd.device().id(),
            cmd,
            state: SwsState::Queued,
            slot: None,
            cu: None,
            result: CommandState::Completed,
        }
    }

    fn complete(&mut self, result: CommandState) {
        self.result = result;
        self.state = SwsState::Completed;
    }

    /// Advance as far as possible. Returns true if the state changed.
    fn advance(&mut self, core: &mut ExecCore) -> ExecResult<bool> {
        let before = self.state;

        if self.state == SwsState::Queued {
            if let Some(slot) = core.acquire_slot() {
                self.slot = Some(slot);
                self.state = SwsState::Submitted;
            }
        }

        if self.state == SwsState::Submitted {
            self.submitted_to_running(core)?;
        }

        if self.state == SwsState::Running {
            if let Some(idx) = self.cu {
                let cu = &mut core.cus[idx];
                if cu.done_head(core.device.as_ref())? == Some(self.cmd.uid()) {
                    cu.pop_done();
                    self.complete(CommandState::Completed);
                }
            }
        }

        Ok(self.state != before)
    }

    fn submitted_to_running(&mut self, core: &mut ExecCore) -> ExecResult<()> {
        match self.cmd.opcode() {
            Opcode::Configure => {
                let packet = ConfigurePacket::from_words(&self.cmd.payload_words())
                    .ok_or_else(|| ExecError::SchedulerError("malformed configure packet".into()))?;
                match core.configure(&packet) {
                    Ok(()) => self.complete(CommandState::Completed),
                    Err(e) => {
                        warn!("Configure rejected: {}", e);
                        self.complete(CommandState::Error);
                    }
                }
                return Ok(());
            }
            op if !op.has_cu_mask() => {
                warn!("sws cannot execute {:?} commands", op);
                self.complete(CommandState::Error);
                return Ok(());
            }
            _ => {}
        }

        let candidates: Vec<usize> = self
            .cmd
            .cu_indices()
            .into_iter()
            .map(|i| i as usize)
            .filter(|&i| i < core.cus.len())
            .collect();
        if candidates.is_empty() {
            warn!("Command {} has no CU on {}", self.cmd.uid(), self.device);
            self.complete(CommandState::Error);
            return Ok(());
        }

        let device = Arc::clone(&core.device);
        for idx in candidates {
            let cu = &mut core.cus[idx];
            if cu.ready(device.as_ref())? {
                cu.start(device.as_ref(), &self.cmd)?;
                self.cmd.set_state(CommandState::Running);
                self.cu = Some(idx);
                self.state = SwsState::Running;
                break;
            }
        }
        Ok(())
    }
}

struct Control {
    pending: Vec<Arc<Command>>,
    stop: bool,
}

struct SwsShared {
    control: Mutex<Control>,
    work: Condvar,
    cores: Mutex<HashMap<DeviceId, ExecCore>>,
    notifier: Notifier,
    slot_size: u32,
    throttle_us: u64,
    errors: Arc<ErrorSlot>,
}

impl SwsShared {
    fn run(&self) -> ExecResult<()> {
        let mut queue: Vec<SwsCommand> = Vec::new();
        let mut progressed = true;

        loop {
            {
                let mut control = self.control.lock();
                while !control.stop && control.pending.is_empty() && queue.is_empty() {
                    self.work.wait(&mut control);
                }
                if control.stop {
                    let active = queue.len() + control.pending.len();
                    if active > 0 {
                        return Err(ExecError::SchedulerStopped(format!(
                            "stopped with {} active commands",
                            active
                        )));
                    }
                    return Ok(());
                }
                queue.extend(control.pending.drain(..).map(SwsCommand::new));
            }

            if !progressed {
                throttle(self.throttle_us);
            }
            progressed = self.step(&mut queue)?;
        }
    }

    fn step(&self, queue: &mut Vec<SwsCommand>) -> ExecResult<bool> {
        let mut progressed = false;
        let mut finished = Vec::new();
        {
            let mut cores = self.cores.lock();
            let mut i = 0;
            while i < queue.len() {
                let entry = &mut queue[i];
                let core = cores.get_mut(&entry.device).ok_or_else(|| {
                    ExecError::SchedulerError(format!("{} was never initialized", entry.device))
                })?;
                progressed |= entry.advance(core)?;
                if entry.state == SwsState::Completed {
                    let entry = queue.remove(i);
                    if let Some(slot) = entry.slot {
                        core_release(&mut cores, entry.device, slot);
                    }
                    finished.push(entry);
                    continue;
                }
                i += 1;
            }
        }

        for entry in finished {
            entry.cmd.set_state(entry.result);
            self.notifier.notify(entry.cmd, entry.result);
        }
        Ok(progressed)
    }
}

fn core_release(cores: &mut HashMap<DeviceId, ExecCore>, device: DeviceId, slot: usize) {
    if let Some(core) = cores.get_mut(&device) {
        core.release_slot(slot);
    }
}

/// Software scheduler backend.
pub struct SwsScheduler {
    shared: Arc<SwsShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SwsScheduler {
    /// Start the scheduler thread.
    pub fn new(config: &SchedConfig) -> ExecResult<Self> {
        let errors = Arc::new(ErrorSlot::default());
        // Completions of one CU are pushed in order and must be delivered in order.
        if config.threaded_notification && config.notify_workers > 1 {
            debug!(
                "sws delivers completions on one notify worker, ignoring notify_workers = {}",
                config.notify_workers
            );
        }
        let shared = Arc::new(SwsShared {
            control: Mutex::new(Control {
                pending: Vec::new(),
                stop: false,
            }),
            work: Condvar::new(),
            cores: Mutex::new(HashMap::new()),
            notifier: Notifier::new("sws", config.threaded_notification, 1)?,
            slot_size: config.ert_slotsize,
            throttle_us: config.polling_throttle_us,
            errors: errors.clone(),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = spawn_guarded("sws-scheduler", errors, move || loop_shared.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Number of submit queue slots configured for a device.
    pub fn num_slots(&self, device: DeviceId) -> Option<usize> {
        self.shared.cores.lock().get(&device).map(|c| c.num_slots)
    }

    /// Number of CUs known for a device.
    pub fn num_cus(&self, device: DeviceId) -> Option<usize> {
        self.shared.cores.lock().get(&device).map(|c| c.cus.len())
    }
}

impl SchedulerBackend for SwsScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::Sws
    }

    fn init(&self, device: &Arc<dyn Device>) -> ExecResult<()> {
        let metadata = loaded_metadata(device.as_ref())?;
        let mut cores = self.shared.cores.lock();
        if cores.contains_key(&device.id()) {
            debug!("{} already initialized", device.id());
            return Ok(());
        }
        let core = ExecCore::new(Arc::clone(device), &metadata.cu_addresses(), self.shared.slot_size);
        info!(
            "{}: sws exec core with {} CUs, {} slots",
            device.id(),
            core.cus.len(),
            core.num_slots
        );
        cores.insert(device.id(), core);
        Ok(())
    }

    fn submit(&self, cmd: Arc<Command>, _managed: bool) -> ExecResult<()> {
        self.shared.errors.check()?;
        if !self.shared.cores.lock().contains_key(&cmd.device().id()) {
            return Err(ExecError::SchedulerError(format!(
                "{} was never initialized",
                cmd.device().id()
            )));
        }
        let mut control = self.shared.control.lock();
        if control.stop {
            return Err(ExecError::SchedulerStopped("sws scheduler is stopped".into()));
        }
        control.pending.push(cmd);
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
}

impl Drop for SwsScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("sws scheduler shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CompletionMode, SimDevice};

    #[test]
    fn test_slot_geometry() {
        let dev: Arc<dyn Device> = Arc::new(SimDevice::new(0, 1));
        let mut core = ExecCore::new(dev.clone(), &[0x1800000], 0x1000);
        assert_eq!(core.num_slots, 16);
        let slots: Vec<_> = (0..16).map(|_| core.acquire_slot().unwrap()).collect();
        assert_eq!(slots, (0..16).collect::<Vec<_>>());
        assert_eq!(core.acquire_slot(), None);
        core.release_slot(7);
        assert_eq!(core.acquire_slot(), Some(7));

        let core = ExecCore::new(dev, &[], 0x100);
        assert_eq!(core.num_slots, MAX_SLOTS);
    }

    #[test]
    fn test_cu_fifo_accounting() {
        let sim = Arc::new(SimDevice::new(0, 1).with_completion_mode(CompletionMode::Manual));
        let dev: &dyn Device = sim.as_ref();
        let mut cu = SwsCu::new(0, crate::device::sim::SIM_CU_BASE);

        assert!(cu.ready(dev).unwrap());
        cu.running.push_back(1);
        cu.run_cnt = 1;
        cu.ctrlreg = AP_START;
        dev.write_register_u32(cu.addr, AP_START).unwrap();

        assert_eq!(cu.done_head(dev).unwrap(), None);
        assert!(!cu.ready(dev).unwrap());

        sim.complete_cu(0);
        assert_eq!(cu.done_head(dev).unwrap(), Some(1));
        assert_eq!(sim.cu_continues(0), 1);
        cu.pop_done();
        assert!(cu.running.is_empty());
        assert_eq!(cu.done_head(dev).unwrap(), None);
    }

    #[test]
    fn test_single_notify_worker() {
        let config = SchedConfig::default()
            .with_threaded_notification(true)
            .with_notify_workers(4);
        let sws = SwsScheduler::new(&config).unwrap();
        assert_eq!(sws.shared.notifier.workers(), 1);
        sws.shutdown().unwrap();
    }
}
