//! In-process software device.
//!
//! `SimDevice` implements [`Device`] entirely in host memory so the
//! scheduling core can run without a driver. It models:
//! - HLS CU control registers (AP_START / AP_DONE / AP_IDLE, clear-on-read done),
//! - the driver exec buffer path (`exec_buf` / `exec_wait`),
//! - the embedded scheduler command queue with its completion status registers.
//!
//! Completions happen either as soon as work is started
//! ([`CompletionMode::Immediate`]) or when a test drives them
//! ([`CompletionMode::Manual`]).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::xclbin::{
    AddressQualifier, Connection, IpKind, IpLayoutEntry, KernelArgMeta, KernelMeta,
    XclbinMetadata,
};
use super::{AccessMode, BoHandle, Device, DeviceId, PacketMemory};
use crate::command::packet::{
    CommandState, ConfigurePacket, Header, Opcode, AP_CONTINUE, AP_DONE, AP_IDLE, AP_START,
    CQ_BASE_ADDR, CQ_SIZE, CQ_STATUS_REGISTER_ADDR, CSR_ADDR, CU_ADDR_RANGE,
};
use crate::context::{CONTEXT_INDEX_OFFSET, VIRTUAL_CU_INDEX};
use crate::error::{ExecError, ExecResult};

/// Base address of the first CU in generated layouts.
pub const SIM_CU_BASE: u64 = 0x1800000;

const CQ_STATUS_WORDS: usize = 8;

/// When simulated work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work completes as soon as it is started.
    Immediate,
    /// Work completes when the test calls one of the `complete_*` methods.
    Manual,
}

#[derive(Debug, Default)]
struct SimCu {
    running: u32,
    unacked_done: u32,
    starts: u64,
    continues: u64,
    last_regmap: Vec<u32>,
}

struct SimState {
    mode: CompletionMode,
    next_handle: u32,
    exec_buffers: HashMap<BoHandle, Arc<PacketMemory>>,
    exec_buffer_limit: Option<usize>,
    allocations: u64,
    contexts: HashMap<(Uuid, u32), AccessMode>,
    context_opens: u64,
    context_closes: u64,
    cus: Vec<SimCu>,
    registers: HashMap<u64, u32>,
    pending_exec: VecDeque<BoHandle>,
    unreported: u32,
    fail_next_exec_buf: bool,
    fail_register_io: bool,
    cq: Vec<u32>,
    cq_slot_size: u32,
    cq_pending: VecDeque<usize>,
    cq_status: [u32; CQ_STATUS_WORDS],
    cq_interrupts: u64,
    configured: Option<ConfigurePacket>,
}

/// Simulated accelerator device.
pub struct SimDevice {
    id: DeviceId,
    name: String,
    metadata: Arc<XclbinMetadata>,
    cu_bases: HashMap<u64, usize>,
    state: Mutex<SimState>,
    completion: Condvar,
}

impl SimDevice {
    /// Create a device with `num_cus` instances of a generated `vadd` kernel.
    pub fn new(index: u32, num_cus: usize) -> Self {
        Self::with_metadata(index, Self::generate_xclbin(num_cus))
    }

    /// Create a device with explicit xclbin metadata loaded.
    pub fn with_metadata(index: u32, metadata: XclbinMetadata) -> Self {
        let cu_addrs = metadata.cu_addresses();
        let cu_bases = cu_addrs
            .iter()
            .enumerate()
            .map(|(i, &addr)| (addr, i))
            .collect();
        let cus = cu_addrs.iter().map(|_| SimCu::default()).collect();

        Self {
            id: DeviceId::new(index),
            name: format!("sim{}", index),
            metadata: Arc::new(metadata),
            cu_bases,
            state: Mutex::new(SimState {
                mode: CompletionMode::Immediate,
                next_handle: 1,
                exec_buffers: HashMap::new(),
                exec_buffer_limit: None,
                allocations: 0,
                contexts: HashMap::new(),
                context_opens: 0,
                context_closes: 0,
                cus,
                registers: HashMap::new(),
                pending_exec: VecDeque::new(),
                unreported: 0,
                fail_next_exec_buf: false,
                fail_register_io: false,
                cq: vec![0; CQ_SIZE / 4],
                cq_slot_size: 0x1000,
                cq_pending: VecDeque::new(),
                cq_status: [0; CQ_STATUS_WORDS],
                cq_interrupts: 0,
                configured: None,
            }),
            completion: Condvar::new(),
        }
    }

    /// Set the completion mode.
    pub fn with_completion_mode(self, mode: CompletionMode) -> Self {
        self.state.lock().mode = mode;
        self
    }

    /// Generate metadata for `num_cus` instances of `vadd`.
    ///
    /// Arguments: `a`, `b`, `out` (global), `n` (scalar), `coeffs`
    /// (scalar pointer) and `s` (stream). Argument 0 connects to banks 0
    /// and 2, argument 1 to bank 1 and argument 2 to banks 2 and 33.
    pub fn generate_xclbin(num_cus: usize) -> XclbinMetadata {
        let ip_layout = (0..num_cus)
            .map(|i| IpLayoutEntry {
                name: format!("vadd:vadd_{}", i + 1),
                base_address: SIM_CU_BASE + i as u64 * CU_ADDR_RANGE,
                kind: IpKind::Kernel,
            })
            .collect();

        let mut connectivity = Vec::new();
        for ip in 0..num_cus as u32 {
            for (arg, bank) in [(0, 0), (0, 2), (1, 1), (2, 33), (2, 2)] {
                connectivity.push(Connection {
                    ip_layout_index: ip,
                    arg_index: arg,
                    mem_data_index: bank,
                });
            }
        }

        let arg = |name: &str, index, offset, size, host_type: &str, q| KernelArgMeta {
            name: name.to_string(),
            index,
            offset,
            size,
            host_type: host_type.to_string(),
            address_qualifier: q,
        };
        let kernels = vec![KernelMeta {
            name: "vadd".to_string(),
            args: vec![
                arg("a", 0, 0x10, 8, "int*", AddressQualifier::Global),
                arg("b", 1, 0x1c, 8, "int*", AddressQualifier::Global),
                arg("out", 2, 0x28, 8, "int*", AddressQualifier::Global),
                arg("n", 3, 0x34, 4, "unsigned int", AddressQualifier::Scalar),
                arg("coeffs", 4, 0x3c, 8, "float*", AddressQualifier::Scalar),
                arg("s", 5, 0, 0, "stream<int>", AddressQualifier::Stream),
            ],
        }];

        XclbinMetadata {
            uuid: Uuid::new_v4(),
            ip_layout,
            connectivity,
            kernels,
        }
    }

    /// Loaded metadata.
    pub fn metadata(&self) -> &Arc<XclbinMetadata> {
        &self.metadata
    }

    /// UUID of the loaded xclbin.
    pub fn uuid(&self) -> Uuid {
        self.metadata.uuid
    }

    /// Complete the oldest running job on a CU. Returns false if idle.
    pub fn complete_cu(&self, cu: usize) -> bool {
        let mut state = self.state.lock();
        match state.cus.get_mut(cu) {
            Some(c) if c.running > 0 => {
                c.running -= 1;
                c.unacked_done += 1;
                true
            }
            _ => false,
        }
    }

    /// Jobs started but not completed on a CU.
    pub fn cu_running(&self, cu: usize) -> u32 {
        self.state.lock().cus.get(cu).map(|c| c.running).unwrap_or(0)
    }

    /// Number of AP_START writes seen by a CU.
    pub fn cu_starts(&self, cu: usize) -> u64 {
        self.state.lock().cus.get(cu).map(|c| c.starts).unwrap_or(0)
    }

    /// Number of AP_CONTINUE acknowledgements seen by a CU.
    pub fn cu_continues(&self, cu: usize) -> u64 {
        self.state.lock().cus.get(cu).map(|c| c.continues).unwrap_or(0)
    }

    /// Last register map block written to a CU.
    pub fn cu_regmap(&self, cu: usize) -> Vec<u32> {
        self.state
            .lock()
            .cus
            .get(cu)
            .map(|c| c.last_regmap.clone())
            .unwrap_or_default()
    }

    /// Raw register value outside the CU control words.
    pub fn register(&self, addr: u64) -> u32 {
        self.state.lock().registers.get(&addr).copied().unwrap_or(0)
    }

    /// Complete every exec buffer submitted through `exec_buf`.
    pub fn complete_exec_buffers(&self, final_state: CommandState) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<BoHandle> = state.pending_exec.drain(..).collect();
        for handle in &pending {
            if let Some(mem) = state.exec_buffers.get(handle) {
                let mut header = Header(mem.load(0));
                header.set_state(final_state);
                mem.store(0, header.0);
            }
        }
        state.unreported += pending.len() as u32;
        drop(state);
        self.completion.notify_all();
        pending.len()
    }

    /// Exec buffers submitted and not yet completed.
    pub fn pending_exec_buffers(&self) -> usize {
        self.state.lock().pending_exec.len()
    }

    /// Complete every started command queue slot.
    pub fn complete_cq_slots(&self) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<usize> = state.cq_pending.drain(..).collect();
        for &slot in &pending {
            Self::complete_slot(&mut state, slot);
        }
        pending.len()
    }

    /// Raw command queue word.
    pub fn cq_word(&self, idx: usize) -> u32 {
        self.state.lock().cq.get(idx).copied().unwrap_or(0)
    }

    /// Command queue slots started and not yet completed.
    pub fn pending_cq_slots(&self) -> usize {
        self.state.lock().cq_pending.len()
    }

    /// Configuration received through the command queue.
    pub fn configured(&self) -> Option<ConfigurePacket> {
        self.state.lock().configured.clone()
    }

    /// Host to scheduler interrupts raised.
    pub fn cq_interrupts(&self) -> u64 {
        self.state.lock().cq_interrupts
    }

    /// Make the next `exec_buf` call fail.
    pub fn fail_next_exec_buf(&self) {
        self.state.lock().fail_next_exec_buf = true;
    }

    /// Make register access fail until reset.
    pub fn set_register_failure(&self, fail: bool) {
        self.state.lock().fail_register_io = fail;
    }

    /// Cap the number of live exec buffers.
    pub fn set_exec_buffer_limit(&self, limit: Option<usize>) {
        self.state.lock().exec_buffer_limit = limit;
    }

    /// Exec buffer allocations performed.
    pub fn exec_buffer_allocations(&self) -> u64 {
        self.state.lock().allocations
    }

    /// Exec buffers allocated and not freed.
    pub fn live_exec_buffers(&self) -> usize {
        self.state.lock().exec_buffers.len()
    }

    /// Hardware context opens performed.
    pub fn context_opens(&self) -> u64 {
        self.state.lock().context_opens
    }

    /// Hardware context closes performed.
    pub fn context_closes(&self) -> u64 {
        self.state.lock().context_closes
    }

    /// Currently open context indices and their access modes.
    pub fn open_contexts(&self) -> Vec<(u32, AccessMode)> {
        let mut open: Vec<_> = self
            .state
            .lock()
            .contexts
            .iter()
            .map(|((_, idx), mode)| (*idx, *mode))
            .collect();
        open.sort_by_key(|(idx, _)| *idx);
        open
    }

    fn complete_slot(state: &mut SimState, slot: usize) {
        let header_word = slot * state.cq_slot_size as usize / 4;
        let mut header = Header(state.cq[header_word]);
        header.set_state(CommandState::Completed);
        state.cq[header_word] = header.0;
        state.cq_status[slot / 32] |= 1 << (slot % 32);
    }

    fn start_slot(&self, state: &mut SimState, slot: usize) {
        let header_word = slot * state.cq_slot_size as usize / 4;
        let header = Header(state.cq[header_word]);
        if Opcode::from_raw(header.opcode()) == Some(Opcode::Configure) {
            let count = header.count() as usize;
            let payload = state
                .cq
                .get(header_word + 1..header_word + 1 + count)
                .unwrap_or(&[]);
            if let Some(packet) = ConfigurePacket::from_words(payload) {
                debug!(
                    "{}: configured {} CUs, slot size {:#x}",
                    self.name,
                    packet.num_cus(),
                    packet.slot_size
                );
                state.cq_slot_size = packet.slot_size;
                state.configured = Some(packet);
            }
            Self::complete_slot(state, slot);
            return;
        }
        match state.mode {
            CompletionMode::Immediate => Self::complete_slot(state, slot),
            CompletionMode::Manual => state.cq_pending.push_back(slot),
        }
    }

    fn check_io(state: &SimState, offset: u64, len: usize) -> ExecResult<()> {
        if state.fail_register_io {
            return Err(ExecError::register_io(offset, "simulated bus error"));
        }
        if offset % 4 != 0 || len % 4 != 0 {
            return Err(ExecError::register_io(offset, "unaligned access"));
        }
        Ok(())
    }

    fn read_word(&self, state: &mut SimState, addr: u64) -> u32 {
        if (CSR_ADDR..CSR_ADDR + CQ_STATUS_WORDS as u64 * 4).contains(&addr) {
            let idx = ((addr - CSR_ADDR) / 4) as usize;
            return std::mem::take(&mut state.cq_status[idx]);
        }
        if (CQ_BASE_ADDR..CQ_BASE_ADDR + CQ_SIZE as u64).contains(&addr) {
            return state.cq[((addr - CQ_BASE_ADDR) / 4) as usize];
        }
        if let Some(&cu) = self.cu_bases.get(&addr) {
            let c = &mut state.cus[cu];
            if c.unacked_done > 0 {
                c.unacked_done -= 1;
                return if c.running > 0 { AP_DONE | AP_START } else { AP_DONE | AP_IDLE };
            }
            return if c.running > 0 { AP_START } else { AP_IDLE };
        }
        state.registers.get(&addr).copied().unwrap_or(0)
    }

    fn write_ctrl(state: &mut SimState, cu: usize, value: u32) {
        let mode = state.mode;
        let c = &mut state.cus[cu];
        if value & AP_START != 0 {
            c.starts += 1;
            match mode {
                CompletionMode::Immediate => c.unacked_done += 1,
                CompletionMode::Manual => c.running += 1,
            }
        }
        if value & AP_CONTINUE != 0 {
            c.continues += 1;
        }
    }
}

impl Device for SimDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn open_context(&self, xclbin: &Uuid, index: u32, mode: AccessMode) -> ExecResult<()> {
        if *xclbin != self.metadata.uuid {
            return Err(ExecError::ContextFailed(format!("xclbin {} is not loaded", xclbin)));
        }
        if index != VIRTUAL_CU_INDEX {
            let cu = index.checked_sub(CONTEXT_INDEX_OFFSET);
            if cu.map_or(true, |cu| cu as usize >= self.cu_bases.len()) {
                return Err(ExecError::ContextFailed(format!("no CU for context index {}", index)));
            }
        }
        let mut state = self.state.lock();
        if state.contexts.contains_key(&(*xclbin, index)) {
            return Err(ExecError::ContextFailed(format!("context {} already open", index)));
        }
        state.contexts.insert((*xclbin, index), mode);
        state.context_opens += 1;
        Ok(())
    }

    fn close_context(&self, xclbin: &Uuid, index: u32) -> ExecResult<()> {
        let mut state = self.state.lock();
        if state.contexts.remove(&(*xclbin, index)).is_none() {
            return Err(ExecError::ContextFailed(format!("context {} is not open", index)));
        }
        state.context_closes += 1;
        Ok(())
    }

    fn read_register(&self, offset: u64, buf: &mut [u8]) -> ExecResult<()> {
        let mut state = self.state.lock();
        Self::check_io(&state, offset, buf.len())?;
        for (i, chunk) in buf.chunks_exact_mut(4).enumerate() {
            let value = self.read_word(&mut state, offset + 4 * i as u64);
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn write_register(&self, offset: u64, buf: &[u8]) -> ExecResult<()> {
        let mut state = self.state.lock();
        Self::check_io(&state, offset, buf.len())?;
        let words: Vec<u32> = buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if (CQ_BASE_ADDR..CQ_BASE_ADDR + CQ_SIZE as u64).contains(&offset) {
            let start = ((offset - CQ_BASE_ADDR) / 4) as usize;
            let end = start + words.len();
            if end > state.cq.len() {
                return Err(ExecError::register_io(offset, "write past command queue"));
            }
            state.cq[start..end].copy_from_slice(&words);
            let rel = offset - CQ_BASE_ADDR;
            if words.len() == 1
                && rel % state.cq_slot_size as u64 == 0
                && Header(words[0]).state() == CommandState::New
            {
                let slot = (rel / state.cq_slot_size as u64) as usize;
                self.start_slot(&mut state, slot);
            }
            return Ok(());
        }

        if CQ_STATUS_REGISTER_ADDR.contains(&offset) {
            state.cq_interrupts += 1;
            return Ok(());
        }

        if let Some(&cu) = self.cu_bases.get(&offset) {
            if words.len() > 1 {
                state.cus[cu].last_regmap = words.clone();
            }
            for (i, &w) in words.iter().enumerate().skip(1) {
                state.registers.insert(offset + 4 * i as u64, w);
            }
            if let Some(&ctrl) = words.first() {
                Self::write_ctrl(&mut state, cu, ctrl);
            }
            return Ok(());
        }

        for (i, &w) in words.iter().enumerate() {
            state.registers.insert(offset + 4 * i as u64, w);
        }
        Ok(())
    }

    fn alloc_exec_buffer(&self, size: usize) -> ExecResult<BoHandle> {
        let mut state = self.state.lock();
        if let Some(limit) = state.exec_buffer_limit {
            if state.exec_buffers.len() >= limit {
                return Err(ExecError::allocation(size, "simulated exec buffer limit reached"));
            }
        }
        let handle = BoHandle(state.next_handle);
        state.next_handle += 1;
        state.exec_buffers.insert(handle, Arc::new(PacketMemory::new(size)));
        state.allocations += 1;
        Ok(handle)
    }

    fn map_exec_buffer(&self, handle: BoHandle) -> ExecResult<Arc<PacketMemory>> {
        self.state
            .lock()
            .exec_buffers
            .get(&handle)
            .cloned()
            .ok_or_else(|| ExecError::UnknownHandle(format!("exec buffer {:?}", handle)))
    }

    fn unmap_exec_buffer(&self, handle: BoHandle) -> ExecResult<()> {
        if self.state.lock().exec_buffers.contains_key(&handle) {
            Ok(())
        } else {
            Err(ExecError::UnknownHandle(format!("exec buffer {:?}", handle)))
        }
    }

    fn free_exec_buffer(&self, handle: BoHandle) -> ExecResult<()> {
        self.state
            .lock()
            .exec_buffers
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| ExecError::UnknownHandle(format!("exec buffer {:?}", handle)))
    }

    fn exec_buf(&self, handle: BoHandle) -> ExecResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_exec_buf) {
            return Err(ExecError::SubmissionFailed("simulated exec_buf failure".into()));
        }
        let mem = state
            .exec_buffers
            .get(&handle)
            .cloned()
            .ok_or_else(|| ExecError::UnknownHandle(format!("exec buffer {:?}", handle)))?;

        let mut header = Header(mem.load(0));
        let immediate = state.mode == CompletionMode::Immediate
            || Opcode::from_raw(header.opcode()) == Some(Opcode::Configure);
        if immediate {
            header.set_state(CommandState::Completed);
            mem.store(0, header.0);
            state.unreported += 1;
            drop(state);
            self.completion.notify_all();
        } else {
            state.pending_exec.push_back(handle);
        }
        Ok(())
    }

    fn exec_wait(&self, timeout_ms: u32) -> ExecResult<u32> {
        let mut state = self.state.lock();
        if state.unreported == 0 && timeout_ms > 0 {
            let _ = self
                .completion
                .wait_for(&mut state, Duration::from_millis(timeout_ms as u64));
        }
        Ok(std::mem::take(&mut state.unreported))
    }

    fn loaded_xclbin(&self) -> Option<Uuid> {
        Some(self.metadata.uuid)
    }

    fn xclbin_metadata(&self, xclbin: &Uuid) -> ExecResult<Arc<XclbinMetadata>> {
        if *xclbin == self.metadata.uuid {
            Ok(Arc::clone(&self.metadata))
        } else {
            Err(ExecError::Device(format!("xclbin {} is not loaded on {}", xclbin, self.name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cu_done_is_clear_on_read() {
        let dev = SimDevice::new(0, 2).with_completion_mode(CompletionMode::Manual);
        let base = SIM_CU_BASE;

        dev.write_register_words(base, &[0, 1, 2, 3]).unwrap();
        assert_eq!(dev.cu_starts(0), 0);
        assert_eq!(dev.cu_regmap(0), vec![0, 1, 2, 3]);
        assert_eq!(dev.read_register_u32(base).unwrap(), AP_IDLE);

        dev.write_register_u32(base, AP_START).unwrap();
        assert_eq!(dev.read_register_u32(base).unwrap(), AP_START);

        assert!(dev.complete_cu(0));
        assert_eq!(dev.read_register_u32(base).unwrap(), AP_DONE | AP_IDLE);
        assert_eq!(dev.read_register_u32(base).unwrap(), AP_IDLE);
        assert!(!dev.complete_cu(0));
    }

    #[test]
    fn test_exec_buf_manual_completion() {
        let dev = SimDevice::new(0, 1).with_completion_mode(CompletionMode::Manual);
        let bo = dev.alloc_exec_buffer(64).unwrap();
        let mem = dev.map_exec_buffer(bo).unwrap();
        mem.store(0, Header::new(Opcode::StartCu, crate::command::CommandType::Cu).0);

        dev.exec_buf(bo).unwrap();
        assert_eq!(dev.exec_wait(0).unwrap(), 0);
        assert_eq!(dev.complete_exec_buffers(CommandState::Completed), 1);
        assert_eq!(dev.exec_wait(10).unwrap(), 1);
        assert_eq!(Header(mem.load(0)).state(), CommandState::Completed);
    }

    #[test]
    fn test_context_bookkeeping() {
        let dev = SimDevice::new(0, 2);
        let uuid = dev.uuid();
        dev.open_context(&uuid, CONTEXT_INDEX_OFFSET + 1, AccessMode::Shared).unwrap();
        assert!(dev
            .open_context(&uuid, CONTEXT_INDEX_OFFSET + 1, AccessMode::Shared)
            .is_err());
        assert!(dev.open_context(&uuid, 1, AccessMode::Shared).is_err());
        assert_eq!(dev.open_contexts(), vec![(CONTEXT_INDEX_OFFSET + 1, AccessMode::Shared)]);

        dev.close_context(&uuid, CONTEXT_INDEX_OFFSET + 1).unwrap();
        assert!(dev.close_context(&uuid, CONTEXT_INDEX_OFFSET + 1).is_err());
        assert_eq!(dev.context_opens(), 1);
        assert_eq!(dev.context_closes(), 1);
    }

    #[test]
    fn test_register_failure() {
        let dev = SimDevice::new(0, 1);
        dev.set_register_failure(true);
        assert!(matches!(
            dev.read_register_u32(SIM_CU_BASE),
            Err(ExecError::RegisterIo { .. })
        ));
    }
}
