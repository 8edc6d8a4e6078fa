//! Command objects.
//!
//! A [`Command`] wraps one exec buffer as a typed packet and tracks a single
//! execution at a time. The scheduler backend writes the packet state and
//! calls [`Command::notify`] when hardware reports a terminal state; waiters
//! are woken under the command lock while callbacks run after the lock is
//! released, so a callback may re-run the command or drop its owner.
//!
//! # Example
//!
//! ```rust,ignore
//! let cmd = runtime.command(&device, Opcode::StartCu)?;
//! cmd.set_cu_mask(&[2, 5])?;
//! cmd.set_payload(3, 0xDEADBEEF)?;
//! cmd.run()?;
//! let state = cmd.wait(None)?;
//! ```

pub mod packet;

pub use packet::{CommandState, CommandType, ConfigurePacket, Header, Opcode};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::device::{BoHandle, Device, PacketMemory};
use crate::error::{panic_message, ExecError, ExecResult};
use crate::memory::{ExecBuffer, ExecBufferPool};
use crate::scheduler::SchedulerBackend;

/// Completion callback, invoked with the terminal state.
pub type Callback = Arc<dyn Fn(CommandState) + Send + Sync>;

/// One-shot completion hook used by the event graph.
pub type EventHook = Box<dyn FnOnce(CommandState) + Send>;

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

struct CommandInner {
    done: bool,
    managed: bool,
    callbacks: Vec<Callback>,
    event: Option<EventHook>,
}

/// A hardware dispatchable command backed by one exec buffer.
pub struct Command {
    uid: u64,
    opcode: Opcode,
    device: Arc<dyn Device>,
    pool: Arc<ExecBufferPool>,
    scheduler: Arc<dyn SchedulerBackend>,
    buffer: Option<ExecBuffer>,
    memory: Arc<PacketMemory>,
    handle: BoHandle,
    inner: Mutex<CommandInner>,
    exec_done: Condvar,
}

impl Command {
    /// Create a command for `opcode` on `device`.
    ///
    /// The exec buffer comes from `pool`; its memory is cleared and the
    /// header initialized with state NEW.
    pub fn new(
        device: &Arc<dyn Device>,
        opcode: Opcode,
        pool: &Arc<ExecBufferPool>,
        scheduler: &Arc<dyn SchedulerBackend>,
    ) -> ExecResult<Arc<Self>> {
        let buffer = pool.acquire(device)?;
        let memory = Arc::clone(buffer.memory());
        let handle = buffer.handle();

        memory.clear();
        let mut header = Header::new(opcode, opcode.command_type());
        if opcode.has_cu_mask() {
            header.set_count(1);
        }
        memory.store(0, header.0);

        Ok(Arc::new(Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            opcode,
            device: Arc::clone(device),
            pool: Arc::clone(pool),
            scheduler: Arc::clone(scheduler),
            buffer: Some(buffer),
            memory,
            handle,
            inner: Mutex::new(CommandInner {
                done: true,
                managed: false,
                callbacks: Vec::new(),
                event: None,
            }),
            exec_done: Condvar::new(),
        }))
    }

    /// Unique command id.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Opcode the command was created with.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Device the command runs on.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Exec buffer handle.
    pub fn handle(&self) -> BoHandle {
        self.handle
    }

    /// Raw packet memory.
    pub fn packet(&self) -> &PacketMemory {
        &self.memory
    }

    /// Current header word.
    pub fn header(&self) -> Header {
        Header(self.memory.load(0))
    }

    fn store_header(&self, header: Header) {
        self.memory.store(0, header.0);
    }

    /// Current packet state.
    pub fn state(&self) -> CommandState {
        self.header().state()
    }

    /// Write the packet state.
    pub fn set_state(&self, state: CommandState) {
        let mut header = self.header();
        header.set_state(state);
        self.store_header(header);
    }

    /// Number of CU mask words.
    pub fn num_cu_masks(&self) -> usize {
        if self.opcode.has_cu_mask() {
            1 + self.header().extra_cu_masks() as usize
        } else {
            0
        }
    }

    /// CU mask words.
    pub fn cu_mask_words(&self) -> Vec<u32> {
        self.memory.snapshot(1, self.num_cu_masks())
    }

    /// CU indices the command may run on, lowest first.
    pub fn cu_indices(&self) -> Vec<u32> {
        packet::decode_cu_mask(&self.cu_mask_words())
    }

    /// Word offset of the payload within the packet.
    pub fn payload_offset(&self) -> usize {
        1 + self.num_cu_masks()
    }

    /// Number of payload words covered by the header count.
    pub fn payload_len(&self) -> usize {
        (self.header().count() as usize).saturating_sub(self.num_cu_masks())
    }

    /// Maximum number of payload words the exec buffer can hold.
    pub fn payload_capacity(&self) -> usize {
        let words = self.memory.len_words().min(1 + Header::MAX_COUNT as usize);
        words.saturating_sub(self.payload_offset())
    }

    /// Set the CU mask. Payload words already written are preserved.
    pub fn set_cu_mask(&self, cus: &[u32]) -> ExecResult<()> {
        if !self.opcode.has_cu_mask() {
            return Err(ExecError::InvalidArgument(format!(
                "{:?} packets carry no CU mask",
                self.opcode
            )));
        }
        let masks = packet::encode_cu_mask(cus)?;
        let payload = self.payload_words();
        if 1 + masks.len() + payload.len() > self.memory.len_words() {
            return Err(ExecError::InvalidArgument("packet exceeds exec buffer".into()));
        }

        for (i, &w) in masks.iter().enumerate() {
            self.memory.store(1 + i, w);
        }
        for (i, &w) in payload.iter().enumerate() {
            self.memory.store(1 + masks.len() + i, w);
        }

        let mut header = self.header();
        header.set_extra_cu_masks(masks.len() as u32 - 1);
        header.set_count((masks.len() + payload.len()) as u32);
        self.store_header(header);
        Ok(())
    }

    /// Set the number of payload words.
    pub fn set_payload_len(&self, words: usize) -> ExecResult<()> {
        if words > self.payload_capacity() {
            return Err(ExecError::InvalidArgument(format!(
                "payload of {} words exceeds capacity {}",
                words,
                self.payload_capacity()
            )));
        }
        let mut header = self.header();
        header.set_count((self.num_cu_masks() + words) as u32);
        self.store_header(header);
        Ok(())
    }

    /// Read one payload word.
    pub fn payload(&self, idx: usize) -> ExecResult<u32> {
        if idx >= self.payload_capacity() {
            return Err(ExecError::InvalidArgument(format!("payload index {} out of range", idx)));
        }
        Ok(self.memory.load(self.payload_offset() + idx))
    }

    /// Write one payload word, extending the payload if needed.
    pub fn set_payload(&self, idx: usize, value: u32) -> ExecResult<()> {
        self.write_payload(idx, &[value])
    }

    /// Write consecutive payload words starting at `idx`.
    pub fn write_payload(&self, idx: usize, words: &[u32]) -> ExecResult<()> {
        let end = idx + words.len();
        if end > self.payload_capacity() {
            return Err(ExecError::InvalidArgument(format!(
                "payload write [{}, {}) exceeds capacity {}",
                idx,
                end,
                self.payload_capacity()
            )));
        }
        let offset = self.payload_offset();
        for (i, &w) in words.iter().enumerate() {
            self.memory.store(offset + idx + i, w);
        }
        if end > self.payload_len() {
            self.set_payload_len(end)?;
        }
        Ok(())
    }

    /// Copy of the payload words covered by the header count.
    pub fn payload_words(&self) -> Vec<u32> {
        self.memory.snapshot(self.payload_offset(), self.payload_len())
    }

    /// Whether the last execution has completed.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// Whether the current execution is callback managed.
    pub fn is_managed(&self) -> bool {
        self.inner.lock().managed
    }

    /// Start an execution.
    ///
    /// Fails if the previous execution has not completed. The command is
    /// managed for this run iff callbacks are registered at this instant.
    pub fn run(self: &Arc<Self>) -> ExecResult<()> {
        self.start(None)
    }

    /// Start an execution that fires `hook` on completion.
    ///
    /// The hook forces the managed path so completion is always delivered
    /// through [`Command::notify`].
    pub fn run_with_event(self: &Arc<Self>, hook: EventHook) -> ExecResult<()> {
        self.start(Some(hook))
    }

    fn start(self: &Arc<Self>, hook: Option<EventHook>) -> ExecResult<()> {
        let managed = {
            let mut inner = self.inner.lock();
            if !inner.done {
                return Err(ExecError::CommandBusy(self.uid));
            }
            inner.managed = !inner.callbacks.is_empty() || hook.is_some();
            inner.event = hook;
            inner.done = false;
            inner.managed
        };

        self.set_state(CommandState::New);
        debug!("Launching command {} (managed={})", self.uid, managed);

        if let Err(e) = self.scheduler.submit(Arc::clone(self), managed) {
            let mut inner = self.inner.lock();
            inner.done = true;
            inner.event = None;
            drop(inner);
            self.exec_done.notify_all();
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the current execution and return the packet state.
    ///
    /// With a timeout the call returns the current, possibly non-terminal,
    /// state on expiry; the command stays in flight. Without a timeout a
    /// command that never completes blocks forever.
    pub fn wait(&self, timeout: Option<Duration>) -> ExecResult<CommandState> {
        let managed = self.inner.lock().managed;
        if managed {
            Ok(self.wait_notified(timeout))
        } else {
            self.scheduler.wait(self, timeout)
        }
    }

    /// Block on the completion condition variable.
    pub fn wait_notified(&self, timeout: Option<Duration>) -> CommandState {
        let mut inner = self.inner.lock();
        match timeout {
            None => {
                while !inner.done {
                    self.exec_done.wait(&mut inner);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !inner.done {
                    if self.exec_done.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        drop(inner);
        self.state()
    }

    /// Register a completion callback.
    ///
    /// If the command already reports a terminal state the callback is
    /// invoked immediately, outside the command lock.
    pub fn add_callback<F>(&self, callback: F) -> ExecResult<()>
    where
        F: Fn(CommandState) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let complete = {
            let mut inner = self.inner.lock();
            if !inner.done && !inner.managed {
                return Err(ExecError::CallbackOnUnmanaged(self.uid));
            }
            inner.callbacks.push(Arc::clone(&callback));
            inner.done
        };

        if complete {
            let state = self.state();
            if state.is_terminal() {
                self.invoke(&callback, state);
            }
        }
        Ok(())
    }

    /// Attach a completion hook to the current execution.
    ///
    /// If the command has already completed the hook fires immediately.
    pub fn set_event(&self, hook: EventHook) {
        let mut inner = self.inner.lock();
        if inner.done {
            drop(inner);
            hook(self.state());
            return;
        }
        inner.event = Some(hook);
    }

    /// Mark the current execution complete.
    ///
    /// Called by the scheduler backend once hardware reports `state`.
    /// Waiters are woken under the lock, callbacks run in registration
    /// order after it is released, and the event hook is released last.
    pub fn notify(&self, state: CommandState) {
        let (callbacks, hook) = {
            let mut inner = self.inner.lock();
            inner.done = true;
            self.exec_done.notify_all();
            (inner.callbacks.clone(), inner.event.take())
        };

        debug!("Command {} complete: {}", self.uid, state);
        for callback in &callbacks {
            self.invoke(callback, state);
        }
        if let Some(hook) = hook {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(state))) {
                error!(
                    "Event hook of command {} panicked: {}",
                    self.uid,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn invoke(&self, callback: &Callback, state: CommandState) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(state))) {
            error!(
                "Callback of command {} panicked: {}",
                self.uid,
                panic_message(payload.as_ref())
            );
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("uid", &self.uid)
            .field("opcode", &self.opcode)
            .field("device", &self.device.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CompletionMode, SimDevice};
    use crate::scheduler::{BackendKind, SchedulerBackend};
    use std::sync::atomic::AtomicUsize;

    /// Backend that accepts submissions and leaves completion to the test.
    #[derive(Default)]
    struct HoldingBackend {
        submitted: Mutex<Vec<Arc<Command>>>,
    }

    impl SchedulerBackend for HoldingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Sws
        }

        fn init(&self, _device: &Arc<dyn Device>) -> ExecResult<()> {
            Ok(())
        }

        fn submit(&self, cmd: Arc<Command>, _managed: bool) -> ExecResult<()> {
            cmd.set_state(CommandState::Running);
            self.submitted.lock().push(cmd);
            Ok(())
        }

        fn shutdown(&self) -> ExecResult<()> {
            Ok(())
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    impl HoldingBackend {
        fn complete_all(&self, state: CommandState) {
            let cmds: Vec<_> = self.submitted.lock().drain(..).collect();
            for cmd in cmds {
                cmd.set_state(state);
                cmd.notify(state);
            }
        }
    }

    fn setup() -> (Arc<dyn Device>, Arc<ExecBufferPool>, Arc<HoldingBackend>) {
        let sim = SimDevice::new(0, 2).with_completion_mode(CompletionMode::Manual);
        let device: Arc<dyn Device> = Arc::new(sim);
        (device, Arc::new(ExecBufferPool::new(4096)), Arc::new(HoldingBackend::default()))
    }

    fn command(
        device: &Arc<dyn Device>,
        pool: &Arc<ExecBufferPool>,
        backend: &Arc<HoldingBackend>,
    ) -> Arc<Command> {
        let backend: Arc<dyn SchedulerBackend> = backend.clone();
        Command::new(device, Opcode::StartCu, pool, &backend).unwrap()
    }

    #[test]
    fn test_new_command_header() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        let header = cmd.header();
        assert_eq!(header.state(), CommandState::New);
        assert_eq!(header.opcode(), Opcode::StartCu as u32);
        assert_eq!(header.command_type(), CommandType::Cu as u32);
        assert_eq!(cmd.num_cu_masks(), 1);
        assert_eq!(cmd.payload_offset(), 2);
        assert!(cmd.is_done());
    }

    #[test]
    fn test_cu_mask_preserves_payload() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        cmd.set_cu_mask(&[2, 5]).unwrap();
        cmd.set_payload(3, 0xDEADBEEF).unwrap();
        assert_eq!(cmd.cu_mask_words(), vec![0b100100]);
        assert_eq!(cmd.payload_len(), 4);

        cmd.set_cu_mask(&[0, 40]).unwrap();
        assert_eq!(cmd.cu_mask_words(), vec![1, 1 << 8]);
        assert_eq!(cmd.header().extra_cu_masks(), 1);
        assert_eq!(cmd.payload_offset(), 3);
        assert_eq!(cmd.payload(3).unwrap(), 0xDEADBEEF);
        assert_eq!(cmd.header().count(), 6);
    }

    #[test]
    fn test_run_twice_fails() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        cmd.run().unwrap();
        assert!(matches!(cmd.run(), Err(ExecError::CommandBusy(_))));

        backend.complete_all(CommandState::Completed);
        assert_eq!(cmd.wait(None).unwrap(), CommandState::Completed);
        cmd.run().unwrap();
    }

    #[test]
    fn test_managed_decided_at_run() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        cmd.run().unwrap();
        assert!(!cmd.is_managed());
        assert!(matches!(
            cmd.add_callback(|_| {}),
            Err(ExecError::CallbackOnUnmanaged(_))
        ));
        backend.complete_all(CommandState::Completed);

        cmd.add_callback(|_| {}).unwrap();
        cmd.run().unwrap();
        assert!(cmd.is_managed());
        backend.complete_all(CommandState::Completed);
    }

    #[test]
    fn test_callbacks_in_order_then_hook() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            cmd.add_callback(move |_| order.lock().push(i)).unwrap();
        }
        let hook_order = order.clone();
        cmd.run_with_event(Box::new(move |_| hook_order.lock().push(99)))
            .unwrap();
        backend.complete_all(CommandState::Completed);

        assert_eq!(*order.lock(), vec![0, 1, 2, 99]);
    }

    #[test]
    fn test_callback_after_completion_runs_immediately() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        cmd.add_callback(|_| {}).unwrap();
        cmd.run().unwrap();
        backend.complete_all(CommandState::Completed);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let weak = Arc::downgrade(&cmd);
        cmd.add_callback(move |state| {
            assert_eq!(state, CommandState::Completed);
            // Lock must be free: query the command from inside the callback.
            if let Some(cmd) = weak.upgrade() {
                assert!(cmd.is_done());
            }
            seen2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_can_rerun_command() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let weak = Arc::downgrade(&cmd);
        cmd.add_callback(move |_| {
            if runs2.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(cmd) = weak.upgrade() {
                    cmd.run().unwrap();
                }
            }
        })
        .unwrap();

        cmd.run().unwrap();
        backend.complete_all(CommandState::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!cmd.is_done());
        backend.complete_all(CommandState::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        let seen = Arc::new(AtomicUsize::new(0));
        cmd.add_callback(|_| panic!("callback failure")).unwrap();
        let seen2 = seen.clone();
        cmd.add_callback(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        cmd.run().unwrap();
        backend.complete_all(CommandState::Completed);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(cmd.is_done());
    }

    #[test]
    fn test_wait_timeout_returns_current_state() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        cmd.add_callback(|_| {}).unwrap();
        cmd.run().unwrap();
        let state = cmd.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(state, CommandState::Running);
        assert!(!cmd.is_done());
        backend.complete_all(CommandState::Completed);
        assert_eq!(cmd.wait(None).unwrap(), CommandState::Completed);
    }

    #[test]
    fn test_set_event_on_done_fires_immediately() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        cmd.set_event(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_returns_buffer() {
        let (device, pool, backend) = setup();
        let cmd = command(&device, &pool, &backend);
        assert_eq!(pool.free_count(device.id()), 0);
        drop(cmd);
        assert_eq!(pool.free_count(device.id()), 1);
        let _again = command(&device, &pool, &backend);
        assert_eq!(pool.allocations(device.id()), 1);
    }
}
