//! Event graph.
//!
//! [`EventQueue::enqueue_with_waitlist`] turns a task into a graph node
//! that is gated by a wait count: one for the enqueuer itself plus one per
//! dependency that had not completed when the node was created. Every
//! dependency's `done` decrements the count; the call that brings it to
//! zero moves the node to the queue's ready list, where an
//! [`EventHandler`] worker picks it up.
//!
//! Asynchronous tasks (a kernel run, for instance) receive a
//! [`Completion`] and signal it when the underlying operation finishes, so
//! dependents wait for the real completion rather than for the start call.
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = EventQueue::new();
//! let _handler = EventHandler::new(&queue)?;
//!
//! let r = queue.enqueue(|| Ok(1));
//! let s = queue.enqueue_with_waitlist(&[r.handle()], || Ok(2));
//! assert_eq!(s.get()?, 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{panic_message, ExecError, ExecResult};
use crate::scheduler::{join_worker, spawn_guarded, ErrorSlot};

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

type Task = Box<dyn FnOnce(&Arc<EventCore>) + Send>;

struct EventState {
    done: bool,
    chain: Vec<Arc<EventCore>>,
}

/// Graph node shared between the queue, its dependents and the caller.
struct EventCore {
    id: u64,
    queue: Weak<QueueShared>,
    wait_count: AtomicUsize,
    state: Mutex<EventState>,
    done_cv: Condvar,
    task: Mutex<Option<Task>>,
}

impl EventCore {
    fn new(queue: &Arc<QueueShared>, task: Task) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_EVENT.fetch_add(1, Ordering::Relaxed),
            queue: Arc::downgrade(queue),
            wait_count: AtomicUsize::new(1),
            state: Mutex::new(EventState {
                done: false,
                chain: Vec::new(),
            }),
            done_cv: Condvar::new(),
            task: Mutex::new(Some(task)),
        })
    }

    /// Make `dependent` wait for this event. No-op once this event is done.
    fn chain(&self, dependent: &Arc<EventCore>) -> bool {
        let mut state = self.state.lock();
        if state.done {
            return false;
        }
        dependent.wait_count.fetch_add(1, Ordering::AcqRel);
        state.chain.push(Arc::clone(dependent));
        true
    }

    /// Drop one wait. Returns true if this call made the event ready.
    fn submit(self: &Arc<Self>) -> bool {
        if self.wait_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        match self.queue.upgrade() {
            Some(queue) => queue.push_ready(Arc::clone(self)),
            None => warn!("Event {} is ready but its queue is gone", self.id),
        }
        true
    }

    /// Mark done, release dependents and leave the queue's retained set.
    fn done(&self) {
        let chain = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            self.done_cv.notify_all();
            std::mem::take(&mut state.chain)
        };
        debug!("Event {} done, releasing {} dependents", self.id, chain.len());
        for dependent in chain {
            dependent.submit();
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.retained.lock().remove(&self.id);
        }
    }

    fn execute(self: &Arc<Self>) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task(self);
        }
    }

    fn is_done(&self) -> bool {
        self.state.lock().done
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !state.done {
            self.done_cv.wait(&mut state);
        }
    }
}

/// Cloneable reference to a graph event, used to express dependencies.
#[derive(Clone)]
pub struct EventHandle(Arc<EventCore>);

impl EventHandle {
    /// Event id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Block until the event is done.
    pub fn wait(&self) {
        self.0.wait();
    }

    /// Whether the event is done.
    pub fn is_done(&self) -> bool {
        self.0.is_done()
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHandle({}, done={})", self.0.id, self.is_done())
    }
}

struct Completer<T> {
    core: Arc<EventCore>,
    result: Arc<Mutex<Option<ExecResult<T>>>>,
    fired: AtomicBool,
}

impl<T> Completer<T> {
    fn fire(&self, result: ExecResult<T>) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.result.lock() = Some(result);
        self.core.done();
    }
}

/// Signals the completion of an asynchronous task.
///
/// Dropping it without calling [`Completion::complete`] completes the
/// event with an error so dependents are never left waiting.
pub struct Completion<T> {
    inner: Arc<Completer<T>>,
}

impl<T> Completion<T> {
    /// Store the task result and mark the event done.
    pub fn complete(self, result: ExecResult<T>) {
        self.inner.fire(result);
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.inner
                .fire(Err(ExecError::Internal("event completion dropped".into())));
        }
    }
}

/// Result-carrying handle of an enqueued task.
pub struct Event<T> {
    core: Arc<EventCore>,
    result: Arc<Mutex<Option<ExecResult<T>>>>,
}

impl<T> Event<T> {
    /// Dependency handle for this event.
    pub fn handle(&self) -> EventHandle {
        EventHandle(Arc::clone(&self.core))
    }

    /// Block until the task completes.
    pub fn wait(&self) {
        self.core.wait();
    }

    /// Whether the task completed.
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    /// Wait for the task and take its result.
    pub fn get(self) -> ExecResult<T> {
        self.core.wait();
        self.result
            .lock()
            .take()
            .unwrap_or_else(|| Err(ExecError::Internal("event finished without a result".into())))
    }
}

struct QueueState {
    ready: VecDeque<Arc<EventCore>>,
    stop: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    work: Condvar,
    retained: Mutex<HashMap<u64, Arc<EventCore>>>,
}

impl QueueShared {
    fn push_ready(&self, event: Arc<EventCore>) {
        self.state.lock().ready.push_back(event);
        self.work.notify_one();
    }

    /// Next ready event, or `None` once stopped and drained.
    fn get_work(&self, handler_stop: &AtomicBool) -> Option<Arc<EventCore>> {
        let mut state = self.state.lock();
        loop {
            if handler_stop.load(Ordering::Acquire) {
                return None;
            }
            if let Some(event) = state.ready.pop_front() {
                return Some(event);
            }
            if state.stop {
                return None;
            }
            self.work.wait(&mut state);
        }
    }
}

/// Queue of graph events. Clones share the same queue.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<QueueShared>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Create an empty queue. Nothing runs until an [`EventHandler`] is attached.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    ready: VecDeque::new(),
                    stop: false,
                }),
                work: Condvar::new(),
                retained: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueue a task with no dependencies.
    pub fn enqueue<T, F>(&self, task: F) -> Event<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ExecResult<T> + Send + 'static,
    {
        self.enqueue_with_waitlist(&[], task)
    }

    /// Enqueue a task that runs after every event in `deps` is done.
    pub fn enqueue_with_waitlist<T, F>(&self, deps: &[EventHandle], task: F) -> Event<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ExecResult<T> + Send + 'static,
    {
        self.enqueue_async(deps, move |completion| {
            completion.complete(task());
            Ok(())
        })
    }

    /// Enqueue an asynchronous task.
    ///
    /// The task starts the operation and hands `completion` to whatever
    /// observes its end. If the task returns an error (or panics) the event
    /// completes with that error.
    pub fn enqueue_async<T, F>(&self, deps: &[EventHandle], task: F) -> Event<T>
    where
        T: Send + 'static,
        F: FnOnce(Completion<T>) -> ExecResult<()> + Send + 'static,
    {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);

        let wrapped: Task = Box::new(move |core: &Arc<EventCore>| {
            let completer = Arc::new(Completer {
                core: Arc::clone(core),
                result: slot,
                fired: AtomicBool::new(false),
            });
            let completion = Completion {
                inner: Arc::clone(&completer),
            };
            match catch_unwind(AssertUnwindSafe(|| task(completion))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => completer.fire(Err(e)),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Event {} task panicked: {}", core.id, message);
                    completer.fire(Err(ExecError::TaskPanicked(message)));
                }
            }
        });

        let core = EventCore::new(&self.shared, wrapped);
        self.shared.retained.lock().insert(core.id, Arc::clone(&core));
        for dep in deps {
            dep.0.chain(&core);
        }
        core.submit();

        Event { core, result }
    }

    /// Events ready to run and not yet picked up.
    pub fn ready(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    /// Events enqueued and not yet done.
    pub fn retained(&self) -> usize {
        self.shared.retained.lock().len()
    }

    /// Stop all handlers once the ready list is drained.
    pub fn stop(&self) {
        self.shared.state.lock().stop = true;
        self.shared.work.notify_all();
    }
}

/// Worker thread executing ready events of one queue.
pub struct EventHandler {
    queue: Arc<QueueShared>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    errors: Arc<ErrorSlot>,
}

impl EventHandler {
    /// Start a worker on `queue`.
    pub fn new(queue: &EventQueue) -> ExecResult<Self> {
        let shared = Arc::clone(&queue.shared);
        let stop = Arc::new(AtomicBool::new(false));
        let errors = Arc::new(ErrorSlot::default());

        let worker_queue = Arc::clone(&shared);
        let worker_stop = Arc::clone(&stop);
        let thread = spawn_guarded("event-handler", errors.clone(), move || {
            while let Some(event) = worker_queue.get_work(&worker_stop) {
                event.execute();
            }
            Ok(())
        })?;

        Ok(Self {
            queue: shared,
            stop,
            thread: Some(thread),
            errors,
        })
    }

    /// Stop this worker. Events already running finish first.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        {
            // Take the lock so the worker cannot miss the wake-up.
            let _state = self.queue.state.lock();
            self.queue.work.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            join_worker(thread);
        }
    }

    /// First error recorded by the worker.
    pub fn last_error(&self) -> Option<String> {
        self.errors.get()
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        self.stop();
    }
}
