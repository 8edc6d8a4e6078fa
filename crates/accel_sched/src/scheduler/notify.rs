//! Completion notification dispatch.
//!
//! Scheduler threads must not run user callbacks themselves: a slow or
//! re-entrant callback would stall every other command. With threaded
//! notification, completions are pushed to a [`NotifyQueue`] and delivered
//! by its worker pool instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{join_worker, spawn_guarded, ErrorSlot};
use crate::command::{Command, CommandState};
use crate::error::ExecResult;

type Task = Box<dyn FnOnce() + Send>;

struct QueueState {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    work: Condvar,
}

/// FIFO task queue drained by background worker threads.
pub struct NotifyQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    errors: Arc<ErrorSlot>,
}

impl NotifyQueue {
    /// Start a queue with `workers` threads.
    pub fn new(name: &str, workers: usize) -> ExecResult<Self> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                stop: false,
            }),
            work: Condvar::new(),
        });
        let errors = Arc::new(ErrorSlot::default());

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = spawn_guarded(&format!("{}-notify-{}", name, i), errors.clone(), move || {
                Self::worker(&shared);
                Ok(())
            })?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            errors,
        })
    }

    fn worker(shared: &QueueShared) {
        loop {
            let task = {
                let mut state = shared.state.lock();
                while state.tasks.is_empty() && !state.stop {
                    shared.work.wait(&mut state);
                }
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => return,
                }
            };
            task();
        }
    }

    /// Queue a task.
    pub fn push<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.state.lock().tasks.push_back(Box::new(task));
        self.shared.work.notify_one();
    }

    /// Number of worker threads still running.
    pub fn workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Number of tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Drain the remaining tasks and stop the workers.
    pub fn stop(&self) {
        self.shared.state.lock().stop = true;
        self.shared.work.notify_all();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            join_worker(handle);
        }
        debug!("Notify queue stopped");
    }

    /// First error recorded by a worker.
    pub fn last_error(&self) -> Option<String> {
        self.errors.get()
    }
}

impl Drop for NotifyQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Delivers command completions inline or through a [`NotifyQueue`].
pub enum Notifier {
    /// Call [`Command::notify`] on the scheduler thread.
    Inline,
    /// Defer to the queue's workers.
    Threaded(NotifyQueue),
}

impl Notifier {
    /// Build the notifier requested by configuration.
    pub fn new(name: &str, threaded: bool, workers: usize) -> ExecResult<Self> {
        if threaded {
            Ok(Notifier::Threaded(NotifyQueue::new(name, workers.max(1))?))
        } else {
            Ok(Notifier::Inline)
        }
    }

    /// Deliver a completion.
    pub fn notify(&self, cmd: Arc<Command>, state: CommandState) {
        match self {
            Notifier::Inline => cmd.notify(state),
            Notifier::Threaded(queue) => queue.push(move || cmd.notify(state)),
        }
    }

    /// Worker threads delivering completions, zero when inline.
    pub fn workers(&self) -> usize {
        match self {
            Notifier::Inline => 0,
            Notifier::Threaded(queue) => queue.workers(),
        }
    }

    /// Stop worker threads, delivering what is already queued.
    pub fn stop(&self) {
        if let Notifier::Threaded(queue) = self {
            queue.stop();
        }
    }

    /// First error recorded by a worker.
    pub fn last_error(&self) -> Option<String> {
        match self {
            Notifier::Inline => None,
            Notifier::Threaded(queue) => queue.last_error(),
        }
    }
}
