//! Handle tables for objects handed out across an opaque-handle boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ExecError, ExecResult};

/// Maps integer handles to shared objects.
///
/// Each registry is independent; the runtime owns one per object kind.
pub struct HandleRegistry<T> {
    kind: &'static str,
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<T>>>,
}

impl<T> HandleRegistry<T> {
    /// Create an empty registry. `kind` names the objects in errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store `value` and return its new handle.
    pub fn register(&self, value: Arc<T>) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(handle, value);
        handle
    }

    /// Remove and return the object behind `handle`.
    pub fn unregister(&self, handle: u64) -> ExecResult<Arc<T>> {
        self.entries
            .lock()
            .remove(&handle)
            .ok_or_else(|| self.unknown(handle))
    }

    /// Object behind `handle`.
    pub fn lookup(&self, handle: u64) -> ExecResult<Arc<T>> {
        self.entries
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| self.unknown(handle))
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        // Release outside the lock; dropping an object may re-enter a registry.
        let entries: Vec<_> = self.entries.lock().drain().collect();
        drop(entries);
    }

    fn unknown(&self, handle: u64) -> ExecError {
        ExecError::UnknownHandle(format!("{} handle {}", self.kind, handle))
    }
}
