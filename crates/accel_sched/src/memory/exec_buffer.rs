//! Exec buffer arena.
//!
//! Exec buffers are fixed-size, hardware visible blocks holding one command
//! packet. Allocating one is a driver round trip, so buffers released by
//! commands are cached per device and handed to the next command instead of
//! being freed. A buffer is either owned by exactly one live command or sits
//! in exactly one device's free list.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::{BoHandle, Device, DeviceId, PacketMemory};
use crate::error::{ExecError, ExecResult};

/// One mapped exec buffer.
///
/// Dropping the buffer unmaps and frees it on the device; the arena keeps
/// released buffers alive to avoid that.
pub struct ExecBuffer {
    device: Arc<dyn Device>,
    handle: BoHandle,
    memory: Arc<PacketMemory>,
    size: usize,
}

impl ExecBuffer {
    /// Driver handle.
    pub fn handle(&self) -> BoHandle {
        self.handle
    }

    /// Mapped packet memory.
    pub fn memory(&self) -> &Arc<PacketMemory> {
        &self.memory
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Owning device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.unmap_exec_buffer(self.handle) {
            warn!("Failed to unmap exec buffer {:?}: {}", self.handle, e);
        }
        if let Err(e) = self.device.free_exec_buffer(self.handle) {
            warn!("Failed to free exec buffer {:?}: {}", self.handle, e);
        }
    }
}

impl fmt::Debug for ExecBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecBuffer")
            .field("device", &self.device.id())
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Default)]
struct DeviceArena {
    free: Vec<ExecBuffer>,
    allocated: u64,
    reused: u64,
}

/// Per-device free lists of exec buffers.
///
/// The free lists share one mutex across devices. Allocation is the rare
/// slow path and is serialized by a second mutex so that concurrent misses
/// do not hold up releases.
pub struct ExecBufferPool {
    buffer_size: usize,
    arenas: Mutex<HashMap<DeviceId, DeviceArena>>,
    alloc_lock: Mutex<()>,
}

impl ExecBufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            arenas: Mutex::new(HashMap::new()),
            alloc_lock: Mutex::new(()),
        }
    }

    /// Size of every buffer handed out.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the device's free list, or allocate a new one.
    pub fn acquire(&self, device: &Arc<dyn Device>) -> ExecResult<ExecBuffer> {
        let device_id = device.id();

        {
            let mut arenas = self.arenas.lock();
            if let Some(arena) = arenas.get_mut(&device_id) {
                if let Some(buffer) = arena.free.pop() {
                    arena.reused += 1;
                    return Ok(buffer);
                }
            }
        }

        let _guard = self.alloc_lock.lock();
        let handle = device.alloc_exec_buffer(self.buffer_size)?;
        let memory = match device.map_exec_buffer(handle) {
            Ok(memory) => memory,
            Err(e) => {
                if let Err(free_err) = device.free_exec_buffer(handle) {
                    warn!("Leaking exec buffer {:?}: {}", handle, free_err);
                }
                return Err(e);
            }
        };
        let buffer = ExecBuffer {
            device: Arc::clone(device),
            handle,
            memory,
            size: self.buffer_size,
        };
        if buffer.memory.size_bytes() < self.buffer_size {
            return Err(ExecError::allocation(
                self.buffer_size,
                format!("mapping of {:?} is only {} bytes", handle, buffer.memory.size_bytes()),
            ));
        }

        self.arenas.lock().entry(device_id).or_default().allocated += 1;
        debug!("Allocated exec buffer {:?} on {}", handle, device_id);
        Ok(buffer)
    }

    /// Return a buffer to its device's free list.
    pub fn release(&self, buffer: ExecBuffer) {
        let device_id = buffer.device.id();
        self.arenas.lock().entry(device_id).or_default().free.push(buffer);
    }

    /// Number of cached buffers for a device.
    pub fn free_count(&self, device_id: DeviceId) -> usize {
        self.arenas
            .lock()
            .get(&device_id)
            .map(|a| a.free.len())
            .unwrap_or(0)
    }

    /// Number of hardware allocations performed for a device.
    pub fn allocations(&self, device_id: DeviceId) -> u64 {
        self.arenas
            .lock()
            .get(&device_id)
            .map(|a| a.allocated)
            .unwrap_or(0)
    }

    /// Free every cached buffer of one device.
    pub fn clear_device(&self, device_id: DeviceId) {
        let freed = {
            let mut arenas = self.arenas.lock();
            arenas
                .get_mut(&device_id)
                .map(|a| std::mem::take(&mut a.free))
                .unwrap_or_default()
        };
        drop(freed);
    }

    /// Free every cached buffer.
    pub fn clear(&self) {
        let freed: Vec<ExecBuffer> = {
            let mut arenas = self.arenas.lock();
            arenas
                .values_mut()
                .flat_map(|a| std::mem::take(&mut a.free))
                .collect()
        };
        drop(freed);
    }

    /// Get statistics.
    pub fn stats(&self) -> ArenaStats {
        let arenas = self.arenas.lock();
        let mut stats = ArenaStats::default();
        for (device_id, arena) in arenas.iter() {
            stats.devices.push(DeviceArenaStats {
                device_id: *device_id,
                allocated: arena.allocated,
                reused: arena.reused,
                free: arena.free.len(),
            });
        }
        stats.devices.sort_by_key(|d| d.device_id);
        stats.total_allocated = stats.devices.iter().map(|d| d.allocated).sum();
        stats
    }
}

/// Arena statistics.
#[derive(Debug, Clone, Default)]
pub struct ArenaStats {
    /// Hardware allocations across devices.
    pub total_allocated: u64,
    /// Per-device statistics.
    pub devices: Vec<DeviceArenaStats>,
}

/// Per-device arena statistics.
#[derive(Debug, Clone)]
pub struct DeviceArenaStats {
    /// Device ID.
    pub device_id: DeviceId,
    /// Hardware allocations performed.
    pub allocated: u64,
    /// Acquisitions served from the free list.
    pub reused: u64,
    /// Buffers currently cached.
    pub free: usize,
}
