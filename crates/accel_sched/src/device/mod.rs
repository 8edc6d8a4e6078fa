//! Device abstractions consumed by the scheduling core.
//!
//! The driver shim (ioctl/mmap plumbing, device enumeration) lives outside
//! this crate. The core talks to it through the narrow [`Device`] trait:
//! hardware context open/close, register access, exec buffer allocation
//! and mapping, exec buffer submission and a blocking completion wait.

pub mod sim;
pub mod xclbin;

pub use sim::{CompletionMode, SimDevice};
pub use xclbin::{
    AddressQualifier, Connection, IpKind, IpLayoutEntry, KernelArgMeta, KernelMeta,
    XclbinMetadata,
};

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecError, ExecResult};

/// Unique device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Create a device ID from a device index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Device index.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Access mode requested when locking a compute unit.
///
/// The numeric value is what the driver receives on context open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AccessMode {
    /// No other context may use the CU.
    Exclusive = 0,
    /// The CU may be shared with other shared-mode contexts.
    Shared = 1,
    /// No access requested.
    None = 2,
}

impl AccessMode {
    /// Numeric value passed to the driver.
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Exclusive => write!(f, "exclusive"),
            AccessMode::Shared => write!(f, "shared"),
            AccessMode::None => write!(f, "none"),
        }
    }
}

/// Driver handle of an exec buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(pub u32);

/// Host mapping of an exec buffer, viewed as 32-bit words.
///
/// The memory is shared between the host and whichever agent executes the
/// packet (embedded scheduler, driver or software scheduler), so every word
/// is accessed atomically.
pub struct PacketMemory {
    words: Box<[AtomicU32]>,
}

impl PacketMemory {
    /// Allocate zeroed packet memory of at least `bytes` bytes.
    pub fn new(bytes: usize) -> Self {
        let len = bytes.div_ceil(4);
        Self {
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Size in 32-bit words.
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.words.len() * 4
    }

    /// Read one word. Panics if `idx` is out of range.
    #[inline]
    pub fn load(&self, idx: usize) -> u32 {
        self.words[idx].load(Ordering::Acquire)
    }

    /// Write one word. Panics if `idx` is out of range.
    #[inline]
    pub fn store(&self, idx: usize, value: u32) {
        self.words[idx].store(value, Ordering::Release);
    }

    /// Read one word, or `None` when out of range.
    pub fn get(&self, idx: usize) -> Option<u32> {
        self.words.get(idx).map(|w| w.load(Ordering::Acquire))
    }

    /// Copy `len` words starting at `start`.
    pub fn snapshot(&self, start: usize, len: usize) -> Vec<u32> {
        (start..start + len).map(|i| self.load(i)).collect()
    }

    /// Zero the whole buffer.
    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
    }
}

impl fmt::Debug for PacketMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketMemory")
            .field("words", &self.words.len())
            .finish()
    }
}

/// Device interface required by the scheduling core.
///
/// Every call either succeeds or returns an error; the core never retries.
pub trait Device: Send + Sync + 'static {
    /// Get the unique device identifier.
    fn id(&self) -> DeviceId;

    /// Get the human-readable device name.
    fn name(&self) -> &str;

    /// Lock a CU (or the virtual CU) of an xclbin.
    fn open_context(&self, xclbin: &Uuid, index: u32, mode: AccessMode) -> ExecResult<()>;

    /// Release a context opened with [`Device::open_context`].
    fn close_context(&self, xclbin: &Uuid, index: u32) -> ExecResult<()>;

    /// Read `buf.len()` bytes of register space at `offset`.
    fn read_register(&self, offset: u64, buf: &mut [u8]) -> ExecResult<()>;

    /// Write `buf` to register space at `offset`.
    fn write_register(&self, offset: u64, buf: &[u8]) -> ExecResult<()>;

    /// Allocate an exec buffer of `size` bytes.
    fn alloc_exec_buffer(&self, size: usize) -> ExecResult<BoHandle>;

    /// Map an exec buffer into host memory.
    fn map_exec_buffer(&self, handle: BoHandle) -> ExecResult<Arc<PacketMemory>>;

    /// Unmap an exec buffer.
    fn unmap_exec_buffer(&self, handle: BoHandle) -> ExecResult<()>;

    /// Free an exec buffer.
    fn free_exec_buffer(&self, handle: BoHandle) -> ExecResult<()>;

    /// Submit an exec buffer to the driver / embedded scheduler.
    fn exec_buf(&self, handle: BoHandle) -> ExecResult<()>;

    /// Block until any submitted exec buffer completes or the timeout
    /// expires. Returns a positive count on progress and 0 on timeout.
    fn exec_wait(&self, timeout_ms: u32) -> ExecResult<u32>;

    /// UUID of the xclbin currently loaded, if any.
    fn loaded_xclbin(&self) -> Option<Uuid>;

    /// Metadata of a loaded xclbin.
    fn xclbin_metadata(&self, xclbin: &Uuid) -> ExecResult<Arc<XclbinMetadata>>;

    /// Read a single 32-bit register.
    fn read_register_u32(&self, offset: u64) -> ExecResult<u32> {
        let mut buf = [0u8; 4];
        self.read_register(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a single 32-bit register.
    fn write_register_u32(&self, offset: u64, value: u32) -> ExecResult<()> {
        self.write_register(offset, &value.to_le_bytes())
    }

    /// Write consecutive 32-bit registers starting at `offset`.
    fn write_register_words(&self, offset: u64, words: &[u32]) -> ExecResult<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write_register(offset, &bytes)
    }
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}, {})", self.id(), self.name())
    }
}

/// Look up metadata of the loaded xclbin.
pub(crate) fn loaded_metadata(device: &dyn Device) -> ExecResult<Arc<XclbinMetadata>> {
    let uuid = device
        .loaded_xclbin()
        .ok_or_else(|| ExecError::Device(format!("no xclbin loaded on {}", device.id())))?;
    device.xclbin_metadata(&uuid)
}
