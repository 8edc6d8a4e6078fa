//! Compute unit contexts.
//!
//! A [`CuContext`] is the host's claim on one CU (or, for the virtual CU,
//! on the whole xclbin). Contexts are shared: the [`ContextRegistry`] hands
//! out the live context for a `(device, cu)` pair while any holder keeps it
//! alive, and the hardware context is closed when the last holder drops.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use fixedbitset::FixedBitSet;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::packet::{CU_ADDR_RANGE, MAX_CUS};
use crate::device::xclbin::XclbinMetadata;
use crate::device::{AccessMode, Device, DeviceId};
use crate::error::{ExecError, ExecResult};

/// Offset added to a CU index to form its hardware context index.
pub const CONTEXT_INDEX_OFFSET: u32 = MAX_CUS as u32;

/// Hardware context index of the virtual CU.
pub const VIRTUAL_CU_INDEX: u32 = u32::MAX;

/// Argument to memory bank connectivity of one CU.
///
/// Memory topology indices can be large while a CU only touches a few
/// banks, so bank indices are compressed to positions in a sorted table
/// and each argument keeps a bitset over those positions.
#[derive(Debug, Clone, Default)]
pub struct Connectivity {
    banks: Vec<i32>,
    args: Vec<FixedBitSet>,
}

impl Connectivity {
    /// Collect the connections of IP `ip_index`.
    pub fn from_metadata(metadata: &XclbinMetadata, ip_index: u32) -> Self {
        let entries: Vec<_> = metadata
            .connectivity
            .iter()
            .filter(|c| c.ip_layout_index == ip_index && c.mem_data_index >= 0)
            .collect();

        let mut banks: Vec<i32> = entries.iter().map(|c| c.mem_data_index).collect();
        banks.sort_unstable();
        banks.dedup();

        let num_args = entries.iter().map(|c| c.arg_index as usize + 1).max().unwrap_or(0);
        let mut args = vec![FixedBitSet::with_capacity(banks.len()); num_args];
        for c in entries {
            if let Ok(pos) = banks.binary_search(&c.mem_data_index) {
                args[c.arg_index as usize].insert(pos);
            }
        }

        Self { banks, args }
    }

    /// Default memory bank of an argument: the highest connected bank.
    pub fn arg_memidx(&self, arg: u32) -> Option<i32> {
        let set = self.args.get(arg as usize)?;
        set.ones().last().map(|pos| self.banks[pos])
    }

    /// Whether `arg` is connected to bank `memidx`.
    pub fn valid_connection(&self, arg: u32, memidx: i32) -> bool {
        match (self.args.get(arg as usize), self.banks.binary_search(&memidx)) {
            (Some(set), Ok(pos)) => set.contains(pos),
            _ => false,
        }
    }

    /// Distinct banks used by the CU.
    pub fn banks(&self) -> &[i32] {
        &self.banks
    }
}

/// An open hardware context on one CU or on the virtual CU.
pub struct CuContext {
    device: Arc<dyn Device>,
    xclbin: Uuid,
    cu_index: Option<u32>,
    address: u64,
    access: AccessMode,
    connectivity: Connectivity,
}

impl CuContext {
    /// CU index, `None` for the virtual CU.
    pub fn cu_index(&self) -> Option<u32> {
        self.cu_index
    }

    /// Whether this is the whole-xclbin context.
    pub fn is_virtual(&self) -> bool {
        self.cu_index.is_none()
    }

    /// Index passed to the device's context calls.
    pub fn hw_index(&self) -> u32 {
        match self.cu_index {
            Some(cu) => cu + CONTEXT_INDEX_OFFSET,
            None => VIRTUAL_CU_INDEX,
        }
    }

    /// CU register base address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Size of the CU register space.
    pub fn size(&self) -> u64 {
        CU_ADDR_RANGE
    }

    /// Access mode the context was opened with.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// xclbin the context belongs to.
    pub fn xclbin(&self) -> Uuid {
        self.xclbin
    }

    /// Owning device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Argument connectivity.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }
}

impl Drop for CuContext {
    fn drop(&mut self) {
        let index = self.hw_index();
        match self.device.close_context(&self.xclbin, index) {
            Ok(()) => debug!("{}: closed context {}", self.device.id(), index),
            Err(e) => warn!("{}: failed to close context {}: {}", self.device.id(), index, e),
        }
    }
}

impl fmt::Debug for CuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuContext")
            .field("device", &self.device.id())
            .field("cu_index", &self.cu_index)
            .field("address", &format_args!("{:#x}", self.address))
            .field("access", &self.access)
            .finish()
    }
}

/// Cache of live contexts.
///
/// Entries are weak; a context closes as soon as its last holder drops and
/// the stale entry is replaced on the next open.
#[derive(Default)]
pub struct ContextRegistry {
    cus: Mutex<HashMap<(DeviceId, u32), Weak<CuContext>>>,
    virtual_cus: Mutex<HashMap<DeviceId, Weak<CuContext>>>,
}

impl ContextRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or share) the context of CU `cu_index`, IP layout entry `ip_index`.
    pub fn open(
        &self,
        device: &Arc<dyn Device>,
        xclbin: &Uuid,
        ip_index: u32,
        cu_index: u32,
        access: AccessMode,
    ) -> ExecResult<Arc<CuContext>> {
        let mut cus = self.cus.lock();
        let key = (device.id(), cu_index);
        if let Some(ctx) = cus.get(&key).and_then(Weak::upgrade) {
            if ctx.access != access {
                return Err(ExecError::conflicting_access(cu_index, ctx.access, access));
            }
            return Ok(ctx);
        }
        cus.retain(|_, weak| weak.strong_count() > 0);

        let metadata = device.xclbin_metadata(xclbin)?;
        let ip = metadata.ip_layout.get(ip_index as usize).ok_or_else(|| {
            ExecError::InvalidArgument(format!("no IP layout entry {}", ip_index))
        })?;

        device.open_context(xclbin, cu_index + CONTEXT_INDEX_OFFSET, access)?;
        debug!("{}: opened CU {} ({}) as {}", device.id(), cu_index, ip.name, access);

        let ctx = Arc::new(CuContext {
            device: Arc::clone(device),
            xclbin: *xclbin,
            cu_index: Some(cu_index),
            address: ip.base_address,
            access,
            connectivity: Connectivity::from_metadata(&metadata, ip_index),
        });
        cus.insert(key, Arc::downgrade(&ctx));
        Ok(ctx)
    }

    /// Open (or share) the virtual CU context of `device`. Always shared.
    pub fn open_virtual_cu(&self, device: &Arc<dyn Device>, xclbin: &Uuid) -> ExecResult<Arc<CuContext>> {
        let mut virtual_cus = self.virtual_cus.lock();
        if let Some(ctx) = virtual_cus.get(&device.id()).and_then(Weak::upgrade) {
            if ctx.xclbin == *xclbin {
                return Ok(ctx);
            }
        }

        device.open_context(xclbin, VIRTUAL_CU_INDEX, AccessMode::Shared)?;
        let ctx = Arc::new(CuContext {
            device: Arc::clone(device),
            xclbin: *xclbin,
            cu_index: None,
            address: 0,
            access: AccessMode::Shared,
            connectivity: Connectivity::default(),
        });
        virtual_cus.insert(device.id(), Arc::downgrade(&ctx));
        Ok(ctx)
    }

    /// Number of live CU contexts (the virtual CU excluded).
    pub fn live(&self) -> usize {
        self.cus.lock().values().filter(|w| w.strong_count() > 0).count()
    }
}
