//! xclbin metadata as seen by the scheduling core.
//!
//! Parsing the container is the driver layer's job; the core only consumes
//! the already extracted IP layout, connectivity and kernel argument tables.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecResult;

/// Kind of an IP layout entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpKind {
    /// HLS / RTL kernel compute unit.
    Kernel,
    /// Debug or other non-kernel IP.
    Other,
}

/// One entry of the IP layout section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLayoutEntry {
    /// Instance name, `kernel:instance`.
    pub name: String,
    /// Base address of the CU register space.
    pub base_address: u64,
    /// IP kind.
    pub kind: IpKind,
}

impl IpLayoutEntry {
    /// Kernel part of the instance name.
    pub fn kernel_name(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }

    /// Instance part of the instance name.
    pub fn instance_name(&self) -> &str {
        self.name.split_once(':').map(|(_, inst)| inst).unwrap_or(&self.name)
    }
}

/// One entry of the connectivity section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Index into the IP layout.
    pub ip_layout_index: u32,
    /// Kernel argument index.
    pub arg_index: u32,
    /// Memory topology index the argument is connected to.
    pub mem_data_index: i32,
}

/// Address space qualifier of a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressQualifier {
    /// Passed by value in the register map.
    Scalar,
    /// Device buffer address.
    Global,
    /// Constant buffer address.
    Constant,
    /// Local memory, not host visible.
    Local,
    /// AXI stream, not part of the register map.
    Stream,
}

/// Metadata of one kernel argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelArgMeta {
    /// Argument name.
    pub name: String,
    /// Argument index.
    pub index: u32,
    /// Byte offset into the CU register map.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
    /// Host type string, e.g. `int`, `float*`.
    pub host_type: String,
    /// Address qualifier.
    pub address_qualifier: AddressQualifier,
}

/// Metadata of one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMeta {
    /// Kernel name.
    pub name: String,
    /// Arguments in index order.
    pub args: Vec<KernelArgMeta>,
}

impl KernelMeta {
    /// Register map size in 32-bit words needed to hold every argument.
    pub fn regmap_words(&self) -> usize {
        self.args
            .iter()
            .filter(|a| a.address_qualifier != AddressQualifier::Stream)
            .map(|a| (a.offset as usize + a.size as usize).div_ceil(4))
            .max()
            .unwrap_or(0)
    }
}

/// Extracted xclbin metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XclbinMetadata {
    /// xclbin UUID.
    pub uuid: Uuid,
    /// IP layout section.
    pub ip_layout: Vec<IpLayoutEntry>,
    /// Connectivity section.
    #[serde(default)]
    pub connectivity: Vec<Connection>,
    /// Kernels.
    #[serde(default)]
    pub kernels: Vec<KernelMeta>,
}

impl XclbinMetadata {
    /// Parse metadata from JSON.
    pub fn from_json_str(json: &str) -> ExecResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// IP layout indices of all kernel CUs, sorted by base address.
    ///
    /// The position of an IP in this list is its CU index.
    pub fn cu_ip_indices(&self) -> Vec<u32> {
        let mut ips: Vec<u32> = self
            .ip_layout
            .iter()
            .enumerate()
            .filter(|(_, ip)| ip.kind == IpKind::Kernel)
            .map(|(i, _)| i as u32)
            .collect();
        ips.sort_by_key(|&i| self.ip_layout[i as usize].base_address);
        ips
    }

    /// CU base addresses in CU index order.
    pub fn cu_addresses(&self) -> Vec<u64> {
        self.cu_ip_indices()
            .into_iter()
            .map(|i| self.ip_layout[i as usize].base_address)
            .collect()
    }

    /// CU index of an IP layout entry.
    pub fn cu_index(&self, ip_index: u32) -> Option<u32> {
        self.cu_ip_indices()
            .iter()
            .position(|&i| i == ip_index)
            .map(|p| p as u32)
    }

    /// Kernel metadata by name.
    pub fn kernel(&self, name: &str) -> Option<&KernelMeta> {
        self.kernels.iter().find(|k| k.name == name)
    }

    /// Largest register map of any kernel, in bytes.
    pub fn max_regmap_bytes(&self) -> usize {
        self.kernels
            .iter()
            .map(|k| k.regmap_words() * 4)
            .max()
            .unwrap_or(0)
    }
}
