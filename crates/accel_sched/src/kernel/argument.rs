//! Kernel arguments.
//!
//! Each argument is classified once from its xclbin metadata and converted
//! to register map words by a single dispatch over [`ArgKind`] and
//! [`ArgValue`].

use crate::device::xclbin::{AddressQualifier, KernelArgMeta};
use crate::error::{ExecError, ExecResult};

/// How an argument is passed in the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Value copied into the register map.
    Scalar,
    /// Host pointer whose pointee bytes are copied into the register map.
    ScalarPointer,
    /// Device buffer address.
    Global,
    /// Not settable from the host (streams, local memory).
    Ignored,
}

impl ArgKind {
    /// Classify an argument from its metadata.
    pub fn from_meta(meta: &KernelArgMeta) -> Self {
        match meta.address_qualifier {
            AddressQualifier::Scalar if meta.host_type.trim_end().ends_with('*') => {
                ArgKind::ScalarPointer
            }
            AddressQualifier::Scalar => ArgKind::Scalar,
            AddressQualifier::Global | AddressQualifier::Constant => ArgKind::Global,
            AddressQualifier::Local | AddressQualifier::Stream => ArgKind::Ignored,
        }
    }
}

/// Value supplied for an argument.
#[derive(Debug, Clone, Copy)]
pub enum ArgValue<'a> {
    /// Raw little-endian bytes of a scalar, or of the pointee of a scalar pointer.
    Scalar(&'a [u8]),
    /// Device address of a buffer object.
    Buffer(u64),
    /// Placeholder for ignored arguments.
    Null,
}

/// One kernel argument.
#[derive(Debug, Clone)]
pub struct Argument {
    meta: KernelArgMeta,
    kind: ArgKind,
    group_id: Option<i32>,
}

impl Argument {
    /// Create from metadata and the memory bank of the argument's buffer.
    pub fn new(meta: KernelArgMeta, group_id: Option<i32>) -> Self {
        Self {
            kind: ArgKind::from_meta(&meta),
            meta,
            group_id,
        }
    }

    /// Argument index.
    pub fn index(&self) -> u32 {
        self.meta.index
    }

    /// Argument name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Byte offset in the register map.
    pub fn offset(&self) -> u32 {
        self.meta.offset
    }

    /// Size in bytes.
    pub fn size(&self) -> u32 {
        self.meta.size
    }

    /// Argument kind.
    pub fn kind(&self) -> ArgKind {
        self.kind
    }

    /// Default memory bank for buffers bound to this argument.
    pub fn group_id(&self) -> Option<i32> {
        self.group_id
    }

    /// Metadata the argument was built from.
    pub fn meta(&self) -> &KernelArgMeta {
        &self.meta
    }

    /// Register map words for `value`. Ignored arguments produce no words.
    pub fn value_words(&self, value: ArgValue<'_>) -> ExecResult<Vec<u32>> {
        match (self.kind, value) {
            (ArgKind::Ignored, _) => Ok(Vec::new()),
            (ArgKind::Scalar | ArgKind::ScalarPointer | ArgKind::Global, ArgValue::Scalar(bytes)) => {
                self.check_size(bytes.len())?;
                Ok(bytes_to_words(bytes))
            }
            (ArgKind::Global, ArgValue::Buffer(addr)) => Ok(vec![addr as u32, (addr >> 32) as u32]),
            (kind, value) => Err(ExecError::InvalidArgument(format!(
                "argument '{}' ({:?}) cannot take {:?}",
                self.meta.name, kind, value
            ))),
        }
    }

    fn check_size(&self, bytes: usize) -> ExecResult<()> {
        if bytes != self.meta.size as usize {
            return Err(ExecError::InvalidArgument(format!(
                "bad size {} for argument '{}', expected {}",
                bytes, self.meta.name, self.meta.size
            )));
        }
        Ok(())
    }
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}
