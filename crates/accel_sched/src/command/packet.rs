//! Command packet layout.
//!
//! Every packet starts with a header word:
//!
//! ```text
//!  31    28 27    23 22         12 11  10 9      4 3     0
//! +--------+--------+-------------+------+--------+-------+
//! |  type  | opcode |    count    | xcu  | custom | state |
//! +--------+--------+-------------+------+--------+-------+
//! ```
//!
//! `count` is the number of payload words following the header. Start
//! packets carry `1 + extra_cu_masks` CU mask words, then the CU register
//! map. Configure packets carry the queue geometry followed by the CU
//! address map.

use std::fmt;

use crate::config::SchedConfig;
use crate::error::{ExecError, ExecResult};

/// Size of the embedded scheduler command queue in bytes.
pub const CQ_SIZE: usize = 0x10000;
/// Register offset of the command queue.
pub const CQ_BASE_ADDR: u64 = 0x190000;
/// Register offset of the scheduler CSR block (completion status).
pub const CSR_ADDR: u64 = 0x180000;
/// Host to scheduler interrupt registers, one per 32 slots.
pub const CQ_STATUS_REGISTER_ADDR: [u64; 4] = [
    CSR_ADDR + 0x58,
    CSR_ADDR + 0x5C,
    CSR_ADDR + 0x60,
    CSR_ADDR + 0x64,
];

/// Maximum number of CUs addressable by a CU mask.
pub const MAX_CUS: usize = 128;
/// Maximum number of CU mask words.
pub const MAX_CU_MASKS: usize = MAX_CUS / 32;
/// Shift converting a CU index to its register offset.
pub const CU_SHIFT: u32 = 16;
/// Size of one CU register space.
pub const CU_ADDR_RANGE: u64 = 1 << CU_SHIFT;

/// CU control register: start.
pub const AP_START: u32 = 0x1;
/// CU control register: done.
pub const AP_DONE: u32 = 0x2;
/// CU control register: idle.
pub const AP_IDLE: u32 = 0x4;
/// CU control register: ready for new input.
pub const AP_READY: u32 = 0x8;
/// CU control register: acknowledge done.
pub const AP_CONTINUE: u32 = 0x10;

/// Register map words written before AP_START for exec-write packets.
pub const EXEC_WRITE_PAIRS_OFFSET: usize = 6;

/// Command state stored in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    /// Raw state outside the known table (e.g. a cleared packet).
    Unknown,
    /// Set by the host before submission.
    New,
    /// Queued by a scheduler.
    Queued,
    /// Running on a CU.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed.
    Error,
    /// Aborted.
    Abort,
    /// Submitted to the embedded scheduler.
    Submitted,
    /// Timed out and reset.
    Timeout,
    /// Timed out without response.
    NoResponse,
    /// Soft kernel returned an error.
    SkError,
    /// Soft kernel crashed.
    SkCrashed,
}

impl CommandState {
    /// Decode a raw header state.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => CommandState::New,
            2 => CommandState::Queued,
            3 => CommandState::Running,
            4 => CommandState::Completed,
            5 => CommandState::Error,
            6 => CommandState::Abort,
            7 => CommandState::Submitted,
            8 => CommandState::Timeout,
            9 => CommandState::NoResponse,
            10 => CommandState::SkError,
            11 => CommandState::SkCrashed,
            _ => CommandState::Unknown,
        }
    }

    /// Raw header value.
    pub fn as_raw(self) -> u32 {
        match self {
            CommandState::Unknown => 0,
            CommandState::New => 1,
            CommandState::Queued => 2,
            CommandState::Running => 3,
            CommandState::Completed => 4,
            CommandState::Error => 5,
            CommandState::Abort => 6,
            CommandState::Submitted => 7,
            CommandState::Timeout => 8,
            CommandState::NoResponse => 9,
            CommandState::SkError => 10,
            CommandState::SkCrashed => 11,
        }
    }

    /// Whether the state ends an execution. `Submitted` is an in-flight
    /// state despite its raw value.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed
                | CommandState::Error
                | CommandState::Abort
                | CommandState::Timeout
                | CommandState::NoResponse
                | CommandState::SkError
                | CommandState::SkCrashed
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandState::Unknown => "unknown",
            CommandState::New => "new",
            CommandState::Queued => "queued",
            CommandState::Running => "running",
            CommandState::Completed => "completed",
            CommandState::Error => "error",
            CommandState::Abort => "abort",
            CommandState::Submitted => "submitted",
            CommandState::Timeout => "timeout",
            CommandState::NoResponse => "noresponse",
            CommandState::SkError => "skerror",
            CommandState::SkCrashed => "skcrashed",
        };
        f.write_str(name)
    }
}

/// Packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Start a CU with a register map.
    StartCu = 0,
    /// Configure the command scheduler.
    Configure = 2,
    /// Stop the embedded scheduler.
    Exit = 3,
    /// Abort a command.
    Abort = 4,
    /// Write address/value pairs, then start the CU.
    ExecWrite = 5,
    /// Read CU statistics.
    CuStat = 6,
    /// Copy between buffer objects.
    StartCopyBo = 7,
    /// Initialize CU registers.
    InitCu = 11,
    /// Start a fast-adapter CU.
    StartFa = 12,
    /// Start a CU with key/value register pairs.
    StartKeyVal = 15,
}

impl Opcode {
    /// Decode a raw header opcode.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Opcode::StartCu,
            2 => Opcode::Configure,
            3 => Opcode::Exit,
            4 => Opcode::Abort,
            5 => Opcode::ExecWrite,
            6 => Opcode::CuStat,
            7 => Opcode::StartCopyBo,
            11 => Opcode::InitCu,
            12 => Opcode::StartFa,
            15 => Opcode::StartKeyVal,
            _ => return None,
        })
    }

    /// Whether packets with this opcode carry CU masks.
    pub fn has_cu_mask(self) -> bool {
        matches!(
            self,
            Opcode::StartCu
                | Opcode::ExecWrite
                | Opcode::StartCopyBo
                | Opcode::InitCu
                | Opcode::StartFa
                | Opcode::StartKeyVal
        )
    }

    /// Packet type implied by the opcode.
    pub fn command_type(self) -> CommandType {
        match self {
            Opcode::Configure | Opcode::Exit | Opcode::Abort | Opcode::CuStat => CommandType::Ctrl,
            _ => CommandType::Cu,
        }
    }
}

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    /// Default type.
    Default = 0,
    /// Processed by the driver scheduler locally.
    KdsLocal = 1,
    /// Control command using the reserved queue slot.
    Ctrl = 2,
    /// CU command.
    Cu = 3,
    /// Soft CU command.
    Scu = 4,
}

/// Packet header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header(pub u32);

impl Header {
    const STATE: (u32, u32) = (0, 4);
    const EXTRA_CU_MASKS: (u32, u32) = (10, 2);
    const COUNT: (u32, u32) = (12, 11);
    const OPCODE: (u32, u32) = (23, 5);
    const TYPE: (u32, u32) = (28, 4);

    /// Maximum payload word count.
    pub const MAX_COUNT: u32 = (1 << 11) - 1;

    /// New header with state NEW.
    pub fn new(opcode: Opcode, ctype: CommandType) -> Self {
        let mut h = Header(0);
        h.set_opcode(opcode as u32);
        h.set_type(ctype as u32);
        h.set_state(CommandState::New);
        h
    }

    #[inline]
    fn field(&self, (shift, width): (u32, u32)) -> u32 {
        (self.0 >> shift) & ((1 << width) - 1)
    }

    #[inline]
    fn set_field(&mut self, (shift, width): (u32, u32), value: u32) {
        let mask = ((1u32 << width) - 1) << shift;
        self.0 = (self.0 & !mask) | ((value << shift) & mask);
    }

    /// Command state.
    pub fn state(&self) -> CommandState {
        CommandState::from_raw(self.field(Self::STATE))
    }

    /// Set the command state.
    pub fn set_state(&mut self, state: CommandState) {
        self.set_field(Self::STATE, state.as_raw());
    }

    /// Number of CU mask words beyond the mandatory first one.
    pub fn extra_cu_masks(&self) -> u32 {
        self.field(Self::EXTRA_CU_MASKS)
    }

    /// Set the number of extra CU mask words.
    pub fn set_extra_cu_masks(&mut self, n: u32) {
        self.set_field(Self::EXTRA_CU_MASKS, n);
    }

    /// Payload word count.
    pub fn count(&self) -> u32 {
        self.field(Self::COUNT)
    }

    /// Set the payload word count.
    pub fn set_count(&mut self, count: u32) {
        self.set_field(Self::COUNT, count);
    }

    /// Raw opcode.
    pub fn opcode(&self) -> u32 {
        self.field(Self::OPCODE)
    }

    /// Set the raw opcode.
    pub fn set_opcode(&mut self, opcode: u32) {
        self.set_field(Self::OPCODE, opcode);
    }

    /// Raw packet type.
    pub fn command_type(&self) -> u32 {
        self.field(Self::TYPE)
    }

    /// Set the raw packet type.
    pub fn set_type(&mut self, ctype: u32) {
        self.set_field(Self::TYPE, ctype);
    }
}

/// Encode a set of CU indices as CU mask words.
///
/// The word count is `highest / 32 + 1`, so `{0, 40}` yields two words.
pub fn encode_cu_mask(cus: &[u32]) -> ExecResult<Vec<u32>> {
    let highest = *cus
        .iter()
        .max()
        .ok_or_else(|| ExecError::InvalidArgument("empty CU mask".into()))?;
    if highest as usize >= MAX_CUS {
        return Err(ExecError::InvalidArgument(format!(
            "CU index {} exceeds the maximum of {}",
            highest,
            MAX_CUS - 1
        )));
    }
    let mut words = vec![0u32; highest as usize / 32 + 1];
    for &cu in cus {
        words[cu as usize / 32] |= 1 << (cu % 32);
    }
    Ok(words)
}

/// Decode CU mask words into CU indices, lowest first.
pub fn decode_cu_mask(words: &[u32]) -> Vec<u32> {
    let mut cus = Vec::new();
    for (w, &mask) in words.iter().enumerate() {
        let mut bits = mask;
        while bits != 0 {
            let bit = bits.trailing_zeros();
            cus.push(w as u32 * 32 + bit);
            bits &= bits - 1;
        }
    }
    cus
}

/// Feature bits of a configure packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigFeatures {
    /// Embedded scheduler enabled.
    pub ert: bool,
    /// Poll CUs for completion.
    pub polling: bool,
    /// CU-DMA module enabled.
    pub cu_dma: bool,
    /// CU interrupts enabled.
    pub cu_isr: bool,
    /// Command queue interrupts enabled.
    pub cq_int: bool,
}

impl ConfigFeatures {
    /// Pack into the features word.
    pub fn to_word(self) -> u32 {
        (self.ert as u32)
            | (self.polling as u32) << 1
            | (self.cu_dma as u32) << 2
            | (self.cu_isr as u32) << 3
            | (self.cq_int as u32) << 4
    }

    /// Unpack from the features word.
    pub fn from_word(word: u32) -> Self {
        Self {
            ert: word & 0x1 != 0,
            polling: word & 0x2 != 0,
            cu_dma: word & 0x4 != 0,
            cu_isr: word & 0x8 != 0,
            cq_int: word & 0x10 != 0,
        }
    }
}

/// Register maps of this size or larger disable CU-DMA.
const CU_DMA_REGMAP_LIMIT: usize = 0x210;

/// Payload of a configure packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurePacket {
    /// Command queue slot size in bytes.
    pub slot_size: u32,
    /// Shift converting CU index to address.
    pub cu_shift: u32,
    /// Base address added to CU offsets.
    pub cu_base_addr: u32,
    /// Feature flags.
    pub features: ConfigFeatures,
    /// CU base addresses in CU index order.
    pub cu_addrs: Vec<u32>,
}

impl ConfigurePacket {
    /// Number of fixed payload words before the CU address map.
    pub const FIXED_WORDS: usize = 5;

    /// Build from configuration flags and the loaded CU layout.
    pub fn from_config(
        config: &SchedConfig,
        cu_addrs: &[u64],
        max_regmap_bytes: usize,
        force_polling: bool,
    ) -> Self {
        let cu_dma = config.cudma && max_regmap_bytes < CU_DMA_REGMAP_LIMIT;
        Self {
            slot_size: config.ert_slotsize,
            cu_shift: CU_SHIFT,
            cu_base_addr: cu_addrs.iter().copied().min().unwrap_or(0) as u32,
            features: ConfigFeatures {
                ert: config.ert,
                polling: config.polling || force_polling,
                cu_dma,
                cu_isr: config.cuisr,
                cq_int: config.cqint,
            },
            cu_addrs: cu_addrs.iter().map(|&a| a as u32).collect(),
        }
    }

    /// Number of CUs.
    pub fn num_cus(&self) -> usize {
        self.cu_addrs.len()
    }

    /// Header `count` field.
    pub fn count(&self) -> u32 {
        (Self::FIXED_WORDS + self.cu_addrs.len()) as u32
    }

    /// Payload words.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(Self::FIXED_WORDS + self.cu_addrs.len());
        words.push(self.slot_size);
        words.push(self.cu_addrs.len() as u32);
        words.push(self.cu_shift);
        words.push(self.cu_base_addr);
        words.push(self.features.to_word());
        words.extend_from_slice(&self.cu_addrs);
        words
    }

    /// Decode payload words.
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() < Self::FIXED_WORDS {
            return None;
        }
        let num_cus = words[1] as usize;
        let addrs = words.get(Self::FIXED_WORDS..Self::FIXED_WORDS + num_cus)?;
        Some(Self {
            slot_size: words[0],
            cu_shift: words[2],
            cu_base_addr: words[3],
            features: ConfigFeatures::from_word(words[4]),
            cu_addrs: addrs.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let mut h = Header::new(Opcode::StartCu, CommandType::Cu);
        assert_eq!(h.state(), CommandState::New);
        assert_eq!(h.opcode(), 0);
        assert_eq!(h.command_type(), 3);

        h.set_count(17);
        h.set_extra_cu_masks(2);
        h.set_state(CommandState::Completed);
        assert_eq!(h.count(), 17);
        assert_eq!(h.extra_cu_masks(), 2);
        assert_eq!(h.state(), CommandState::Completed);
        assert_eq!(h.command_type(), 3);
        assert_eq!(h.0 & 0xF, 4);
    }

    #[test]
    fn test_count_is_masked() {
        let mut h = Header(0);
        h.set_count(Header::MAX_COUNT + 1);
        assert_eq!(h.count(), 0);
        assert_eq!(h.opcode(), 0);
    }

    #[test]
    fn test_cu_mask_two_words() {
        let words = encode_cu_mask(&[0, 40]).unwrap();
        assert_eq!(words, vec![1, 1 << 8]);
        assert_eq!(decode_cu_mask(&words), vec![0, 40]);
    }

    #[test]
    fn test_cu_mask_single_word() {
        let words = encode_cu_mask(&[5, 2]).unwrap();
        assert_eq!(words, vec![(1 << 2) | (1 << 5)]);
        assert_eq!(encode_cu_mask(&[31]).unwrap().len(), 1);
        assert_eq!(encode_cu_mask(&[32]).unwrap().len(), 2);
    }

    #[test]
    fn test_cu_mask_limits() {
        assert!(encode_cu_mask(&[]).is_err());
        assert!(encode_cu_mask(&[128]).is_err());
        assert_eq!(encode_cu_mask(&[127]).unwrap().len(), MAX_CU_MASKS);
    }

    #[test]
    fn test_terminal_states() {
        assert!(CommandState::Completed.is_terminal());
        assert!(CommandState::Abort.is_terminal());
        assert!(!CommandState::Submitted.is_terminal());
        assert!(!CommandState::New.is_terminal());
        assert_eq!(CommandState::from_raw(0), CommandState::Unknown);
    }

    #[test]
    fn test_configure_packet() {
        let config = SchedConfig::default().with_ert(true);
        let packet = ConfigurePacket::from_config(&config, &[0x1810000, 0x1800000], 0x40, true);
        assert_eq!(packet.count(), 7);
        assert_eq!(packet.cu_base_addr, 0x1800000);
        assert!(packet.features.ert && packet.features.polling && packet.features.cu_dma);

        let decoded = ConfigurePacket::from_words(&packet.to_words()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_configure_disables_cudma_for_large_regmap() {
        let config = SchedConfig::default();
        let packet = ConfigurePacket::from_config(&config, &[0], 0x210, false);
        assert!(!packet.features.cu_dma);
        assert!(!packet.features.polling);
    }
}
