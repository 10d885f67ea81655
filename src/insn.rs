use serde_derive::{Deserialize, Serialize};

use crate::status::{PtResult, Status};

/// Longest possible x86 instruction, in bytes.
pub const MAX_INSN_LEN: usize = 15;

/// Coarse instruction class, as far as control flow is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsnClass {
    /// Anything that falls through to the next instruction.
    #[default]
    Other,
    Call,
    Return,
    Jump,
    CondJump,
    FarCall,
    FarReturn,
    FarJump,
    Ptwrite,
}

impl InsnClass {
    /// Whether an instruction of this class may leave the straight-line
    /// sequence.
    #[must_use]
    pub fn changes_flow(self) -> bool {
        !matches!(self, InsnClass::Other | InsnClass::Ptwrite)
    }
}

/// Execution mode the instruction was decoded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecMode {
    Bit16,
    Bit32,
    #[default]
    Bit64,
}

impl ExecMode {
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            ExecMode::Bit16 => 16,
            ExecMode::Bit32 => 32,
            ExecMode::Bit64 => 64,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ExecMode::Bit16 => 0,
            ExecMode::Bit32 => 1,
            ExecMode::Bit64 => 2,
        }
    }
}

impl TryFrom<u8> for ExecMode {
    type Error = Status;

    fn try_from(bits: u8) -> PtResult<Self> {
        match bits {
            16 => Ok(ExecMode::Bit16),
            32 => Ok(ExecMode::Bit32),
            64 => Ok(ExecMode::Bit64),
            _ => Err(Status::BadPacket),
        }
    }
}

flag_set! {
    /// Per-instruction decode flags.
    pub struct InsnFlags {
        /// First instruction after tracing was enabled.
        const ENABLED = 1 << 0;
        /// Last instruction before tracing was disabled.
        const DISABLED = 1 << 1;
        /// First instruction after an overflow.
        const RESYNCED = 1 << 2;
        /// The flow did not continue at the fall-through address.
        const INTERRUPTED = 1 << 3;
    }
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub ip: u64,
    /// Raw bytes; only the first `size` are meaningful.
    pub raw: [u8; MAX_INSN_LEN],
    pub size: u8,
    pub iclass: InsnClass,
    pub mode: ExecMode,
    pub flags: InsnFlags,
}

impl Insn {
    #[must_use]
    pub fn new(ip: u64, bytes: &[u8], iclass: InsnClass, mode: ExecMode) -> Self {
        let len = bytes.len().min(MAX_INSN_LEN);
        let mut raw = [0; MAX_INSN_LEN];
        raw[..len].copy_from_slice(&bytes[..len]);
        Self {
            ip,
            raw,
            size: u8::try_from(len).unwrap_or(u8::MAX),
            iclass,
            mode,
            flags: InsnFlags::empty(),
        }
    }

    /// The instruction's own bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.raw[..usize::from(self.size)]
    }

    /// All `MAX_INSN_LEN` raw bytes, zero padded past `size`.
    #[must_use]
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.raw.to_vec()
    }

    /// Address of the instruction that follows when no branch is taken.
    #[must_use]
    pub fn next_ip(&self) -> u64 {
        self.ip.wrapping_add(u64::from(self.size))
    }
}

/// A straight-line run of instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Address of the first instruction.
    pub ip: u64,
    /// Address right after the last instruction.
    pub end_ip: u64,
    pub ninsn: u32,
    /// Total size of the block in bytes.
    pub size: u32,
    /// Class of the last instruction.
    pub iclass: InsnClass,
    pub mode: ExecMode,
    /// Flags accumulated over the block's instructions.
    pub flags: InsnFlags,
}

impl Block {
    #[must_use]
    pub fn new(first: &Insn) -> Self {
        Self {
            ip: first.ip,
            end_ip: first.next_ip(),
            ninsn: 1,
            size: u32::from(first.size),
            iclass: first.iclass,
            mode: first.mode,
            flags: first.flags,
        }
    }

    pub fn push(&mut self, insn: &Insn) {
        self.end_ip = insn.next_ip();
        self.ninsn += 1;
        self.size += u32::from(insn.size);
        self.iclass = insn.iclass;
        self.mode = insn.mode;
        self.flags |= insn.flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insn_bytes() {
        let insn = Insn::new(0x1000, &[0x48, 0x89, 0xe5], InsnClass::Other, ExecMode::Bit64);
        assert_eq!(insn.bytes(), &[0x48, 0x89, 0xe5]);
        assert_eq!(insn.raw_bytes().len(), MAX_INSN_LEN);
        assert_eq!(insn.raw_bytes()[3..], [0; MAX_INSN_LEN - 3]);
        assert_eq!(insn.next_ip(), 0x1003);
    }

    #[test]
    fn test_insn_truncates_long_input() {
        let insn = Insn::new(0, &[0x90; 20], InsnClass::Other, ExecMode::Bit64);
        assert_eq!(usize::from(insn.size), MAX_INSN_LEN);
    }

    #[test]
    fn test_block_push() {
        let first = Insn::new(0x1000, &[0x48, 0x89, 0xe5], InsnClass::Other, ExecMode::Bit64);
        let second = Insn::new(0x1003, &[0xc3], InsnClass::Return, ExecMode::Bit64);
        let mut block = Block::new(&first);
        block.push(&second);
        assert_eq!(block.ip, 0x1000);
        assert_eq!(block.end_ip, 0x1004);
        assert_eq!(block.ninsn, 2);
        assert_eq!(block.size, 4);
        assert_eq!(block.iclass, InsnClass::Return);
    }

    #[test]
    fn test_exec_mode() {
        assert_eq!(ExecMode::try_from(32), Ok(ExecMode::Bit32));
        assert_eq!(ExecMode::try_from(8), Err(Status::BadPacket));
        assert_eq!(ExecMode::Bit16.bits(), 16);
        assert!(InsnClass::CondJump.changes_flow());
        assert!(!InsnClass::Other.changes_flow());
    }
}
