use capstone::{prelude::*, Insn as CsInsn};
use nix::errno::Errno;
use std::fmt;

use crate::{
    diag::{Error, Result},
    insn::{ExecMode, InsnClass},
};

/// A disassembled instruction, as capstone sees it.
pub struct Instruction {
    addr: u64,
    size: usize,
    mnemonic: String,
    operands: String,
}

impl Instruction {
    #[must_use]
    pub fn new(insn: &CsInsn) -> Self {
        Self {
            addr: insn.address(),
            size: insn.bytes().len(),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            operands: insn.op_str().unwrap_or("").to_string(),
        }
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        self.addr
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    #[must_use]
    pub fn class(&self) -> InsnClass {
        classify(&self.mnemonic)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.operands)
    }
}

/// Classify an AT&T mnemonic by its effect on control flow.
#[must_use]
pub fn classify(mnemonic: &str) -> InsnClass {
    let mnemonic = ["notrack ", "bnd ", "repz ", "rep "]
        .iter()
        .fold(mnemonic.trim(), |m, prefix| m.strip_prefix(prefix).unwrap_or(m));

    match mnemonic {
        m if m.starts_with("lcall") => InsnClass::FarCall,
        m if m.starts_with("call") => InsnClass::Call,
        m if m.starts_with("lret")
            || m.starts_with("iret")
            || m.starts_with("sysret")
            || m.starts_with("sysexit") =>
        {
            InsnClass::FarReturn
        }
        m if m.starts_with("ret") => InsnClass::Return,
        m if m.starts_with("ljmp") => InsnClass::FarJump,
        m if m.starts_with("jmp") => InsnClass::Jump,
        m if m.starts_with('j') || m.starts_with("loop") => InsnClass::CondJump,
        m if m.starts_with("int")
            || m.starts_with("syscall")
            || m.starts_with("sysenter") =>
        {
            InsnClass::FarCall
        }
        m if m.starts_with("ptwrite") => InsnClass::Ptwrite,
        _ => InsnClass::Other,
    }
}

/// Capstone front-end for one x86 execution mode.
pub struct Parser {
    capstone: Capstone,
}

impl Parser {
    /// Creates a 64-bit `Parser`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if there is a failure to build Capstone.
    pub fn new() -> Result<Self> {
        Self::with_mode(ExecMode::Bit64)
    }

    /// Creates a `Parser` for `mode`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if there is a failure to build Capstone.
    pub fn with_mode(mode: ExecMode) -> Result<Self> {
        let mode = match mode {
            ExecMode::Bit16 => arch::x86::ArchMode::Mode16,
            ExecMode::Bit32 => arch::x86::ArchMode::Mode32,
            ExecMode::Bit64 => arch::x86::ArchMode::Mode64,
        };
        Ok(Self {
            capstone: Capstone::new()
                .x86()
                .mode(mode)
                .syntax(arch::x86::ArchSyntax::Att)
                .build()?,
        })
    }

    /// Disassembles the first instruction in `opcode`, located at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if `opcode` does not start with a valid instruction.
    pub fn get_instruction_from(&self, opcode: &[u8], addr: u64) -> Result<Instruction> {
        let instructions = self.capstone.disasm_count(opcode, addr, 1)?;
        Ok(Instruction::new(
            instructions
                .iter()
                .next()
                .ok_or_else(|| Error::from(Errno::ENOEXEC))?,
        ))
    }
}

/// One parser per execution mode, built on first use.
#[derive(Default)]
pub struct Parsers {
    parsers: [Option<Parser>; 3],
}

impl Parsers {
    /// # Errors
    ///
    /// Returns an `Err` if the parser for `mode` cannot be built.
    pub fn get(&mut self, mode: ExecMode) -> Result<&Parser> {
        let slot = &mut self.parsers[mode.index()];
        if slot.is_none() {
            *slot = Some(Parser::with_mode(mode)?);
        }
        slot.as_ref().ok_or_else(|| Error::from(Errno::EINVAL))
    }
}
